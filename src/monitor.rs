//! Connection lifecycle and acquisition loop.
//!
//! [`Monitor`] owns the link driver and a [`DisplaySink`], walks the
//! negotiation sequence (identify, CI type, protocol version, channel
//! declaration and configuration, stream start), then converts queued raw
//! samples to display updates on every poll. Mode changes arriving on the
//! setting stream re-label the dual-identity ratio channel before any breath
//! data from the same poll is interpreted.

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::channels::{
    is_ratio_mode, mode_name, ratio_binding, Category, ChannelPlan, MODE_CHANNEL, RATIO_CHANNEL,
};
use crate::cie::{CieTransport, ServoCie};
use crate::display::{DisplaySink, NumericValue};
use crate::errors::{CieError, Result};

// ============================================================================
// Configuration and state
// ============================================================================

/// Status texts shown in the mode slot while no mode data is available.
const NOT_CONNECTED_TEXT: &str = "Ventilator not connected";
const CONNECT_FAILED_TEXT: &str = "Failed to connect to Servo-i.";
const WAITING_FOR_MODE_TEXT: &str = "Ventilator connected, waiting for Mode data";
const MODE_NOT_FOUND_TEXT: &str = "Ventilator Mode Not Found";

/// Tunables for a monitoring session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the owner should call [`Monitor::poll`].
    pub poll_interval: Duration,
    /// Blocking timeout for command responses during negotiation.
    pub response_timeout: Duration,
    /// Channels to declare, per category.
    pub plan: ChannelPlan,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            response_timeout: Duration::from_secs(1),
            plan: ChannelPlan::servo_default(),
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Negotiating,
    Streaming,
    Failed,
}

// ============================================================================
// Monitor
// ============================================================================

/// Ventilator monitoring session: link driver plus display sink.
pub struct Monitor<S: DisplaySink> {
    servo: Option<ServoCie>,
    sink: S,
    config: MonitorConfig,
    state: ConnectionState,
    /// Latest known ventilation mode name; `None` until mode data arrives or
    /// after an unknown mode code.
    current_mode: Option<&'static str>,
}

impl<S: DisplaySink> Monitor<S> {
    pub fn new(mut sink: S, config: MonitorConfig) -> Self {
        sink.set_mode_text(NOT_CONNECTED_TEXT);
        Self {
            servo: None,
            sink,
            config,
            state: ConnectionState::Disconnected,
            current_mode: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn current_mode(&self) -> Option<&'static str> {
        self.current_mode
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// The link driver, once a connection attempt has been made.
    pub fn servo(&self) -> Option<&ServoCie> {
        self.servo.as_ref()
    }

    /// Open the serial port and negotiate a streaming session.
    pub fn connect(&mut self, port: &str) -> Result<()> {
        info!("Connecting to ventilator on {port}.");
        match ServoCie::open(port) {
            Ok(servo) => self.start_session(servo),
            Err(e) => {
                warn!("Failed to open {port}: {e}");
                self.sink.set_mode_text(CONNECT_FAILED_TEXT);
                Err(e)
            }
        }
    }

    /// Negotiate a streaming session over an already-open transport.
    pub fn connect_with(&mut self, transport: Box<dyn CieTransport>) -> Result<()> {
        self.start_session(ServoCie::new(transport))
    }

    fn start_session(&mut self, mut servo: ServoCie) -> Result<()> {
        if let Err(e) = servo.set_response_timeout(self.config.response_timeout) {
            warn!("Could not set response timeout: {e}");
        }
        self.servo = Some(servo);
        self.state = ConnectionState::Negotiating;
        self.current_mode = None;
        match self.negotiate() {
            Ok(()) => {
                self.state = ConnectionState::Streaming;
                info!("Negotiation complete, data stream running.");
                Ok(())
            }
            Err(e) => {
                warn!("Negotiation failed: {e}");
                self.state = ConnectionState::Failed;
                self.sink.set_mode_text(CONNECT_FAILED_TEXT);
                Err(e)
            }
        }
    }

    /// The negotiation sequence. Any error aborts the attempt; the only
    /// recovery built in is a single end-stream-and-retry of the general call,
    /// covering a device left streaming by a previous session.
    fn negotiate(&mut self) -> Result<()> {
        let servo = self.servo.as_mut().ok_or(CieError::NotConnected)?;

        servo.purge_input()?;

        if !servo.identify()? {
            warn!("No identification; ending any running data stream and retrying.");
            servo.end_data_stream()?;
            if !servo.identify()? {
                return Err(CieError::Protocol(
                    "device did not identify as a Servo-i".to_string(),
                ));
            }
        }

        servo.read_ci_type()?;
        let version = servo.max_protocol()?;
        servo.set_protocol(&version)?;

        servo.define_acquired_data(Category::Breath, &self.config.plan.ids(Category::Breath))?;
        servo.define_acquired_data(Category::Curve, &self.config.plan.ids(Category::Curve))?;
        servo.define_acquired_data(Category::Setting, &self.config.plan.ids(Category::Setting))?;

        // A channel whose configuration cannot be read simply stays not ready;
        // its raw values are withheld rather than shown unconverted.
        for category in Category::ALL {
            for channel in self.config.plan.ids(category) {
                if let Err(e) = servo.read_channel_config(channel) {
                    warn!("Could not read configuration for channel {channel}: {e}");
                }
            }
        }

        self.sink.set_mode_text(WAITING_FOR_MODE_TEXT);
        servo.start_data_stream()
    }

    /// One acquisition step: pull everything pending off the link, decode it,
    /// and forward converted values to the sink. Cheap when nothing arrived;
    /// a no-op unless the session is streaming.
    pub fn poll(&mut self) -> Result<()> {
        if self.state != ConnectionState::Streaming {
            return Ok(());
        }
        match self.poll_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Acquisition error, stopping session: {e}");
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    fn poll_inner(&mut self) -> Result<()> {
        let servo = self.servo.as_mut().ok_or(CieError::NotConnected)?;
        if servo.pending_bytes()? == 0 {
            return Ok(());
        }
        servo.read_data_stream()?;
        drain_pending(servo, &mut self.sink, &mut self.current_mode);
        Ok(())
    }

    /// Tear the session down. Idempotent; the data stream is only ended when
    /// one may be running.
    pub fn disconnect(&mut self) {
        let Some(mut servo) = self.servo.take() else {
            return;
        };
        if matches!(
            self.state,
            ConnectionState::Streaming | ConnectionState::Failed
        ) {
            if let Err(e) = servo.end_data_stream() {
                warn!("Could not end data stream cleanly: {e}");
            }
        }
        self.state = ConnectionState::Disconnected;
        self.current_mode = None;
        self.sink.set_mode_text(NOT_CONNECTED_TEXT);
        info!("Disconnected from ventilator.");
    }
}

// ============================================================================
// Drain step
// ============================================================================

/// Forward everything queued to the sink. Settings are drained before breath
/// data so a mode change re-labels the ratio channel before any ratio value
/// from the same batch is interpreted.
fn drain_pending<S: DisplaySink>(
    servo: &mut ServoCie,
    sink: &mut S,
    current_mode: &mut Option<&'static str>,
) {
    for category in [Category::Curve, Category::Setting, Category::Breath] {
        let channels = servo.declared_channels(category).to_vec();
        for channel in channels {
            let raws = servo.drain(category, channel, category.drain_policy());
            if raws.is_empty() {
                continue;
            }
            let config = servo.channel_config(channel).cloned();
            match category {
                Category::Curve => {
                    for raw in raws {
                        match config.as_ref().and_then(|c| c.convert(raw)) {
                            Some(value) => sink.set_waveform_point(channel, value),
                            None => {
                                debug!("Curve channel {channel} not ready, dropping sample {raw}.")
                            }
                        }
                    }
                }
                Category::Setting => {
                    if channel == MODE_CHANNEL {
                        for raw in raws {
                            apply_mode(raw, sink, current_mode);
                        }
                    } else {
                        debug!("Ignoring {} values for setting channel {channel}.", raws.len());
                    }
                }
                Category::Breath => {
                    let ratio_applicable = current_mode.map_or(false, is_ratio_mode);
                    for raw in raws {
                        if channel == RATIO_CHANNEL && !ratio_applicable {
                            sink.set_numeric_value(channel, NumericValue::NotApplicable);
                            continue;
                        }
                        match config.as_ref().and_then(|c| c.convert(raw)) {
                            Some(value) => {
                                sink.set_numeric_value(channel, NumericValue::Value(value))
                            }
                            None => {
                                debug!("Breath channel {channel} not ready, dropping value {raw}.")
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Apply one raw ventilation-mode code: update the mode text and re-label the
/// ratio channel. Unknown codes clear the known mode so ratio values are
/// withheld until a recognizable mode arrives.
fn apply_mode<S: DisplaySink>(code: i32, sink: &mut S, current_mode: &mut Option<&'static str>) {
    let name = u16::try_from(code).ok().and_then(mode_name);
    match name {
        Some(name) => {
            if *current_mode != Some(name) {
                info!("Ventilation mode: {name}.");
            }
            *current_mode = Some(name);
            sink.set_mode_text(name);
            let (label, unit) = ratio_binding(name);
            sink.rebind_channel(RATIO_CHANNEL, label, unit);
        }
        None => {
            warn!("Unknown ventilation mode code {code}.");
            *current_mode = None;
            sink.set_mode_text(MODE_NOT_FOUND_TEXT);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSpec;
    use crate::cie::testutil::{channel_config_reply, ScriptedPort};
    use crate::display::RecordingSink;

    const EOT: u8 = 0x04;
    const ESCAPE: u8 = 0x1B;

    /// Small plan keeping the scripted reply sequences readable: one curve
    /// channel, RR plus the ratio channel, and the mode setting channel.
    fn test_plan() -> ChannelPlan {
        ChannelPlan {
            curve: vec![ChannelSpec {
                id: 100,
                label: "Flow".to_string(),
                unit: "l/min BTPS".to_string(),
            }],
            breath: vec![
                ChannelSpec {
                    id: 200,
                    label: "RR".to_string(),
                    unit: "br/min".to_string(),
                },
                ChannelSpec {
                    id: 238,
                    label: "I:E".to_string(),
                    unit: "ratio".to_string(),
                },
            ],
            setting: vec![ChannelSpec {
                id: 310,
                label: "Ventilation Mode".to_string(),
                unit: String::new(),
            }],
        }
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            plan: test_plan(),
            ..MonitorConfig::default()
        }
    }

    /// Queue the full happy-path negotiation reply script for [`test_plan`].
    /// Channel 100 converts with gain 0.5 / offset 10, channel 200 with
    /// gain 1 / offset 0, channel 238 with gain 0.1 / offset 0.
    fn queue_negotiation_replies(port: &ScriptedPort) {
        port.queue_reply(b"900PCI\x04".to_vec()); // HO
        port.queue_reply(ScriptedPort::reply(b"RCTY0000")); // RCTY, healthy
        port.queue_reply(ScriptedPort::reply(b"0020")); // RHVE
        port.queue_reply(ScriptedPort::reply(b"OK")); // SPVE
        port.queue_reply(ScriptedPort::reply(b"OK")); // SDAD B
        port.queue_reply(ScriptedPort::reply(b"OK")); // SDAD C
        port.queue_reply(ScriptedPort::reply(b"OK")); // SDAD S
        port.queue_reply(channel_config_reply(100, "+0005-001", "+0001+001", "008"));
        port.queue_reply(channel_config_reply(200, "+0001+000", "+0000+000", "006"));
        port.queue_reply(channel_config_reply(238, "+0001-001", "+0000+000", "020"));
        port.queue_reply(channel_config_reply(310, "+0001+000", "+0000+000", "020"));
        // RADC gets stream data, not a command response.
    }

    fn streaming_monitor(port: &ScriptedPort) -> Monitor<RecordingSink> {
        queue_negotiation_replies(port);
        let mut monitor = Monitor::new(RecordingSink::default(), test_config());
        monitor
            .connect_with(Box::new(port.clone()))
            .expect("negotiation should succeed");
        assert_eq!(monitor.state(), ConnectionState::Streaming);
        monitor
    }

    fn count_commands(written: &[u8], command: &[u8]) -> usize {
        written
            .windows(command.len())
            .filter(|window| *window == command)
            .count()
    }

    #[test]
    fn negotiation_reaches_streaming() {
        let port = ScriptedPort::new();
        let monitor = streaming_monitor(&port);

        let texts = &monitor.sink().mode_texts;
        assert_eq!(
            texts.as_slice(),
            &[NOT_CONNECTED_TEXT, WAITING_FOR_MODE_TEXT]
        );
        let servo = monitor.servo().expect("driver present");
        assert_eq!(servo.protocol_version(), Some("0020"));
        assert_eq!(servo.declared_channels(Category::Breath), &[200, 238]);
        assert!(servo.channel_config(100).is_some_and(|c| c.ready()));

        let written = port.written();
        assert_eq!(count_commands(&written, &[b'H', b'O', EOT]), 1);
        assert_eq!(count_commands(&written, b"RADC"), 1);
    }

    #[test]
    fn stale_input_is_purged_before_negotiation() {
        let port = ScriptedPort::new();
        port.push_input(&[0x80, 0x01, 0x02, 0x7F, 0x00]); // leftover stream bytes
        let monitor = streaming_monitor(&port);
        assert_eq!(monitor.state(), ConnectionState::Streaming);
    }

    #[test]
    fn identification_retries_once_after_ending_stream() {
        let port = ScriptedPort::new();
        port.queue_reply(b"\x80\x01\x02\x04".to_vec()); // HO answered by stream garbage
        port.queue_reply(b"\x7F".to_vec()); // end-stream trailer
        queue_negotiation_replies(&port); // second HO onwards succeeds

        let mut monitor = Monitor::new(RecordingSink::default(), test_config());
        monitor
            .connect_with(Box::new(port.clone()))
            .expect("retry should succeed");
        assert_eq!(monitor.state(), ConnectionState::Streaming);

        let written = port.written();
        assert_eq!(count_commands(&written, &[b'H', b'O', EOT]), 2);
        assert_eq!(count_commands(&written, &[ESCAPE, EOT]), 1);
    }

    #[test]
    fn negotiation_fails_after_second_missed_identification() {
        let port = ScriptedPort::new();
        port.queue_reply(b"GARBAGE\x04".to_vec());
        port.queue_reply(b"\x7F".to_vec());
        port.queue_reply(b"STILLGARBAGE\x04".to_vec());

        let mut monitor = Monitor::new(RecordingSink::default(), test_config());
        assert!(monitor.connect_with(Box::new(port.clone())).is_err());
        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert_eq!(
            monitor.sink().mode_texts.last().map(String::as_str),
            Some(CONNECT_FAILED_TEXT)
        );

        let written = port.written();
        assert_eq!(count_commands(&written, &[b'H', b'O', EOT]), 2);
        assert_eq!(count_commands(&written, b"RADC"), 0);
    }

    #[test]
    fn channel_config_failure_is_not_fatal() {
        let port = ScriptedPort::new();
        port.queue_reply(b"900PCI\x04".to_vec());
        port.queue_reply(ScriptedPort::reply(b"RCTY0000"));
        port.queue_reply(ScriptedPort::reply(b"0020"));
        port.queue_reply(ScriptedPort::reply(b"OK"));
        port.queue_reply(ScriptedPort::reply(b"OK"));
        port.queue_reply(ScriptedPort::reply(b"OK"));
        port.queue_reply(ScriptedPort::reply(b"OK"));
        port.queue_reply(channel_config_reply(100, "+0005-001", "+0001+001", "008"));
        port.queue_reply(b"ER13xx\x7F".to_vec()); // channel 200 has no data yet
        port.queue_reply(channel_config_reply(238, "+0001-001", "+0000+000", "020"));
        port.queue_reply(channel_config_reply(310, "+0001+000", "+0000+000", "020"));

        let mut monitor = Monitor::new(RecordingSink::default(), test_config());
        monitor
            .connect_with(Box::new(port.clone()))
            .expect("one unreadable channel must not abort negotiation");
        assert_eq!(monitor.state(), ConnectionState::Streaming);
        let servo = monitor.servo().expect("driver present");
        assert!(servo.channel_config(200).is_none());
        assert!(servo.channel_config(238).is_some());
    }

    #[test]
    fn poll_is_a_noop_when_not_streaming() {
        let port = ScriptedPort::new();
        port.push_input(&[0x80, 0x00, 0x01]);
        let mut monitor = Monitor::new(RecordingSink::default(), test_config());
        assert!(monitor.poll().is_ok());
        assert!(monitor.sink().waveform.is_empty());
    }

    #[test]
    fn mode_change_updates_text_and_ratio_binding() {
        let port = ScriptedPort::new();
        let mut monitor = streaming_monitor(&port);

        // Mode 2: Pressure Control, a machine-timed mode.
        port.push_input(&[b'S', 0x00, 0x02, 0x7F, 0x00]);
        monitor.poll().unwrap();
        assert_eq!(monitor.current_mode(), Some("Pressure Control"));
        assert_eq!(
            monitor.sink().mode_texts.last().map(String::as_str),
            Some("Pressure Control")
        );
        assert_eq!(
            monitor.sink().rebinds.last(),
            Some(&(238, "I:E".to_string(), "ratio".to_string()))
        );

        // Ratio value 15 converts with gain 0.1 and is applicable.
        port.push_input(&[b'B', 0x00, 0x12, 0x00, 0x0F, 0x7F, 0x00]);
        monitor.poll().unwrap();
        assert_eq!(
            monitor.sink().numerics.as_slice(),
            &[
                (200, NumericValue::Value(18.0)),
                (238, NumericValue::Value(1.5))
            ]
        );

        // Mode 8: Pressure Support / CPAP, patient-triggered.
        port.push_input(&[b'S', 0x00, 0x08, 0x7F, 0x00]);
        monitor.poll().unwrap();
        assert_eq!(monitor.current_mode(), Some("Pressure Support / CPAP"));
        assert_eq!(
            monitor.sink().rebinds.last(),
            Some(&(238, "Ti:Ttot".to_string(), "ratio".to_string()))
        );

        // The same raw ratio value is now shown as not applicable.
        port.push_input(&[b'B', 0x00, 0x12, 0x00, 0x0F, 0x7F, 0x00]);
        monitor.poll().unwrap();
        assert_eq!(
            monitor.sink().numerics.last(),
            Some(&(238, NumericValue::NotApplicable))
        );
    }

    #[test]
    fn unknown_mode_code_clears_mode_and_withholds_ratio() {
        let port = ScriptedPort::new();
        let mut monitor = streaming_monitor(&port);

        port.push_input(&[b'S', 0x00, 0x63, 0x7F, 0x00]); // mode code 99
        monitor.poll().unwrap();
        assert_eq!(monitor.current_mode(), None);
        assert_eq!(
            monitor.sink().mode_texts.last().map(String::as_str),
            Some(MODE_NOT_FOUND_TEXT)
        );

        port.push_input(&[b'B', 0x00, 0x12, 0x00, 0x0F, 0x7F, 0x00]);
        monitor.poll().unwrap();
        assert_eq!(
            monitor.sink().numerics.last(),
            Some(&(238, NumericValue::NotApplicable))
        );
    }

    #[test]
    fn mode_precedes_breath_data_within_one_poll() {
        let port = ScriptedPort::new();
        let mut monitor = streaming_monitor(&port);

        // Mode change and a ratio value arrive in the same batch; the mode
        // must be applied first so the ratio value is interpreted as I:E.
        port.push_input(&[
            b'S', 0x00, 0x02, 0x7F, 0x00, // Pressure Control
            b'B', 0x00, 0x12, 0x00, 0x0F, 0x7F, 0x00,
        ]);
        monitor.poll().unwrap();
        assert_eq!(
            monitor.sink().numerics.last(),
            Some(&(238, NumericValue::Value(1.5)))
        );
    }

    #[test]
    fn curve_drain_keeps_latest_sample_queued() {
        let port = ScriptedPort::new();
        let mut monitor = streaming_monitor(&port);

        // Raw 100, 101, 102 on channel 100 (gain 0.5, offset 10).
        port.push_input(&[0x80, 0x00, 0x64, 0x01, 0x01, 0x7F, 0x00]);
        monitor.poll().unwrap();

        assert_eq!(monitor.sink().waveform.as_slice(), &[(100, 40.0), (100, 40.5)]);
        let servo = monitor.servo().expect("driver present");
        assert_eq!(servo.queued(Category::Curve, 100), 1);
    }

    #[test]
    fn breath_queues_are_fully_drained() {
        let port = ScriptedPort::new();
        let mut monitor = streaming_monitor(&port);

        port.push_input(&[b'S', 0x00, 0x02, 0x7F, 0x00]);
        port.push_input(&[
            b'B', 0x00, 0x10, 0x00, 0x0A, 0x7F, 0x00, // 16 -> 200, 10 -> 238
            b'B', 0x00, 0x12, 0x00, 0x0F, 0x7F, 0x00, // 18 -> 200, 15 -> 238
        ]);
        monitor.poll().unwrap();

        let values: Vec<_> = monitor
            .sink()
            .numerics
            .iter()
            .filter(|(channel, _)| *channel == 200)
            .collect();
        assert_eq!(
            values,
            vec![
                &(200, NumericValue::Value(16.0)),
                &(200, NumericValue::Value(18.0))
            ]
        );
        let servo = monitor.servo().expect("driver present");
        assert_eq!(servo.queued(Category::Breath, 200), 0);
        assert_eq!(servo.queued(Category::Breath, 238), 0);
    }

    #[test]
    fn disconnect_ends_stream_once_and_is_idempotent() {
        let port = ScriptedPort::new();
        let mut monitor = streaming_monitor(&port);

        monitor.disconnect();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert_eq!(
            monitor.sink().mode_texts.last().map(String::as_str),
            Some(NOT_CONNECTED_TEXT)
        );

        monitor.disconnect();
        let written = port.written();
        assert_eq!(count_commands(&written, &[ESCAPE, EOT]), 1);
    }
}
