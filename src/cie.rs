//! Servo CIE link driver.
//!
//! This module speaks the Clinical Information Exchange (CIE) protocol to a
//! Servo-i ventilator over a serial line: identification, protocol version
//! negotiation, channel declaration and configuration reads, stream control,
//! and the byte-driven decoder that turns the continuous data stream into
//! per-category, per-channel sample queues.
//!
//! Commands are short ASCII mnemonics terminated by EOT, most of them followed
//! by a 2-hex-digit XOR checksum. The data stream is binary: curve samples as
//! 16-bit pairs interleaved with single-byte signed deltas, breath and setting
//! frames flagged by ASCII `B`/`S`, each frame closed by an end flag and a
//! checksum byte.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channels::{unit_name, Category, ChannelConfig, DrainPolicy};
use crate::errors::{CieError, CieStatus, Result};

// ============================================================================
// Constants
// ============================================================================

/// Serial settings for the Servo-i CIE port: 9600 8E1.
const BAUD_RATE: u32 = 9600;

/// Blocking read timeout for command responses.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Single-shot curve reads can take several breath cycles to complete.
const CURVE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single command response.
const MAX_RESPONSE_LEN: usize = 4096;

/// Substring that identifies a Servo-i in the general call response.
pub const IDENTITY_MARKER: &[u8] = b"900PCI";

// Wire framing bytes.
const EOT: u8 = 0x04;
const ESCAPE: u8 = 0x1B;
const END_FLAG: u8 = 0x7F;
const PHASE_FLAG: u8 = 0x81;
const VALUE_FLAG: u8 = 0x80;
const ERROR_FLAG: u8 = 0xE0;

// ============================================================================
// Transport abstraction
// ============================================================================

/// Byte transport carrying the CIE link.
///
/// `Read` may block up to the configured timeout; `pending_bytes` never blocks
/// and is what makes the poll step cheap when nothing has arrived.
pub trait CieTransport: Read + Write + Send {
    /// Number of bytes available to read without blocking.
    fn pending_bytes(&self) -> Result<u32>;
    /// Adjust the blocking read timeout.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;
}

impl CieTransport for Box<dyn serialport::SerialPort> {
    fn pending_bytes(&self) -> Result<u32> {
        Ok(self.bytes_to_read()?)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.set_timeout(timeout)?)
    }
}

// ============================================================================
// Data types
// ============================================================================

/// Breath phase markers interleaved with the curve stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreathPhase {
    Inspiration,
    Pause,
    Expiration,
}

/// Decoder states for the continuous data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    PhaseFlag,
    PhaseData,
    CurveFirst,
    CurveSecond,
    DiffValue,
    BreathFirst,
    BreathSecond,
    SettingFirst,
    SettingSecond,
    Checksum,
}

/// XOR checksum of a command/response payload, rendered as exactly two
/// uppercase ASCII hex digits (zero-padded).
pub(crate) fn checksum(message: &[u8]) -> [u8; 2] {
    let sum = message.iter().fold(0u8, |acc, byte| acc ^ byte);
    let hex = format!("{sum:02X}");
    let bytes = hex.as_bytes();
    [bytes[0], bytes[1]]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

// ============================================================================
// Driver
// ============================================================================

/// CIE protocol driver owning the serial link and the decoded sample queues.
///
/// Queues are keyed by channel id: the decoder resolves the stream's
/// positional order against the declaration order internally, so consumers
/// never depend on positions.
pub struct ServoCie {
    transport: Box<dyn CieTransport>,
    extended_mode: bool,
    protocol_version: Option<String>,
    /// Declared channels per category, in declaration order.
    open_channels: BTreeMap<Category, Vec<u16>>,
    /// Conversion coefficients fetched per channel.
    configs: HashMap<u16, ChannelConfig>,
    /// Raw samples per category and channel, FIFO in arrival order.
    channel_data: BTreeMap<Category, BTreeMap<u16, VecDeque<i32>>>,
    stream_state: StreamState,
    stream_index: usize,
    stream_high: u8,
    phase: Option<BreathPhase>,
}

impl ServoCie {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the serial port the ventilator is attached to (9600 8E1).
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;
        Ok(Self::new(Box::new(port)))
    }

    /// Build a driver over an already-open transport.
    pub fn new(transport: Box<dyn CieTransport>) -> Self {
        Self {
            transport,
            extended_mode: false,
            protocol_version: None,
            open_channels: BTreeMap::new(),
            configs: HashMap::new(),
            channel_data: BTreeMap::new(),
            stream_state: StreamState::PhaseFlag,
            stream_index: 0,
            stream_high: 0,
            phase: None,
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Send the HELLO command (`HO`). Returns the raw response; a Servo-i
    /// answers with the identity marker. Also drops the CIE back to BASIC
    /// mode if it was in EXTENDED mode.
    pub fn general_call(&mut self) -> Result<Vec<u8>> {
        info!("Sending general call.");
        self.send_plain(b"HO")?;
        let response = self.read_until(EOT)?;
        if contains(&response, IDENTITY_MARKER) {
            if self.extended_mode {
                self.extended_mode = false;
                info!("Servo EXTENDED mode deactivated.");
            } else {
                info!("CIE<->external equipment communication okay.");
            }
        } else {
            warn!(
                "General call did not return the identity marker ({} bytes received).",
                response.len()
            );
        }
        Ok(response)
    }

    /// General call, reduced to "did the device identify as a Servo-i".
    pub fn identify(&mut self) -> Result<bool> {
        let response = self.general_call()?;
        Ok(contains(&response, IDENTITY_MARKER))
    }

    /// Read the CI type (`RCTY`), switching the CIE to EXTENDED mode and
    /// checking the Servo<->CIE internal communication status.
    pub fn read_ci_type(&mut self) -> Result<()> {
        info!("Reading Servo CI type.");
        self.send_checked(b"RCTY")?;
        let response = self.read_until(EOT)?;
        self.check_response(&response)?;
        if response.get(7) == Some(&b'0') {
            if self.extended_mode {
                info!("Servo already in EXTENDED mode, internal communication okay.");
            } else {
                self.extended_mode = true;
                info!("Servo EXTENDED mode activated.");
            }
            Ok(())
        } else {
            warn!("Servo<->CIE internal communication error.");
            Err(CieError::Device(CieStatus::CieError))
        }
    }

    /// Highest CIE protocol version the device supports (`RHVE`).
    pub fn max_protocol(&mut self) -> Result<String> {
        info!("Getting highest available protocol version.");
        self.send_checked(b"RHVE")?;
        let response = self.read_until(EOT)?;
        self.check_response(&response)?;
        let version = String::from_utf8_lossy(&response[..response.len() - 3]).into_owned();
        info!("Highest available protocol version is {version}.");
        Ok(version)
    }

    /// Select a protocol version (`SPVE`).
    pub fn set_protocol(&mut self, version: &str) -> Result<()> {
        info!("Setting CIE protocol version to {version}.");
        let mut body = b"SPVE".to_vec();
        body.extend_from_slice(version.as_bytes());
        self.send_checked(&body)?;
        let response = self.read_until(EOT)?;
        self.check_response(&response)?;
        self.protocol_version = Some(version.to_string());
        Ok(())
    }

    /// Declare the channels to stream for one category (`SDAD`). One-shot and
    /// ordered: the stream decoder matches samples to this order. An empty
    /// list clears the category's acquisition table.
    pub fn define_acquired_data(&mut self, category: Category, channels: &[u16]) -> Result<()> {
        info!("Defining {category:?} data acquisition table: {channels:?}.");
        let mut body = b"SDAD".to_vec();
        body.push(category.letter());
        for channel in channels {
            body.extend_from_slice(channel.to_string().as_bytes());
        }
        self.send_checked(&body)?;
        let response = self.read_until(EOT)?;
        self.check_response(&response)?;

        if channels.is_empty() {
            self.open_channels.remove(&category);
            self.channel_data.remove(&category);
            info!("Closed {category:?} data channels.");
        } else {
            self.open_channels.insert(category, channels.to_vec());
            self.channel_data.insert(
                category,
                channels
                    .iter()
                    .map(|&channel| (channel, VecDeque::new()))
                    .collect(),
            );
        }
        Ok(())
    }

    /// Fetch one channel's gain/offset/unit configuration (`RCCO`). Idempotent;
    /// the channel must have been declared first. Fields reported as `--`
    /// leave the corresponding coefficient unknown and the channel not ready.
    pub fn read_channel_config(&mut self, channel: u16) -> Result<()> {
        let declared = self
            .open_channels
            .values()
            .any(|channels| channels.contains(&channel));
        if !declared {
            warn!("Cannot read configuration for channel {channel}, channel is not open.");
            return Err(CieError::Device(CieStatus::Invalid));
        }

        debug!("Reading configuration for channel {channel}.");
        let mut body = b"RCCO".to_vec();
        body.extend_from_slice(channel.to_string().as_bytes());
        self.send_checked(&body)?;

        let response = self.read_until(END_FLAG)?;
        if response.len() >= 4 && &response[..2] == b"ER" {
            return Err(self.device_error(&response));
        }
        // Layout: 4-byte echo, then <ch>,<gain>,<offset>,<unit>,..., then a
        // 9-byte sampling-time/checksum trailer ending with the end flag.
        if response.len() < 14 {
            return Err(CieError::Protocol(format!(
                "channel configuration response too short ({} bytes)",
                response.len()
            )));
        }
        let body = String::from_utf8_lossy(&response[4..response.len() - 9]).into_owned();
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 4 {
            return Err(CieError::Protocol(format!(
                "malformed channel configuration: {body:?}"
            )));
        }

        let gain = parse_coefficient(fields[1])?;
        let offset = parse_coefficient(fields[2])?;
        let unit = parse_unit(fields[3]);
        let config = ChannelConfig { gain, offset, unit };
        if config.ready() {
            debug!(
                "Channel {channel} configured: gain={:?}, offset={:?}, unit={:?}.",
                config.gain, config.offset, config.unit
            );
        } else {
            warn!("Channel {channel} configuration incomplete, channel stays not ready.");
        }
        self.configs.insert(channel, config);
        Ok(())
    }

    /// Single-shot read of a category's current data (`RADA`). Curve reads use
    /// the `UC` sub-category with a longer timeout and an explicit sample
    /// count; only the device status is checked, nothing is queued.
    pub fn read_data_once(&mut self, category: Category) -> Result<()> {
        info!("Reading defined {category:?} channel values once.");
        if category == Category::Curve {
            self.send_checked(b"RADAUC000000")?;
            self.transport.set_read_timeout(CURVE_READ_TIMEOUT)?;
            let mut response = self.read_until(END_FLAG)?;
            let mut chk = [0u8; 1];
            if matches!(self.transport.read(&mut chk), Ok(1)) {
                response.push(chk[0]);
            }
            self.transport.set_read_timeout(RESPONSE_TIMEOUT)?;
            debug!("Single-shot curve read returned {} bytes.", response.len());
            Ok(())
        } else {
            let body = [b"RADA" as &[u8], &[category.letter()]].concat();
            self.send_checked(&body)?;
            let response = self.read_until(EOT)?;
            self.check_response(&response)
        }
    }

    /// Start the continuous data stream (`RADC`). Fire-and-forget: the device
    /// answers with stream data, not a command response.
    pub fn start_data_stream(&mut self) -> Result<()> {
        info!("Starting acquired data stream.");
        self.stream_reset();
        self.send_checked(b"RADC")
    }

    /// Stop the continuous data stream (ESC). Safe to call when no stream is
    /// running; a silent link is treated as already stopped.
    pub fn end_data_stream(&mut self) -> Result<()> {
        info!("Ending acquired data stream.");
        self.transport.write_all(&[ESCAPE, EOT])?;
        self.transport.flush()?;
        let trailer = self.read_until(END_FLAG)?;
        if trailer.is_empty() {
            warn!("No response to end-stream; link idle or stream already stopped.");
        } else {
            debug!("End-stream trailer: {trailer:02X?}.");
        }
        self.stream_reset();
        Ok(())
    }

    /// Read and discard everything pending on the link. Stale bytes from a
    /// prior session must never be parsed as protocol responses.
    pub fn purge_input(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        let mut discarded = 0usize;
        while self.transport.pending_bytes()? > 0 {
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if discarded > 64 * 1024 {
                break;
            }
        }
        if discarded > 0 {
            debug!("Discarded {discarded} stale bytes before negotiation.");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stream decoding
    // ------------------------------------------------------------------------

    /// Bytes available on the link without blocking.
    pub fn pending_bytes(&self) -> Result<u32> {
        self.transport.pending_bytes()
    }

    /// Drain the link's receive buffer through the stream decoder, appending
    /// raw samples to the per-channel queues. Returns promptly once nothing
    /// is pending; malformed bytes resync the decoder and are never fatal.
    pub fn read_data_stream(&mut self) -> Result<()> {
        while self.transport.pending_bytes()? > 0 {
            let mut byte = [0u8; 1];
            match self.transport.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => self.feed_stream_byte(byte[0]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn feed_stream_byte(&mut self, byte: u8) {
        match self.stream_state {
            StreamState::PhaseFlag => match byte {
                PHASE_FLAG => self.stream_state = StreamState::PhaseData,
                VALUE_FLAG => self.stream_state = StreamState::CurveFirst,
                b'B' => {
                    debug!("Reading breath data.");
                    self.stream_state = StreamState::BreathFirst;
                }
                b'S' => {
                    debug!("Reading settings data.");
                    self.stream_state = StreamState::SettingFirst;
                }
                ERROR_FLAG => self.stream_resync("device reported a stream error"),
                _ => self.stream_resync("unexpected byte between frames"),
            },
            StreamState::PhaseData => {
                let phase = match byte {
                    0x10 => Some(BreathPhase::Inspiration),
                    0x20 => Some(BreathPhase::Pause),
                    0x30 => Some(BreathPhase::Expiration),
                    _ => None,
                };
                match phase {
                    Some(phase) => {
                        debug!("{phase:?} phase.");
                        self.phase = Some(phase);
                        self.stream_state = StreamState::DiffValue;
                    }
                    None => self.stream_resync("unknown phase byte"),
                }
            }
            StreamState::CurveFirst => {
                self.stream_high = byte;
                self.stream_state = StreamState::CurveSecond;
            }
            StreamState::CurveSecond => {
                let value = (i32::from(self.stream_high) << 8) | i32::from(byte);
                self.push_sample(Category::Curve, value);
                self.stream_state = StreamState::DiffValue;
            }
            StreamState::DiffValue => match byte {
                VALUE_FLAG => self.stream_state = StreamState::CurveFirst,
                END_FLAG => self.stream_state = StreamState::Checksum,
                PHASE_FLAG => self.stream_state = StreamState::PhaseData,
                _ => {
                    let mut delta = i32::from(byte);
                    if delta >= 0x82 {
                        delta -= 256;
                    }
                    self.push_delta(delta);
                }
            },
            StreamState::BreathFirst => {
                if byte == END_FLAG {
                    self.stream_state = StreamState::Checksum;
                } else {
                    self.stream_high = byte;
                    self.stream_state = StreamState::BreathSecond;
                }
            }
            StreamState::BreathSecond => {
                let value = (i32::from(self.stream_high) << 8) | i32::from(byte);
                self.push_sample(Category::Breath, value);
                self.stream_state = StreamState::BreathFirst;
            }
            StreamState::SettingFirst => {
                if byte == END_FLAG {
                    self.stream_state = StreamState::Checksum;
                } else {
                    self.stream_high = byte;
                    self.stream_state = StreamState::SettingSecond;
                }
            }
            StreamState::SettingSecond => {
                let value = (i32::from(self.stream_high) << 8) | i32::from(byte);
                self.push_sample(Category::Setting, value);
                self.stream_state = StreamState::SettingFirst;
            }
            StreamState::Checksum => {
                // Frame checksum byte; consumed, frame complete.
                debug!("Got end flag and check sum.");
                self.stream_index = 0;
                self.stream_state = StreamState::PhaseFlag;
            }
        }
    }

    fn push_sample(&mut self, category: Category, value: i32) {
        let channel = {
            let Some(channels) = self.open_channels.get(&category) else {
                return self.stream_resync("sample for undeclared category");
            };
            if channels.is_empty() {
                return self.stream_resync("sample for empty category");
            }
            channels[self.stream_index % channels.len()]
        };
        self.stream_index = (self.stream_index + 1) % self.open_channels[&category].len();
        self.channel_data
            .entry(category)
            .or_default()
            .entry(channel)
            .or_default()
            .push_back(value);
        debug!("Got {category:?} data ({value}) for channel {channel}.");
    }

    fn push_delta(&mut self, delta: i32) {
        let channel = {
            let Some(channels) = self.open_channels.get(&Category::Curve) else {
                return self.stream_resync("differential value for undeclared curve category");
            };
            if channels.is_empty() {
                return self.stream_resync("differential value for empty curve category");
            }
            channels[self.stream_index % channels.len()]
        };
        let last = self
            .channel_data
            .get(&Category::Curve)
            .and_then(|queues| queues.get(&channel))
            .and_then(|queue| queue.back().copied());
        let Some(last) = last else {
            return self.stream_resync("differential value with no base sample");
        };
        self.stream_index = (self.stream_index + 1) % self.open_channels[&Category::Curve].len();
        self.channel_data
            .entry(Category::Curve)
            .or_default()
            .entry(channel)
            .or_default()
            .push_back(last + delta);
        debug!("Got differential data ({delta}) for channel {channel}.");
    }

    fn stream_resync(&mut self, why: &str) {
        error!("Data streaming error ({why}), attempting to re-sync with stream.");
        self.stream_state = StreamState::PhaseFlag;
        self.stream_index = 0;
    }

    fn stream_reset(&mut self) {
        self.stream_state = StreamState::PhaseFlag;
        self.stream_index = 0;
        self.stream_high = 0;
        self.phase = None;
    }

    // ------------------------------------------------------------------------
    // Queue and registry access
    // ------------------------------------------------------------------------

    /// Declared channels for a category, in declaration order.
    pub fn declared_channels(&self, category: Category) -> &[u16] {
        self.open_channels
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Conversion configuration for a channel, if it has been read.
    pub fn channel_config(&self, channel: u16) -> Option<&ChannelConfig> {
        self.configs.get(&channel)
    }

    /// Number of raw values queued for a channel.
    pub fn queued(&self, category: Category, channel: u16) -> usize {
        self.channel_data
            .get(&category)
            .and_then(|queues| queues.get(&channel))
            .map_or(0, VecDeque::len)
    }

    /// Remove queued raw values for one channel according to the drain policy,
    /// oldest first.
    pub fn drain(&mut self, category: Category, channel: u16, policy: DrainPolicy) -> Vec<i32> {
        let Some(queue) = self
            .channel_data
            .get_mut(&category)
            .and_then(|queues| queues.get_mut(&channel))
        else {
            return Vec::new();
        };
        let keep = match policy {
            DrainPolicy::All => 0,
            DrainPolicy::KeepLast => 1,
        };
        let take = queue.len().saturating_sub(keep);
        queue.drain(..take).collect()
    }

    /// Breath phase most recently seen in the curve stream.
    pub fn current_phase(&self) -> Option<BreathPhase> {
        self.phase
    }

    /// Protocol version selected during negotiation, if any.
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Override the blocking timeout used for command responses.
    pub fn set_response_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.transport.set_read_timeout(timeout)
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    /// Send a command without checksum (general call only).
    fn send_plain(&mut self, body: &[u8]) -> Result<()> {
        let mut message = body.to_vec();
        message.push(EOT);
        debug!("Message to Servo: {message:02X?}");
        self.transport.write_all(&message)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Send a command with the trailing XOR checksum.
    fn send_checked(&mut self, body: &[u8]) -> Result<()> {
        let mut message = body.to_vec();
        message.extend_from_slice(&checksum(body));
        message.push(EOT);
        debug!("Message to Servo: {message:02X?}");
        self.transport.write_all(&message)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Read bytes until the delimiter (inclusive). A timeout yields whatever
    /// arrived so far, possibly nothing; callers validate the content.
    fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        let mut response = Vec::with_capacity(64);
        loop {
            let mut byte = [0u8; 1];
            match self.transport.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    response.push(byte[0]);
                    if byte[0] == delimiter {
                        break;
                    }
                    if response.len() >= MAX_RESPONSE_LEN {
                        warn!("Response exceeded {MAX_RESPONSE_LEN} bytes without delimiter.");
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Servo response: {response:02X?}");
        Ok(response)
    }

    /// Validate an ASCII command response: reported errors, then the trailing
    /// checksum before EOT.
    fn check_response(&self, response: &[u8]) -> Result<()> {
        if response.len() >= 4 && &response[..2] == b"ER" {
            return Err(self.device_error(response));
        }
        if response.len() < 3 || response.last() != Some(&EOT) {
            return Err(CieError::Protocol(format!(
                "short or unterminated response ({} bytes)",
                response.len()
            )));
        }
        let payload = &response[..response.len() - 3];
        let received = &response[response.len() - 3..response.len() - 1];
        let calculated = checksum(payload);
        if received != calculated {
            return Err(CieError::Checksum {
                received: String::from_utf8_lossy(received).into_owned(),
                calculated: String::from_utf8_lossy(&calculated).into_owned(),
            });
        }
        Ok(())
    }

    fn device_error(&self, response: &[u8]) -> CieError {
        let code = std::str::from_utf8(&response[2..4])
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .and_then(CieStatus::from_code);
        match code {
            Some(status) => {
                error!("Error code in received message: {status:?}");
                CieError::Device(status)
            }
            None => CieError::Protocol(format!(
                "unrecognized error response: {:?}",
                String::from_utf8_lossy(response)
            )),
        }
    }
}

/// Parse a gain/offset field: 5-character mantissa followed by a 4-character
/// power-of-ten exponent. `--` fields mean the coefficient is not provided.
fn parse_coefficient(field: &str) -> Result<Option<f64>> {
    if field.contains("--") {
        return Ok(None);
    }
    if !field.is_ascii() || field.len() < 9 {
        return Err(CieError::Protocol(format!(
            "malformed conversion coefficient: {field:?}"
        )));
    }
    let mantissa: i32 = field[..5]
        .parse()
        .map_err(|_| CieError::Protocol(format!("bad coefficient mantissa: {field:?}")))?;
    let exponent: i32 = field[field.len() - 4..]
        .parse()
        .map_err(|_| CieError::Protocol(format!("bad coefficient exponent: {field:?}")))?;
    Ok(Some(f64::from(mantissa) * 10f64.powi(exponent)))
}

fn parse_unit(field: &str) -> Option<String> {
    if field.contains("--") {
        return None;
    }
    field
        .trim_start_matches('0')
        .parse::<u16>()
        .ok()
        .and_then(unit_name)
        .map(str::to_string)
}

// ============================================================================
// Test utilities
// ============================================================================

/// In-memory transport scripted with request/response pairs: each
/// EOT-terminated write releases the next queued reply into the read buffer.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Inner {
        input: VecDeque<u8>,
        written: Vec<u8>,
        replies: VecDeque<Vec<u8>>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct ScriptedPort {
        inner: Arc<Mutex<Inner>>,
    }

    impl ScriptedPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the reply released by the next EOT-terminated write.
        pub fn queue_reply(&self, bytes: impl Into<Vec<u8>>) {
            self.inner.lock().unwrap().replies.push_back(bytes.into());
        }

        /// Make bytes immediately available to read (stream data, stale input).
        pub fn push_input(&self, bytes: &[u8]) {
            self.inner.lock().unwrap().input.extend(bytes);
        }

        /// Everything the host has written so far.
        pub fn written(&self) -> Vec<u8> {
            self.inner.lock().unwrap().written.clone()
        }

        /// Build a checksummed ASCII response: payload + XOR checksum + EOT.
        pub fn reply(payload: &[u8]) -> Vec<u8> {
            let mut out = payload.to_vec();
            out.extend_from_slice(&checksum(payload));
            out.push(EOT);
            out
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.input.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "scripted port empty"));
            }
            let n = buf.len().min(inner.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inner.input.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            for &byte in buf {
                inner.written.push(byte);
                if byte == EOT {
                    if let Some(reply) = inner.replies.pop_front() {
                        inner.input.extend(reply);
                    }
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CieTransport for ScriptedPort {
        fn pending_bytes(&self) -> Result<u32> {
            Ok(self.inner.lock().unwrap().input.len() as u32)
        }

        fn set_read_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    /// A valid RCCO response for one channel with the given raw fields.
    pub fn channel_config_reply(channel: u16, gain: &str, offset: &str, unit: &str) -> Vec<u8> {
        let mut out = b"RCCO".to_vec();
        out.extend_from_slice(format!("{channel:04},{gain},{offset},{unit},BT").as_bytes());
        out.extend_from_slice(b";0000000\x7F");
        out
    }
}

// ============================================================================
// Tests
// ============================================================================
