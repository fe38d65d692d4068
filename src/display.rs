//! Contract between the acquisition pipeline and whatever renders the data.
//!
//! The monitor pushes fully decoded, unit-converted values through this trait
//! and never learns anything about widgets or layout. A console implementation
//! is provided for the demo binary.

use std::fmt;

use log::debug;

/// A per-breath numeric reading, or the "not applicable" placeholder shown for
/// the ratio channel outside the machine-timed modes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Value(f64),
    NotApplicable,
}

impl fmt::Display for NumericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericValue::Value(v) => write!(f, "{v}"),
            NumericValue::NotApplicable => write!(f, "--"),
        }
    }
}

/// Receiver of decoded values and channel-identity changes.
///
/// Implementations only read what they are given; the sample queues and
/// connection state stay owned by the monitor.
pub trait DisplaySink {
    /// Show the ventilation mode (or a connection status message).
    fn set_mode_text(&mut self, text: &str);
    /// Append one converted point to a waveform channel.
    fn set_waveform_point(&mut self, channel: u16, value: f64);
    /// Update a numeric channel's current value.
    fn set_numeric_value(&mut self, channel: u16, value: NumericValue);
    /// Change the label/unit a channel is displayed under.
    fn rebind_channel(&mut self, channel: u16, label: &str, unit: &str);
}

/// Sink that prints to stdout, used by the demo binary. Waveform points arrive
/// at stream rate and are only logged at debug level.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl DisplaySink for ConsoleSink {
    fn set_mode_text(&mut self, text: &str) {
        println!("mode: {text}");
    }

    fn set_waveform_point(&mut self, channel: u16, value: f64) {
        debug!("waveform {channel}: {value}");
    }

    fn set_numeric_value(&mut self, channel: u16, value: NumericValue) {
        println!("ch {channel}: {value}");
    }

    fn rebind_channel(&mut self, channel: u16, label: &str, unit: &str) {
        println!("ch {channel} is now {label} ({unit})");
    }
}

/// Sink that records every call, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub mode_texts: Vec<String>,
    pub waveform: Vec<(u16, f64)>,
    pub numerics: Vec<(u16, NumericValue)>,
    pub rebinds: Vec<(u16, String, String)>,
}

#[cfg(test)]
impl DisplaySink for RecordingSink {
    fn set_mode_text(&mut self, text: &str) {
        self.mode_texts.push(text.to_string());
    }

    fn set_waveform_point(&mut self, channel: u16, value: f64) {
        self.waveform.push((channel, value));
    }

    fn set_numeric_value(&mut self, channel: u16, value: NumericValue) {
        self.numerics.push((channel, value));
    }

    fn rebind_channel(&mut self, channel: u16, label: &str, unit: &str) {
        self.rebinds
            .push((channel, label.to_string(), unit.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_value_display() {
        assert_eq!(NumericValue::Value(40.0).to_string(), "40");
        assert_eq!(NumericValue::Value(1.234).to_string(), "1.234");
        assert_eq!(NumericValue::NotApplicable.to_string(), "--");
    }
}
