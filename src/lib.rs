//! Servo-i ventilator monitoring over the CIE serial protocol.
//!
//! This crate connects to a Maquet Servo-i ventilator's Clinical Information
//! Exchange (CIE) port, negotiates a streaming session, and decodes the
//! continuous data stream into display updates: waveform points for curve
//! channels, per-breath numerics, and the active ventilation mode.
//!
//! The main entry point is [`Monitor`], which drives the [`ServoCie`] link
//! driver and pushes converted values into a [`DisplaySink`] implementation.
//!
//! # Data flow
//!
//! 1. [`Monitor::connect`] opens the serial port (9600 8E1) and negotiates:
//!    identification, CI type, protocol version, channel declaration and
//!    per-channel gain/offset configuration, then stream start.
//! 2. [`Monitor::poll`], called at a short interval, drains the link through
//!    the stream decoder and forwards converted values to the sink.
//! 3. Mode changes on the setting stream re-label the dual-identity ratio
//!    channel (I:E in machine-timed modes, Ti:Ttot otherwise).

mod channels;
mod cie;
mod display;
mod errors;
mod logging;
mod monitor;

pub use channels::{
    is_ratio_mode, mode_name, ratio_binding, round3, unit_name, Category, ChannelConfig,
    ChannelPlan, ChannelSpec, DrainPolicy, MODE_CHANNEL, RATIO_CHANNEL, RATIO_MODES,
};
pub use cie::{BreathPhase, CieTransport, ServoCie, IDENTITY_MARKER};
pub use display::{ConsoleSink, DisplaySink, NumericValue};
pub use errors::{CieError, CieStatus, Result};
pub use logging::init_logging;
pub use monitor::{ConnectionState, Monitor, MonitorConfig};
