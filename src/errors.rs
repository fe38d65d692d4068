use std::io;
use thiserror::Error;

/// Status codes the ventilator reports in `ER<nn>` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CieStatus {
    NoError = 0,
    CieError = 9,
    Invalid = 10,
    Syntax = 11,
    OutOfRange = 12,
    NoData = 13,
    TrendBufOvf = 14,
    ChUndefined = 15,
    CieNotConf = 16,
    Standby = 17,
    TxChksum = 18,
    BufferFull = 19,
    RxChksum = 20,
}

impl CieStatus {
    /// Map a raw `ER<nn>` code to a status, if it is one the CIE defines.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CieStatus::NoError),
            9 => Some(CieStatus::CieError),
            10 => Some(CieStatus::Invalid),
            11 => Some(CieStatus::Syntax),
            12 => Some(CieStatus::OutOfRange),
            13 => Some(CieStatus::NoData),
            14 => Some(CieStatus::TrendBufOvf),
            15 => Some(CieStatus::ChUndefined),
            16 => Some(CieStatus::CieNotConf),
            17 => Some(CieStatus::Standby),
            18 => Some(CieStatus::TxChksum),
            19 => Some(CieStatus::BufferFull),
            20 => Some(CieStatus::RxChksum),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CieError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("device reported error status {0:?}")]
    Device(CieStatus),
    #[error("response failed checksum validation (received {received}, calculated {calculated})")]
    Checksum { received: String, calculated: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not connected to a ventilator")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, CieError>;
