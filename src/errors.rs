//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("board I/O failure on {board}: {source}")]
    BoardIo {
        board: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open board {serial}: {reason}")]
    BoardOpen { serial: String, reason: String },

    #[error("board reported malformed firmware version")]
    MalformedFirmware,

    #[error("board reported malformed serial")]
    MalformedSerial,

    #[error("GPS I/O failure: {0}")]
    GpsIo(#[source] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("failed to decode CarParams: {0}")]
    CarParamsDecode(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
