use std::io;

use thiserror::Error;

/// Errors raised by the GPI layer.
///
/// Failure is always local: a backend that cannot be constructed aborts only
/// its own registration, and a per-pin failure never takes down the polling
/// loop or the process.
#[derive(Debug, Error)]
pub enum Error {
    /// The bus character device could not be opened.
    #[error("bus device {path} unavailable: {source}")]
    TransportUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A transport operation was attempted before a target chip was selected.
    #[error("no target chip selected on the bus")]
    NoTarget,

    /// The GPIO register block could not be opened or mapped.
    #[error("mapping GPIO registers failed: {0}")]
    MapFailed(#[source] io::Error),

    /// Every backend slot is occupied.
    #[error("no free backend slot (capacity {0})")]
    RegistryFull(usize),

    /// Flat pin number outside `[0, count())`.
    #[error("pin {0} is out of range")]
    InvalidPin(u32),

    /// Write attempted on a pin that is currently disabled.
    #[error("pin {0} is disabled")]
    PinDisabled(u32),

    /// Backend slot index that does not name an occupied slot.
    #[error("backend slot {0} is not occupied")]
    InvalidSlot(usize),

    /// Expander chip address outside the documented range.
    #[error("invalid chip address {0:#04x} (expected 0x20..=0x27)")]
    InvalidAddress(u8),

    /// The owning backend cannot perform the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Byte transfer failure on an open transport.
    #[error("bus transfer failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
