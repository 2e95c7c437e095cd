use std::sync::Mutex;

use crate::error::Result;
use crate::pin::{Direction, Pin, Pull};

/// Identifies the physical device family behind a backend slot.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BackendKind {
    /// On-chip BCM2835 GPIO controller, accessed through a register mapping.
    Native,
    /// MCP23017 16-pin I2C port expander.
    Mcp23017,
    /// Out-of-tree backend registered through [`Registry::add_backend`].
    ///
    /// [`Registry::add_backend`]: crate::Registry::add_backend
    Custom(&'static str),
}

/// Capability contract every pin provider implements.
///
/// A backend owns a block of pins addressed by local offset `[0, pin_count())`
/// and performs the actual hardware or bus access for them. All methods take
/// `&self`; backends guard their pin cache with their own mutex so polling one
/// backend never serialises against operations on another.
///
/// Resource teardown (unmapping registers, releasing the bus) happens in
/// `Drop` when the registry removes the backend.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Quantity of pins this backend contributes to the global index space.
    fn pin_count(&self) -> usize;

    /// Bus address of the device, for backends reached over a shared bus.
    ///
    /// Used by the registry to recognise re-registration of the same chip.
    fn bus_address(&self) -> Option<u8> {
        None
    }

    /// The backend's pin cache. The registry reads cached values and toggles
    /// enabled flags through this; only the backend itself writes values.
    fn pins(&self) -> &Mutex<Vec<Pin>>;

    /// Configure a pin as input or output.
    fn set_direction(&self, offset: usize, direction: Direction) -> Result<()>;

    /// Configure a pin's pull resistor.
    fn set_pull(&self, offset: usize, pull: Pull) -> Result<()>;

    /// Drive an output pin, updating the cached value on success.
    ///
    /// Disabled pins reject the write with [`Error::PinDisabled`] carrying
    /// the local offset; the check and the write happen under the backend's
    /// pin lock so a concurrent disable cannot race the write.
    ///
    /// [`Error::PinDisabled`]: crate::Error::PinDisabled
    fn set_state(&self, offset: usize, state: bool) -> Result<()>;

    /// Refresh cached input values from hardware, reporting whether any pin
    /// changed. Backends without a poll capability return `None` and are
    /// skipped by the polling loop; their inputs are read on demand only.
    fn poll(&self) -> Option<Result<bool>> {
        None
    }
}
