//! Pluggable GPI abstraction for Raspberry Pi class boards.
//!
//! Every digital pin, whether it lives on the SoC's own GPIO controller or
//! on an I2C port expander, is addressed through one flat, contiguous index
//! space, so application code never needs to know which chip a pin belongs
//! to. Backends register with the [`Registry`], which maps flat pin numbers
//! to (backend, local offset) pairs; a background [`Poller`] keeps input
//! caches fresh for backends that support polling.
//!
//! # Example
//!
//! ```rust,no_run
//! use rpi_gpi::{Direction, Poller, Pull, Registry};
//!
//! # fn main() -> anyhow::Result<()> {
//! let registry = Registry::new();
//! registry.add_native()?;                    // pins 0..32
//! registry.add_mcp23017(0x20, None)?;        // pins 32..48
//!
//! let poller = Poller::spawn(registry.clone());
//!
//! registry.enable(4, true)?;
//! registry.set_direction(4, Direction::Input)?;
//! registry.set_pull(4, Pull::Up)?;
//! println!("pin 4: {}", registry.get_state(4)?);
//!
//! poller.stop();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bus;
pub mod error;
pub mod mcp23017;
pub mod native;
pub mod pin;
pub mod poll;
pub mod registry;

pub use backend::{Backend, BackendKind};
pub use bus::{BusTransport, I2cDev};
pub use error::{Error, Result};
pub use mcp23017::{Mcp23017Backend, SharedBus};
pub use native::NativeBackend;
pub use pin::{Direction, Pin, Pull};
pub use poll::{Poller, POLL_INTERVAL};
pub use registry::{BackendInfo, Registry, MAX_BACKENDS};
