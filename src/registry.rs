use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::backend::{Backend, BackendKind};
use crate::bus::I2cDev;
use crate::error::{Error, Result};
use crate::mcp23017::{Mcp23017Backend, SharedBus};
use crate::native::NativeBackend;
use crate::pin::{Direction, Pull};

/// Capacity of the backend slot table.
pub const MAX_BACKENDS: usize = 8;

/// One occupied backend slot: the backend plus its base offset into the
/// global index space.
struct Slot {
    backend: Box<dyn Backend>,
    base: u32,
    /// Whether the backend was constructed on the registry's lazily opened
    /// bus device, as opposed to a caller-supplied transport.
    default_bus: bool,
}

/// Index map entry: which slot owns a flat pin number, and where.
#[derive(Debug, Clone, Copy)]
struct MapEntry {
    slot: usize,
    offset: usize,
}

/// Diagnostic snapshot of one occupied slot.
#[derive(Debug, Clone, Copy)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub base: u32,
    pub size: usize,
}

#[derive(Default)]
struct Inner {
    /// Dense by construction: a slot index is valid iff it is `< slots.len()`.
    slots: Vec<Slot>,
    /// One entry per existing pin, contiguous and ascending by registration
    /// order. `map.len()` is the global pin count.
    map: Vec<MapEntry>,
    /// Bus transport shared by every expander backend, opened lazily on the
    /// first expander registration and released when the last one is removed.
    bus: Option<SharedBus>,
}

impl Inner {
    fn entry(&self, pin: u32) -> Result<MapEntry> {
        self.map
            .get(pin as usize)
            .copied()
            .ok_or(Error::InvalidPin(pin))
    }

    fn backend(&self, entry: MapEntry) -> &dyn Backend {
        self.slots[entry.slot].backend.as_ref()
    }

    /// Slot already hosting the same physical device, for idempotent
    /// re-registration. Custom backends are never deduplicated.
    fn find_existing(&self, kind: BackendKind, address: Option<u8>) -> Option<usize> {
        match kind {
            BackendKind::Native => self.slots.iter().position(|s| s.backend.kind() == kind),
            BackendKind::Mcp23017 => self
                .slots
                .iter()
                .position(|s| s.backend.kind() == kind && s.backend.bus_address() == address),
            BackendKind::Custom(_) => None,
        }
    }

    fn check_capacity(&self) -> Result<()> {
        if self.slots.len() >= MAX_BACKENDS {
            return Err(Error::RegistryFull(MAX_BACKENDS));
        }
        Ok(())
    }

    /// Append a constructed backend, extending the index map with its pins.
    fn insert(&mut self, backend: Box<dyn Backend>, default_bus: bool) -> usize {
        let slot = self.slots.len();
        let base = self.map.len() as u32;
        for offset in 0..backend.pin_count() {
            self.map.push(MapEntry { slot, offset });
        }
        info!(
            "registered {:?} backend in slot {} ({} pins at base {})",
            backend.kind(),
            slot,
            backend.pin_count(),
            base
        );
        self.slots.push(Slot {
            backend,
            base,
            default_bus,
        });
        slot
    }

    /// Rebuild the index map from the current slot layout. Run after any
    /// removal so every remaining pin points at its shifted slot.
    fn rebuild_map(&mut self) {
        self.map.clear();
        for (slot, entry) in self.slots.iter().enumerate() {
            for offset in 0..entry.backend.pin_count() {
                self.map.push(MapEntry { slot, offset });
            }
        }
    }
}

/// The single source of truth for which backend owns which flat pin number.
///
/// Cheaply clonable; clones share the same slot table and index map. Lookups
/// and pin operations take a read lock and may proceed concurrently with the
/// polling loop; registration and removal take the write lock, so a reader
/// never observes a half-compacted table.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the on-chip GPIO backend (32 pins, idempotent).
    pub fn add_native(&self) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        if let Some(slot) = inner.find_existing(BackendKind::Native, None) {
            return Ok(slot);
        }
        inner.check_capacity()?;
        let backend = NativeBackend::new()?;
        Ok(inner.insert(Box::new(backend), false))
    }

    /// Register an MCP23017 expander at `address` on the default bus device
    /// (16 pins, idempotent per chip address). `interrupt` records the flat
    /// GPI number its interrupt line is wired to, if any.
    pub fn add_mcp23017(&self, address: u8, interrupt: Option<u32>) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        if let Some(slot) = inner.find_existing(BackendKind::Mcp23017, Some(address)) {
            return Ok(slot);
        }
        inner.check_capacity()?;
        let bus = match &inner.bus {
            Some(bus) => bus.clone(),
            None => {
                let bus: SharedBus = Arc::new(Mutex::new(I2cDev::open()?));
                inner.bus = Some(bus.clone());
                bus
            }
        };
        let backend = Mcp23017Backend::new(bus, address, interrupt)?;
        Ok(inner.insert(Box::new(backend), true))
    }

    /// Register an MCP23017 expander over a caller-supplied bus transport.
    pub fn add_mcp23017_on(
        &self,
        bus: SharedBus,
        address: u8,
        interrupt: Option<u32>,
    ) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        if let Some(slot) = inner.find_existing(BackendKind::Mcp23017, Some(address)) {
            return Ok(slot);
        }
        inner.check_capacity()?;
        let backend = Mcp23017Backend::new(bus, address, interrupt)?;
        Ok(inner.insert(Box::new(backend), false))
    }

    /// Register an already constructed backend.
    ///
    /// This is the generic path behind the device-specific constructors and
    /// the way to plug in out-of-tree pin providers.
    pub fn add_backend(&self, backend: Box<dyn Backend>) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        if let Some(slot) = inner.find_existing(backend.kind(), backend.bus_address()) {
            return Ok(slot);
        }
        inner.check_capacity()?;
        Ok(inner.insert(backend, false))
    }

    /// Remove a backend, releasing its resources and compacting the table:
    /// every later slot shifts one position earlier, its base offset drops by
    /// the removed pin count, and the index map is rewritten for every
    /// remaining pin.
    pub fn remove(&self, slot: usize) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if slot >= inner.slots.len() {
            return Err(Error::InvalidSlot(slot));
        }
        let removed = inner.slots.remove(slot);
        let removed_size = removed.backend.pin_count() as u32;
        info!(
            "removing {:?} backend from slot {} ({} pins)",
            removed.backend.kind(),
            slot,
            removed_size
        );
        for shifted in &mut inner.slots[slot..] {
            shifted.base -= removed_size;
        }
        inner.rebuild_map();
        // Backend resources (register mapping, pin storage) are released
        // here, before the lock is.
        drop(removed);
        // Last user of the lazily opened bus device gone: release it too.
        // Expanders on caller-supplied transports do not keep it alive.
        if inner.slots.iter().all(|s| !s.default_bus) {
            inner.bus = None;
        }
        Ok(())
    }

    /// Total quantity of pins across every backend.
    pub fn count(&self) -> u32 {
        self.inner.read().unwrap().map.len() as u32
    }

    /// Quantity of enabled pins, by full scan.
    pub fn enabled_count(&self) -> u32 {
        let inner = self.inner.read().unwrap();
        let mut count = 0;
        for slot in &inner.slots {
            let pins = slot.backend.pins().lock().unwrap();
            count += pins.iter().filter(|p| p.enabled).count() as u32;
        }
        count
    }

    /// The (slot, local offset) pair owning a flat pin number.
    pub fn owner(&self, pin: u32) -> Result<(usize, usize)> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        Ok((entry.slot, entry.offset))
    }

    /// Enable or disable a pin. All pins start disabled and must be enabled
    /// individually; a disabled pin stays mapped but is skipped by polling
    /// and rejects writes.
    pub fn enable(&self, pin: u32, enable: bool) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        inner.backend(entry).pins().lock().unwrap()[entry.offset].enabled = enable;
        Ok(())
    }

    /// Whether a pin is enabled. Invalid pin numbers read as disabled.
    pub fn is_enabled(&self, pin: u32) -> bool {
        let inner = self.inner.read().unwrap();
        match inner.entry(pin) {
            Ok(entry) => {
                let pins = inner.backend(entry).pins().lock().unwrap();
                pins[entry.offset].enabled
            }
            Err(_) => false,
        }
    }

    pub fn get_direction(&self, pin: u32) -> Result<Direction> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        let pins = inner.backend(entry).pins().lock().unwrap();
        Ok(pins[entry.offset].direction)
    }

    pub fn set_direction(&self, pin: u32, direction: Direction) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        inner.backend(entry).set_direction(entry.offset, direction)
    }

    pub fn get_pull(&self, pin: u32) -> Result<Pull> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        let pins = inner.backend(entry).pins().lock().unwrap();
        Ok(pins[entry.offset].pull)
    }

    pub fn set_pull(&self, pin: u32, pull: Pull) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        inner.backend(entry).set_pull(entry.offset, pull)
    }

    /// Last known value of a pin, from the owning backend's cache.
    pub fn get_state(&self, pin: u32) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        let pins = inner.backend(entry).pins().lock().unwrap();
        Ok(pins[entry.offset].value)
    }

    /// Drive a pin. The owning backend checks the enabled flag and performs
    /// the write under its pin lock, so a concurrent disable cannot slip in
    /// between; it updates its cache before this returns, so a subsequent
    /// [`get_state`](Self::get_state) observes the written value regardless
    /// of the polling cadence.
    pub fn set_state(&self, pin: u32, state: bool) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let entry = inner.entry(pin)?;
        match inner.backend(entry).set_state(entry.offset, state) {
            // Backends report their local offset; callers know flat numbers.
            Err(Error::PinDisabled(_)) => Err(Error::PinDisabled(pin)),
            result => result,
        }
    }

    /// Snapshot of every occupied slot, in slot order.
    pub fn backends(&self) -> Vec<BackendInfo> {
        let inner = self.inner.read().unwrap();
        inner
            .slots
            .iter()
            .map(|s| BackendInfo {
                kind: s.backend.kind(),
                base: s.base,
                size: s.backend.pin_count(),
            })
            .collect()
    }

    /// Run one poll cycle over every backend that declares the capability,
    /// in slot order. A failing backend is logged and skipped; it never
    /// prevents polling the rest. Returns whether any pin changed.
    pub fn poll_all(&self) -> bool {
        let inner = self.inner.read().unwrap();
        let mut any_changed = false;
        for (slot, entry) in inner.slots.iter().enumerate() {
            match entry.backend.poll() {
                Some(Ok(changed)) => any_changed |= changed,
                Some(Err(err)) => warn!("poll failed on slot {}: {}", slot, err),
                None => {}
            }
        }
        any_changed
    }
}
