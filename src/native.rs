use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::backend::{Backend, BackendKind};
use crate::error::{Error, Result};
use crate::pin::{Direction, Pin, Pull};

/// GPIO register device mapped for direct register access.
pub const GPIO_MEM_PATH: &str = "/dev/gpiomem";

/// Size of the mapped register block.
const BLOCK_SIZE: usize = 4 * 1024;

// BCM2835 register word offsets within the mapped block.
const GPSET0: usize = 7;
const GPCLR0: usize = 10;
const GPLEV0: usize = 13;
const GPPUD: usize = 37;
const GPPUDCLK0: usize = 38;

/// Pins exposed by this backend. The SoC has 54 lines but only 2-27 reach the
/// expansion header; the rest are boot-strap or always-on I2C lines.
const NATIVE_PIN_COUNT: usize = 32;

/// Offsets reserved by the SoC and never touched: 0, 1 (ID EEPROM I2C) and
/// 28-31 (boot-strap).
const UNAVAILABLE: [bool; NATIVE_PIN_COUNT] = [
    true, true, false, false, false, false, false, false, false, false, false, false, false,
    false, false, false, false, false, false, false, false, false, false, false, false, false,
    false, false, true, true, true, true,
];

/// Offsets scanned by the polling loop (the board-exposed pins).
const POLL_RANGE: std::ops::Range<usize> = 2..28;

/// The pull-mode handshake needs at least 150 register-clock cycles, which is
/// 0.6 us on the slowest documented clock.
const PUD_SETTLE: Duration = Duration::from_micros(1);

/// Raw access to the 32-bit GPIO register block.
pub(crate) trait GpioRegisters: Send + Sync {
    fn read(&self, reg: usize) -> u32;
    fn write(&self, reg: usize, value: u32);
}

/// Memory mapping of the SoC's GPIO register block, created once per backend
/// and unmapped on drop.
struct GpioMem {
    ptr: *mut u32,
}

// The mapping is a fixed device register window; volatile access from any
// thread is sound.
unsafe impl Send for GpioMem {}
unsafe impl Sync for GpioMem {}

impl GpioMem {
    fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(GPIO_MEM_PATH)
            .map_err(Error::MapFailed)?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        // The descriptor is not needed once the mapping exists.
        drop(file);
        if ptr == libc::MAP_FAILED {
            return Err(Error::MapFailed(io::Error::last_os_error()));
        }
        debug!("mapped {} ({} bytes)", GPIO_MEM_PATH, BLOCK_SIZE);
        Ok(GpioMem { ptr: ptr as *mut u32 })
    }
}

impl GpioRegisters for GpioMem {
    fn read(&self, reg: usize) -> u32 {
        debug_assert!(reg < BLOCK_SIZE / 4);
        unsafe { ptr::read_volatile(self.ptr.add(reg)) }
    }

    fn write(&self, reg: usize, value: u32) {
        debug_assert!(reg < BLOCK_SIZE / 4);
        unsafe { ptr::write_volatile(self.ptr.add(reg), value) }
    }
}

impl Drop for GpioMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, BLOCK_SIZE);
        }
    }
}

/// Backend for the SoC's own GPIO controller.
pub struct NativeBackend {
    regs: Box<dyn GpioRegisters>,
    pins: Mutex<Vec<Pin>>,
}

impl NativeBackend {
    /// Map the GPIO register block and expose the board pins, all initially
    /// input and disabled.
    pub fn new() -> Result<Self> {
        Self::from_registers(Box::new(GpioMem::open()?))
    }

    fn from_registers(regs: Box<dyn GpioRegisters>) -> Result<Self> {
        let backend = NativeBackend {
            regs,
            pins: Mutex::new(vec![Pin::default(); NATIVE_PIN_COUNT]),
        };
        for offset in 0..NATIVE_PIN_COUNT {
            if !UNAVAILABLE[offset] {
                backend.set_direction(offset, Direction::Input)?;
            }
        }
        Ok(backend)
    }

    fn check_offset(offset: usize) -> Result<()> {
        if offset >= NATIVE_PIN_COUNT || UNAVAILABLE[offset] {
            return Err(Error::Unsupported("pin reserved by the SoC"));
        }
        Ok(())
    }

    /// Live level of one pin, straight from the hardware level register.
    fn level(&self, offset: usize) -> bool {
        self.regs.read(GPLEV0) & (1 << offset) != 0
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn pin_count(&self) -> usize {
        NATIVE_PIN_COUNT
    }

    fn pins(&self) -> &Mutex<Vec<Pin>> {
        &self.pins
    }

    fn set_direction(&self, offset: usize, direction: Direction) -> Result<()> {
        Self::check_offset(offset)?;
        // 10 pins per function-select register, 3 bits per pin.
        let reg = offset / 10;
        let shift = (offset % 10) * 3;
        let mut fsel = self.regs.read(reg);
        fsel &= !(0b111 << shift);
        fsel |= direction.fsel_code() << shift;
        self.regs.write(reg, fsel);
        self.pins.lock().unwrap()[offset].direction = direction;
        Ok(())
    }

    fn set_pull(&self, offset: usize, pull: Pull) -> Result<()> {
        Self::check_offset(offset)?;
        // Hardware-mandated two-phase sequence: latch the mode onto this pin
        // by pulsing its clock bit, then clear both registers. Must not be
        // reordered or skipped.
        self.regs.write(GPPUD, pull.pud_code());
        thread::sleep(PUD_SETTLE);
        self.regs.write(GPPUDCLK0, 1 << offset);
        thread::sleep(PUD_SETTLE);
        self.regs.write(GPPUD, 0);
        self.regs.write(GPPUDCLK0, 0);
        self.pins.lock().unwrap()[offset].pull = pull;
        Ok(())
    }

    fn set_state(&self, offset: usize, state: bool) -> Result<()> {
        Self::check_offset(offset)?;
        // The enabled check and the write share the pin lock, so a
        // concurrent disable cannot land between them.
        let mut pins = self.pins.lock().unwrap();
        if !pins[offset].enabled {
            return Err(Error::PinDisabled(offset as u32));
        }
        // GPSET0/GPCLR0 are write-only, self-clearing: a single-bit mask,
        // never read-modify-write.
        if state {
            self.regs.write(GPSET0, 1 << offset);
        } else {
            self.regs.write(GPCLR0, 1 << offset);
        }
        pins[offset].value = state;
        Ok(())
    }

    fn poll(&self) -> Option<Result<bool>> {
        let mut changed = false;
        let mut pins = self.pins.lock().unwrap();
        for offset in POLL_RANGE {
            if !pins[offset].enabled {
                continue;
            }
            let value = self.level(offset);
            if pins[offset].value != value {
                pins[offset].value = value;
                changed = true;
            }
        }
        Some(Ok(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Register block in memory, recording every write.
    #[derive(Default, Clone)]
    struct MockRegisters(Arc<Mutex<MockState>>);

    #[derive(Default)]
    struct MockState {
        regs: HashMap<usize, u32>,
        writes: Vec<(usize, u32)>,
    }

    impl MockRegisters {
        fn writes(&self) -> Vec<(usize, u32)> {
            self.0.lock().unwrap().writes.clone()
        }
    }

    impl GpioRegisters for MockRegisters {
        fn read(&self, reg: usize) -> u32 {
            *self.0.lock().unwrap().regs.get(&reg).unwrap_or(&0)
        }

        fn write(&self, reg: usize, value: u32) {
            let mut state = self.0.lock().unwrap();
            state.regs.insert(reg, value);
            state.writes.push((reg, value));
        }
    }

    fn backend() -> (NativeBackend, MockRegisters) {
        let regs = MockRegisters::default();
        let backend = NativeBackend::from_registers(Box::new(regs.clone())).unwrap();
        (backend, regs)
    }

    #[test]
    fn direction_encodes_three_bit_fsel_field() {
        let (backend, regs) = backend();
        backend.set_direction(17, Direction::Output).unwrap();
        // Pin 17 lives in GPFSEL1, bits 21..24.
        assert_eq!(regs.read(1) >> 21 & 0b111, 1);
        backend.set_direction(17, Direction::Input).unwrap();
        assert_eq!(regs.read(1) >> 21 & 0b111, 0);
    }

    #[test]
    fn direction_preserves_neighbouring_fsel_fields() {
        let (backend, regs) = backend();
        backend.set_direction(12, Direction::Output).unwrap();
        backend.set_direction(13, Direction::Output).unwrap();
        backend.set_direction(12, Direction::Input).unwrap();
        // Pin 13 (bits 9..12 of GPFSEL1) must survive pin 12's reset.
        assert_eq!(regs.read(1) >> 9 & 0b111, 1);
    }

    #[test]
    fn set_state_uses_set_and_clear_registers() {
        let (backend, regs) = backend();
        backend.pins.lock().unwrap()[4].enabled = true;
        backend.set_state(4, true).unwrap();
        backend.set_state(4, false).unwrap();
        let writes = regs.writes();
        assert_eq!(&writes[writes.len() - 2..], &[(GPSET0, 1 << 4), (GPCLR0, 1 << 4)]);
        assert!(!backend.pins.lock().unwrap()[4].value);
    }

    #[test]
    fn pull_handshake_sequence_is_exact() {
        let (backend, regs) = backend();
        let before = regs.writes().len();
        backend.set_pull(22, Pull::Up).unwrap();
        let writes = regs.writes();
        assert_eq!(
            &writes[before..],
            &[
                (GPPUD, 2),
                (GPPUDCLK0, 1 << 22),
                (GPPUD, 0),
                (GPPUDCLK0, 0),
            ]
        );
    }

    #[test]
    fn reserved_offsets_are_rejected() {
        let (backend, _) = backend();
        assert!(matches!(
            backend.set_direction(0, Direction::Output),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            backend.set_state(31, true),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(backend.set_pull(28, Pull::Up), Err(Error::Unsupported(_))));
    }

    #[test]
    fn writes_to_disabled_pins_leave_registers_alone() {
        let (backend, regs) = backend();
        let before = regs.writes().len();
        assert!(matches!(
            backend.set_state(4, true),
            Err(Error::PinDisabled(4))
        ));
        assert_eq!(regs.writes().len(), before);
    }

    #[test]
    fn poll_refreshes_only_enabled_pins() {
        let (backend, regs) = backend();
        backend.pins.lock().unwrap()[4].enabled = true;
        // Raise level bits for pins 4 and 5; only pin 4 is enabled.
        regs.write(GPLEV0, 1 << 4 | 1 << 5);
        assert_eq!(backend.poll().unwrap().unwrap(), true);
        {
            let pins = backend.pins.lock().unwrap();
            assert!(pins[4].value);
            assert!(!pins[5].value);
        }
        // Nothing changed since the last cycle.
        assert_eq!(backend.poll().unwrap().unwrap(), false);
    }
}
