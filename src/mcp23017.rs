use std::sync::{Arc, Mutex};

use log::debug;

use crate::backend::{Backend, BackendKind};
use crate::bus::BusTransport;
use crate::error::{Error, Result};
use crate::pin::{Direction, Pin, Pull};

/// A bus transport shared between every expander on the same bus.
pub type SharedBus = Arc<Mutex<dyn BusTransport>>;

/// Documented I2C address range of the chip (three hardware address pins).
const ADDRESS_RANGE: std::ops::RangeInclusive<u8> = 0x20..=0x27;

/// Pins provided by the chip: two eight-bit ports.
const MCP23017_PIN_COUNT: usize = 16;

// Register map with IOCON.BANK=1: the two ports live in segregated address
// spaces, port B at port A's index | 0x10.
const REG_IODIR: u8 = 0x00;
const REG_IOCON: u8 = 0x05;
const REG_GPPU: u8 = 0x06;
const REG_GPIO: u8 = 0x09;
const PORT_B: u8 = 0x10;

/// IOCON written once at construction: BANK=1, mirrored interrupt pins, no
/// sequential address pointer.
const IOCON_INIT: u8 = 0b1110_0000;

/// Command byte framing a register access, derived from the chip address.
const OPCODE: u8 = 0x40;

/// Register index and bit position for a local pin offset.
///
/// Offsets 0-7 map to port A, 8-15 to port B; the bit is the offset within
/// its port.
fn locate(offset: usize, base: u8) -> (u8, u8) {
    let reg = if offset >= 8 { base | PORT_B } else { base };
    (reg, (offset % 8) as u8)
}

/// Backend for an MCP23017 16-pin port expander reached over the bus
/// transport.
///
/// Declares no poll capability: inputs are read on demand, not continuously
/// cached. This is a deliberate asymmetry versus the native backend.
pub struct Mcp23017Backend {
    bus: SharedBus,
    address: u8,
    /// Flat GPI number of the chip's interrupt line, when wired.
    interrupt: Option<u32>,
    pins: Mutex<Vec<Pin>>,
}

impl Mcp23017Backend {
    /// Configure the chip at `address` on the shared bus and expose its 16
    /// pins, all initially input and disabled.
    pub fn new(bus: SharedBus, address: u8, interrupt: Option<u32>) -> Result<Self> {
        if !ADDRESS_RANGE.contains(&address) {
            return Err(Error::InvalidAddress(address));
        }
        let backend = Mcp23017Backend {
            bus,
            address,
            interrupt,
            pins: Mutex::new(vec![Pin::default(); MCP23017_PIN_COUNT]),
        };
        backend.write_register(REG_IOCON, IOCON_INIT)?;
        for offset in 0..MCP23017_PIN_COUNT {
            backend.set_direction(offset, Direction::Input)?;
        }
        debug!("configured MCP23017 at {:#04x}", address);
        Ok(backend)
    }

    /// Flat GPI number of the interrupt line, when one was supplied.
    pub fn interrupt(&self) -> Option<u32> {
        self.interrupt
    }

    // Every register access is three framed bus transactions: select the
    // chip, write the command byte, write the register index, then move the
    // data byte.

    fn read_reg(&self, bus: &mut dyn BusTransport, reg: u8) -> Result<u8> {
        bus.select_target(self.address)?;
        bus.write_byte(OPCODE | self.address << 1)?;
        bus.write_byte(reg)?;
        bus.read_byte()
    }

    fn write_reg(&self, bus: &mut dyn BusTransport, reg: u8, value: u8) -> Result<()> {
        bus.select_target(self.address)?;
        bus.write_byte(OPCODE | self.address << 1)?;
        bus.write_byte(reg)?;
        bus.write_byte(value)
    }

    fn write_register(&self, reg: u8, value: u8) -> Result<()> {
        let mut bus = self.bus.lock().unwrap();
        self.write_reg(&mut *bus, reg, value)
    }

    /// Read-modify-write of a single bit in a pin's register. The bus stays
    /// locked across the read and the write-back, so concurrent updates of
    /// sibling pins on the same chip cannot interleave and drop a bit.
    fn update_bit(&self, base: u8, offset: usize, set: bool) -> Result<()> {
        if offset >= MCP23017_PIN_COUNT {
            return Err(Error::InvalidPin(offset as u32));
        }
        let (reg, bit) = locate(offset, base);
        let mut bus = self.bus.lock().unwrap();
        let value = self.read_reg(&mut *bus, reg)?;
        let value = if set { value | 1 << bit } else { value & !(1 << bit) };
        self.write_reg(&mut *bus, reg, value)
    }
}

impl Backend for Mcp23017Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mcp23017
    }

    fn pin_count(&self) -> usize {
        MCP23017_PIN_COUNT
    }

    fn bus_address(&self) -> Option<u8> {
        Some(self.address)
    }

    fn pins(&self) -> &Mutex<Vec<Pin>> {
        &self.pins
    }

    fn set_direction(&self, offset: usize, direction: Direction) -> Result<()> {
        // IODIR is active-low for outputs: 1 = input, 0 = output.
        self.update_bit(REG_IODIR, offset, direction == Direction::Input)?;
        self.pins.lock().unwrap()[offset].direction = direction;
        Ok(())
    }

    fn set_pull(&self, offset: usize, pull: Pull) -> Result<()> {
        match pull {
            Pull::Down => return Err(Error::Unsupported("MCP23017 has no pull-down resistors")),
            Pull::Up => self.update_bit(REG_GPPU, offset, true)?,
            Pull::Off => self.update_bit(REG_GPPU, offset, false)?,
        }
        self.pins.lock().unwrap()[offset].pull = pull;
        Ok(())
    }

    fn set_state(&self, offset: usize, state: bool) -> Result<()> {
        if offset >= MCP23017_PIN_COUNT {
            return Err(Error::InvalidPin(offset as u32));
        }
        // The enabled check and the write share the pin lock, so a
        // concurrent disable cannot land between them.
        let mut pins = self.pins.lock().unwrap();
        if !pins[offset].enabled {
            return Err(Error::PinDisabled(offset as u32));
        }
        // Output latch is active-low: asserting a pin clears its bit.
        self.update_bit(REG_GPIO, offset, !state)?;
        pins[offset].value = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Xfer};

    fn shared_mock() -> (SharedBus, Arc<Mutex<MockBus>>) {
        let mock = Arc::new(Mutex::new(MockBus::new()));
        let shared: SharedBus = mock.clone();
        (shared, mock)
    }

    /// Backend with construction traffic dropped from the log.
    fn backend(address: u8) -> (Mcp23017Backend, Arc<Mutex<MockBus>>) {
        let (shared, mock) = shared_mock();
        let backend = Mcp23017Backend::new(shared, address, None).unwrap();
        mock.lock().unwrap().log.clear();
        (backend, mock)
    }

    #[test]
    fn address_outside_documented_range_is_rejected() {
        let (shared, _) = shared_mock();
        assert!(matches!(
            Mcp23017Backend::new(shared.clone(), 0x1f, None),
            Err(Error::InvalidAddress(0x1f))
        ));
        assert!(matches!(
            Mcp23017Backend::new(shared, 0x28, None),
            Err(Error::InvalidAddress(0x28))
        ));
    }

    #[test]
    fn construction_configures_bank_layout_first() {
        let (shared, mock) = shared_mock();
        Mcp23017Backend::new(shared, 0x20, None).unwrap();
        let log = mock.lock().unwrap().log.clone();
        assert_eq!(
            &log[..4],
            &[
                Xfer::Select(0x20),
                Xfer::Write(OPCODE),
                Xfer::Write(REG_IOCON),
                Xfer::Write(IOCON_INIT),
            ]
        );
    }

    #[test]
    fn register_write_is_three_framed_transactions() {
        let (backend, mock) = backend(0x23);
        backend.write_register(REG_GPPU, 0x01).unwrap();
        assert_eq!(
            mock.lock().unwrap().log,
            vec![
                Xfer::Select(0x23),
                Xfer::Write(OPCODE | 0x23 << 1),
                Xfer::Write(REG_GPPU),
                Xfer::Write(0x01),
            ]
        );
    }

    #[test]
    fn port_and_bit_follow_the_offset() {
        // Offsets below 8 address port A at the offset's bit; 8 and above
        // address port B at offset % 8.
        assert_eq!(locate(0, REG_GPIO), (0x09, 0));
        assert_eq!(locate(7, REG_GPIO), (0x09, 7));
        assert_eq!(locate(8, REG_GPIO), (0x19, 0));
        assert_eq!(locate(15, REG_GPIO), (0x19, 7));
        assert_eq!(locate(10, REG_IODIR), (0x10, 2));
    }

    #[test]
    fn set_state_asserts_by_clearing_the_bit() {
        let (backend, mock) = backend(0x20);
        backend.pins().lock().unwrap()[2].enabled = true;
        mock.lock().unwrap().read_queue.push_back(0b0000_0100);
        backend.set_state(2, true).unwrap();
        let log = mock.lock().unwrap().log.clone();
        // Read of GPIOA returned bit 2 set; asserting pin 2 clears it.
        assert_eq!(log.last(), Some(&Xfer::Write(0x00)));
        assert_eq!(log[log.len() - 2], Xfer::Write(REG_GPIO));
        assert!(backend.pins().lock().unwrap()[2].value);
    }

    #[test]
    fn port_b_pin_targets_the_banked_register() {
        let (backend, mock) = backend(0x20);
        backend.pins().lock().unwrap()[10].enabled = true;
        mock.lock().unwrap().read_queue.push_back(0x00);
        backend.set_state(10, false).unwrap();
        let log = mock.lock().unwrap().log.clone();
        // De-asserting sets the bit: offset 10 is port B, bit 2.
        assert_eq!(log[log.len() - 2], Xfer::Write(REG_GPIO | PORT_B));
        assert_eq!(log.last(), Some(&Xfer::Write(0b0000_0100)));
    }

    #[test]
    fn pull_down_is_unsupported() {
        let (backend, mock) = backend(0x20);
        assert!(matches!(
            backend.set_pull(3, Pull::Down),
            Err(Error::Unsupported(_))
        ));
        // No bus traffic for the rejected request.
        assert!(mock.lock().unwrap().log.is_empty());
    }

    #[test]
    fn writes_to_disabled_pins_stay_off_the_bus() {
        let (backend, mock) = backend(0x20);
        assert!(matches!(
            backend.set_state(2, true),
            Err(Error::PinDisabled(2))
        ));
        assert!(mock.lock().unwrap().log.is_empty());
    }

    /// Chip model backing concurrent tests: holds register contents and
    /// answers reads slowly enough to widen any read-modify-write window.
    #[derive(Default)]
    struct SlowChip {
        regs: std::collections::HashMap<u8, u8>,
        frame: Vec<u8>,
    }

    impl BusTransport for SlowChip {
        fn select_target(&mut self, _address: u8) -> Result<()> {
            self.frame.clear();
            Ok(())
        }

        fn write_byte(&mut self, value: u8) -> Result<()> {
            self.frame.push(value);
            // Command byte, register index, data byte: a register write.
            if self.frame.len() == 3 {
                self.regs.insert(self.frame[1], self.frame[2]);
                self.frame.clear();
            }
            Ok(())
        }

        fn read_byte(&mut self) -> Result<u8> {
            std::thread::sleep(std::time::Duration::from_millis(2));
            let reg = self.frame[1];
            self.frame.clear();
            Ok(*self.regs.get(&reg).unwrap_or(&0xff))
        }
    }

    #[test]
    fn concurrent_writes_to_one_chip_keep_both_bits() {
        let chip = Arc::new(Mutex::new(SlowChip::default()));
        let shared: SharedBus = chip.clone();
        let backend = Arc::new(Mcp23017Backend::new(shared, 0x20, None).unwrap());
        {
            let mut pins = backend.pins().lock().unwrap();
            pins[2].enabled = true;
            pins[5].enabled = true;
        }

        let writers: Vec<_> = [2usize, 5]
            .into_iter()
            .map(|offset| {
                let backend = backend.clone();
                std::thread::spawn(move || backend.set_state(offset, true).unwrap())
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // Both pins asserted their (active-low) output bit; neither update
        // overwrote the other.
        assert_eq!(chip.lock().unwrap().regs[&REG_GPIO], 0b1101_1011);
        let pins = backend.pins().lock().unwrap();
        assert!(pins[2].value && pins[5].value);
    }

    #[test]
    fn no_poll_capability() {
        let (backend, _) = backend(0x20);
        assert!(backend.poll().is_none());
    }
}
