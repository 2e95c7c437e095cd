/// Specifies the direction of a GPI pin.
///
/// * `Input` - the pin is read (default for every freshly registered pin)
/// * `Output` - the pin is driven
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub enum Direction {
    #[default]
    Input,
    Output,
}

impl Direction {
    /// Function-select code written into the native controller's FSEL field.
    pub(crate) fn fsel_code(self) -> u32 {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

/// Internal resistor configuration applied to an input pin.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub enum Pull {
    #[default]
    Off,
    Down,
    Up,
}

impl Pull {
    /// Two-bit code written into the native controller's GPPUD register.
    pub(crate) fn pud_code(self) -> u32 {
        match self {
            Pull::Off => 0,
            Pull::Down => 1,
            Pull::Up => 2,
        }
    }
}

/// One addressable digital line, owned by the backend that created it.
///
/// Holds the last known value, the enabled flag and the configured direction.
/// Disabled pins stay mapped but are skipped by polling and reject writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pin {
    pub value: bool,
    pub enabled: bool,
    pub direction: Direction,
    pub pull: Pull,
}
