use std::fmt;

/// Operating modes of the probe firmware.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Firmware update mode, entered after plugging in the probe.
    Dfu,

    /// Mass storage mode (drag-and-drop programming on V2-1 and later).
    MassStorage,

    /// Debug mode, where the probe talks to the target core.
    Debug,

    /// SWIM mode, used for STM8 targets.
    Swim,

    /// The probe's bootloader is running.
    Bootloader,

    /// A mode this library doesn't know about.
    Unknown(u8),
}

impl Mode {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Mode::Dfu,
            1 => Mode::MassStorage,
            2 => Mode::Debug,
            3 => Mode::Swim,
            4 => Mode::Bootloader,
            other => Mode::Unknown(other),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dfu => f.write_str("DFU"),
            Mode::MassStorage => f.write_str("mass storage"),
            Mode::Debug => f.write_str("debug"),
            Mode::Swim => f.write_str("SWIM"),
            Mode::Bootloader => f.write_str("bootloader"),
            Mode::Unknown(raw) => write!(f, "unknown ({:#04x})", raw),
        }
    }
}
