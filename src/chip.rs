//! Static parameters of supported STM32 parts.

use std::fmt;

/// Start of the main flash array on all supported parts.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Start of the main SRAM on all supported parts.
pub const SRAM_BASE: u32 = 0x2000_0000;

/// Flash controller families.
///
/// Parts in the same family share flash register layouts, unlock keys and programming rules.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlashFamily {
    /// STM32F0 and F3.
    F0,
    /// STM32F1.
    F1,
    /// STM32F1 XL-density parts with two flash banks.
    F1Xl,
    /// STM32F2 and F4, sector-organized.
    F4,
    /// STM32F7, sector-organized.
    F7,
    /// STM32L0.
    L0,
    /// STM32L1.
    L1,
    /// STM32L4.
    L4,
    /// STM32G0.
    G0,
    /// STM32G4.
    G4,
    /// STM32WB.
    Wb,
    /// STM32H7.
    H7,
}

impl fmt::Display for FlashFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlashFamily::F0 => "F0/F3",
            FlashFamily::F1 => "F1",
            FlashFamily::F1Xl => "F1 XL",
            FlashFamily::F4 => "F2/F4",
            FlashFamily::F7 => "F7",
            FlashFamily::L0 => "L0",
            FlashFamily::L1 => "L1",
            FlashFamily::L4 => "L4",
            FlashFamily::G0 => "G0",
            FlashFamily::G4 => "G4",
            FlashFamily::Wb => "WB",
            FlashFamily::H7 => "H7",
        })
    }
}

impl FlashFamily {
    /// Value erased flash bytes read as.
    pub fn erased_value(self) -> u8 {
        match self {
            FlashFamily::L0 | FlashFamily::L1 => 0x00,
            _ => 0xFF,
        }
    }
}

/// Where the flash size of a part comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlashSize {
    /// Read from this 16-bit register, in KiB.
    Register(u32),
    /// A fixed number of bytes. Used where the size register is missing or unreliable.
    Fixed(u32),
}

/// Parameters of one supported part.
#[derive(Debug)]
pub struct ChipParams {
    chip_id: u16,
    description: &'static str,
    family: FlashFamily,
    flash_size: FlashSize,
    page_size: u32,
    sram_size: u32,
    bootrom_base: u32,
    bootrom_size: u32,
}

impl ChipParams {
    #[allow(clippy::too_many_arguments)]
    const fn new(
        chip_id: u16,
        description: &'static str,
        family: FlashFamily,
        flash_size: FlashSize,
        page_size: u32,
        sram_size: u32,
        bootrom_base: u32,
        bootrom_size: u32,
    ) -> Self {
        Self {
            chip_id,
            description,
            family,
            flash_size,
            page_size,
            sram_size,
            bootrom_base,
            bootrom_size,
        }
    }

    /// Looks up the parameters of the part with the given 12-bit chip id.
    pub fn lookup(chip_id: u16) -> Option<&'static ChipParams> {
        CHIPS.iter().find(|chip| chip.chip_id == chip_id)
    }

    /// Returns all supported parts.
    pub fn all() -> &'static [ChipParams] {
        CHIPS
    }

    /// The 12-bit chip id (DBGMCU_IDCODE.DEV_ID).
    pub fn chip_id(&self) -> u16 {
        self.chip_id
    }

    /// Human-readable name of the part.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// The flash controller family.
    pub fn family(&self) -> FlashFamily {
        self.family
    }

    /// Where the flash size is found.
    pub fn flash_size(&self) -> FlashSize {
        self.flash_size
    }

    /// Flash size to assume when the size register reads as blank.
    ///
    /// Some medium density F1 and L1 parts ship with the register unprogrammed.
    pub fn default_flash_size(&self) -> Option<u32> {
        match self.chip_id {
            0x410 | 0x420 | 0x416 => Some(128 * 1024),
            _ => None,
        }
    }

    /// Nominal flash page size. Sector-organized families compute the real size per address.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Size of the main SRAM in bytes.
    pub fn sram_size(&self) -> u32 {
        self.sram_size
    }

    /// Start of the system memory (boot ROM).
    pub fn bootrom_base(&self) -> u32 {
        self.bootrom_base
    }

    /// Size of the system memory (boot ROM).
    pub fn bootrom_size(&self) -> u32 {
        self.bootrom_size
    }
}

use self::FlashFamily::*;
use self::FlashSize::{Fixed, Register};

#[rustfmt::skip]
static CHIPS: &[ChipParams] = &[
    // F0 / F3
    ChipParams::new(0x440, "F05x",                     F0,   Register(0x1FFF_F7CC), 0x400,   0x2000,  0x1FFF_EC00, 0xC00),
    ChipParams::new(0x442, "F09x",                     F0,   Register(0x1FFF_F7CC), 0x800,   0x8000,  0x1FFF_D800, 0x2000),
    ChipParams::new(0x444, "F03x",                     F0,   Register(0x1FFF_F7CC), 0x400,   0x1000,  0x1FFF_EC00, 0xC00),
    ChipParams::new(0x445, "F04x",                     F0,   Register(0x1FFF_F7CC), 0x400,   0x1800,  0x1FFF_C400, 0x3000),
    ChipParams::new(0x448, "F07x",                     F0,   Register(0x1FFF_F7CC), 0x800,   0x4000,  0x1FFF_C800, 0x3000),
    ChipParams::new(0x422, "F30x/F31x",                F0,   Register(0x1FFF_F7CC), 0x800,   0xA000,  0x1FFF_D800, 0x2000),
    ChipParams::new(0x432, "F37x",                     F0,   Register(0x1FFF_F7CC), 0x800,   0xA000,  0x1FFF_D800, 0x2000),
    ChipParams::new(0x438, "F334",                     F0,   Register(0x1FFF_F7CC), 0x800,   0x3000,  0x1FFF_D800, 0x2000),
    ChipParams::new(0x446, "F303 high density",        F0,   Register(0x1FFF_F7CC), 0x800,   0x10000, 0x1FFF_D800, 0x2000),
    // F1
    ChipParams::new(0x412, "F1 low density",           F1,   Register(0x1FFF_F7E0), 0x400,   0x2800,  0x1FFF_F000, 0x800),
    ChipParams::new(0x410, "F1 medium density",        F1,   Register(0x1FFF_F7E0), 0x400,   0x5000,  0x1FFF_F000, 0x800),
    ChipParams::new(0x414, "F1 high density",          F1,   Register(0x1FFF_F7E0), 0x800,   0x10000, 0x1FFF_F000, 0x800),
    ChipParams::new(0x418, "F1 connectivity line",     F1,   Register(0x1FFF_F7E0), 0x800,   0x10000, 0x1FFF_B000, 0x4800),
    ChipParams::new(0x420, "F1 medium density value line", F1, Register(0x1FFF_F7E0), 0x400, 0x2000,  0x1FFF_F000, 0x800),
    ChipParams::new(0x428, "F1 high density value line", F1, Register(0x1FFF_F7E0), 0x800,   0x8000,  0x1FFF_F000, 0x800),
    ChipParams::new(0x430, "F1 XL density",            F1Xl, Register(0x1FFF_F7E0), 0x800,   0x18000, 0x1FFF_E000, 0x1800),
    // F2 / F4
    ChipParams::new(0x411, "F2",                       F4,   Register(0x1FFF_7A22), 0x20000, 0x20000, 0x1FFF_0000, 0x7800),
    // The size register of early F4 parts aliases the unique ID.
    ChipParams::new(0x413, "F40x/F41x",                F4,   Fixed(0x10_0000),      0x4000,  0x30000, 0x1FFF_0000, 0x7800),
    ChipParams::new(0x419, "F42x/F43x",                F4,   Register(0x1FFF_7A22), 0x4000,  0x40000, 0x1FFF_0000, 0x7800),
    ChipParams::new(0x421, "F446",                     F4,   Register(0x1FFF_7A22), 0x4000,  0x20000, 0x1FFF_0000, 0x7800),
    ChipParams::new(0x423, "F401 B/C",                 F4,   Register(0x1FFF_7A22), 0x4000,  0x10000, 0x1FFF_0000, 0x7800),
    ChipParams::new(0x431, "F411",                     F4,   Register(0x1FFF_7A22), 0x4000,  0x20000, 0x1FFF_0000, 0x7800),
    ChipParams::new(0x433, "F401 D/E",                 F4,   Register(0x1FFF_7A22), 0x4000,  0x18000, 0x1FFF_0000, 0x7800),
    // F7
    ChipParams::new(0x449, "F74x/F75x",                F7,   Register(0x1FF0_F442), 0x8000,  0x50000, 0x0010_0000, 0xEDC0),
    ChipParams::new(0x451, "F76x/F77x",                F7,   Register(0x1FF0_F442), 0x8000,  0x80000, 0x0020_0000, 0xEDC0),
    // L0
    ChipParams::new(0x457, "L01x/L02x",                L0,   Register(0x1FF8_007C), 0x80,    0x800,   0x1FF0_0000, 0x1000),
    ChipParams::new(0x425, "L03x/L04x",                L0,   Register(0x1FF8_007C), 0x80,    0x2000,  0x1FF0_0000, 0x1000),
    ChipParams::new(0x417, "L05x/L06x",                L0,   Register(0x1FF8_007C), 0x80,    0x2000,  0x1FF0_0000, 0x1000),
    ChipParams::new(0x447, "L07x/L08x",                L0,   Register(0x1FF8_007C), 0x80,    0x5000,  0x1FF0_0000, 0x2000),
    // L1
    ChipParams::new(0x416, "L1 medium density",        L1,   Register(0x1FF8_004C), 0x100,   0x4000,  0x1FF0_0000, 0x1000),
    ChipParams::new(0x429, "L1 cat. 2",                L1,   Register(0x1FF8_004C), 0x100,   0x8000,  0x1FF0_0000, 0x1000),
    ChipParams::new(0x427, "L1 medium-plus density",   L1,   Register(0x1FF8_00CC), 0x100,   0x8000,  0x1FF0_0000, 0x1000),
    ChipParams::new(0x436, "L1 high density",          L1,   Register(0x1FF8_00CC), 0x100,   0xC000,  0x1FF0_0000, 0x1000),
    ChipParams::new(0x437, "L152RE",                   L1,   Register(0x1FF8_00CC), 0x100,   0x14000, 0x1FF0_0000, 0x1000),
    // L4
    ChipParams::new(0x415, "L47x/L48x",                L4,   Register(0x1FFF_75E0), 0x800,   0x18000, 0x1FFF_0000, 0x7000),
    ChipParams::new(0x435, "L43x/L44x",                L4,   Register(0x1FFF_75E0), 0x800,   0xC000,  0x1FFF_0000, 0x7000),
    ChipParams::new(0x461, "L496/L4A6",                L4,   Register(0x1FFF_75E0), 0x800,   0x40000, 0x1FFF_0000, 0x7000),
    ChipParams::new(0x462, "L45x/L46x",                L4,   Register(0x1FFF_75E0), 0x800,   0x20000, 0x1FFF_0000, 0x7000),
    ChipParams::new(0x464, "L41x/L42x",                L4,   Register(0x1FFF_75E0), 0x800,   0xA000,  0x1FFF_0000, 0x7000),
    // G0
    ChipParams::new(0x460, "G07x/G08x",                G0,   Register(0x1FFF_75E0), 0x800,   0x9000,  0x1FFF_0000, 0x7000),
    ChipParams::new(0x466, "G03x/G04x",                G0,   Register(0x1FFF_75E0), 0x800,   0x2000,  0x1FFF_0000, 0x2000),
    // G4
    ChipParams::new(0x468, "G43x/G44x",                G4,   Register(0x1FFF_75E0), 0x800,   0x8000,  0x1FFF_0000, 0x7000),
    ChipParams::new(0x469, "G47x/G48x",                G4,   Register(0x1FFF_75E0), 0x800,   0x20000, 0x1FFF_0000, 0x7000),
    // WB
    ChipParams::new(0x495, "WB55",                     Wb,   Register(0x1FFF_75E0), 0x1000,  0x40000, 0x1FFF_0000, 0x7000),
    // H7
    ChipParams::new(0x450, "H74x/H75x",                H7,   Register(0x1FF1_E880), 0x20000, 0x20000, 0x1FF0_0000, 0x1E800),
];
