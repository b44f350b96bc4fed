//! Sector-organized F2, F4 and F7 flash controller.

use super::{
    flash_err, wait_busy, FlashAccess, FlashController, FlashError, StatusBits, KEY1, KEY2,
    OPTKEY1, OPTKEY2,
};
use crate::chip::{FlashFamily, FLASH_BASE};
use crate::control::Target;
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

const BASE: u32 = 0x4002_3C00;

const KEYR: u32 = BASE + 0x04;
const OPTKEYR: u32 = BASE + 0x08;
const SR: u32 = BASE + 0x0C;
const CR: u32 = BASE + 0x10;
const OPTCR: u32 = BASE + 0x14;

const CR_PG: u32 = 1 << 0;
const CR_SER: u32 = 1 << 1;
const CR_MER: u32 = 1 << 2;
const CR_SNB_SHIFT: u32 = 3;
const CR_SNB_MASK: u32 = 0x1F;
const CR_PSIZE_X32: u32 = 2 << 8;
const CR_MER1: u32 = 1 << 15;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

const SR_EOP: u32 = 1 << 0;
const SR_OPERR: u32 = 1 << 1;
const SR_WRPERR: u32 = 1 << 4;
const SR_PGAERR: u32 = 1 << 5;
const SR_PGPERR: u32 = 1 << 6;
const SR_PGSERR: u32 = 1 << 7;
const SR_BSY: u32 = 1 << 16;

const OPTCR_OPTLOCK: u32 = 1 << 0;
const OPTCR_OPTSTRT: u32 = 1 << 1;

const ERRORS: StatusBits = StatusBits {
    write_protect: SR_WRPERR,
    alignment: SR_PGAERR,
    size: SR_PGPERR,
    option_validity: 0,
    other: SR_PGSERR | SR_OPERR,
};

/// Size of one bank on dual-bank F4 parts.
const BANK_SIZE: u32 = 0x10_0000;
/// Sectors per bank.
const BANK_SECTORS: u32 = 12;

/// Maps an offset into F2/F4 flash to its sector number.
///
/// Each 1 MiB bank has four 16 KiB sectors, one of 64 KiB and seven of 128 KiB. Sectors of the
/// second bank are numbered from 12.
pub(crate) fn f4_sector(offset: u32) -> u32 {
    let (first, offset) = if offset >= BANK_SIZE {
        (BANK_SECTORS, offset - BANK_SIZE)
    } else {
        (0, offset)
    };

    first
        + match offset {
            0..=0xFFFF => offset / 0x4000,
            0x1_0000..=0x1_FFFF => 4,
            _ => offset / 0x2_0000 + 4,
        }
}

/// Size of F2/F4 sector `sector`.
pub(crate) fn f4_sector_size(sector: u32) -> u32 {
    match sector % BANK_SECTORS {
        0..=3 => 0x4000,
        4 => 0x1_0000,
        _ => 0x2_0000,
    }
}

fn f4_sector_start(sector: u32) -> u32 {
    let bank = sector / BANK_SECTORS * BANK_SIZE;
    bank + match sector % BANK_SECTORS {
        n @ 0..=3 => n * 0x4000,
        4 => 0x1_0000,
        n => (n - 4) * 0x2_0000,
    }
}

/// Maps an offset into F7 flash to its sector number.
///
/// There are four 32 KiB sectors, one of 128 KiB and the rest are 256 KiB.
pub(crate) fn f7_sector(offset: u32) -> u32 {
    match offset {
        0..=0x1_FFFF => offset / 0x8000,
        0x2_0000..=0x3_FFFF => 4,
        _ => offset / 0x4_0000 + 4,
    }
}

/// Size of F7 sector `sector`.
pub(crate) fn f7_sector_size(sector: u32) -> u32 {
    match sector {
        0..=3 => 0x8000,
        4 => 0x2_0000,
        _ => 0x4_0000,
    }
}

fn f7_sector_start(sector: u32) -> u32 {
    match sector {
        0..=3 => sector * 0x8000,
        4 => 0x2_0000,
        n => (n - 4) * 0x4_0000,
    }
}

fn is_f7(target: &Target) -> bool {
    target.params().family() == FlashFamily::F7
}

fn sector(target: &Target, addr: u32) -> u32 {
    let offset = addr - FLASH_BASE;
    if is_f7(target) {
        f7_sector(offset)
    } else {
        f4_sector(offset)
    }
}

fn finish(io: &mut dyn FlashAccess, addr: u32) -> Result<()> {
    let sr = wait_busy(io, SR, SR_BSY, addr)?;
    if sr & (ERRORS.all() | SR_EOP) != 0 {
        io.write32(SR, ERRORS.all() | SR_EOP)?;
    }
    ERRORS.check(sr, addr)
}

pub(crate) struct F4Flash;

impl FlashController for F4Flash {
    fn unlock(&self, io: &mut dyn FlashAccess, _target: &Target) -> Result<()> {
        if io.read32(CR)? & CR_LOCK == 0 {
            return Ok(());
        }
        io.write32(KEYR, KEY1)?;
        io.write32(KEYR, KEY2)?;
        if io.read32(CR)? & CR_LOCK != 0 {
            return flash_err(FlashError::Locked { address: KEYR });
        }
        Ok(())
    }

    fn lock(&self, io: &mut dyn FlashAccess, _target: &Target) -> Result<()> {
        io.write32(CR, CR_LOCK)
    }

    fn page_size(&self, target: &Target, addr: u32) -> u32 {
        let sector = sector(target, addr);
        if is_f7(target) {
            f7_sector_size(sector)
        } else {
            f4_sector_size(sector)
        }
    }

    fn page_base(&self, target: &Target, addr: u32) -> u32 {
        let sector = sector(target, addr);
        FLASH_BASE
            + if is_f7(target) {
                f7_sector_start(sector)
            } else {
                f4_sector_start(sector)
            }
    }

    fn erase_page(&self, io: &mut dyn FlashAccess, target: &Target, addr: u32) -> Result<()> {
        let mut snb = sector(target, addr);
        if snb >= BANK_SECTORS {
            // Bank 2 sectors start at 16 in the SNB field.
            snb += 4;
        }
        debug!("erasing sector {} at {:#010x}", snb, addr);

        wait_busy(io, SR, SR_BSY, addr)?;
        let cr = CR_SER | CR_PSIZE_X32 | ((snb & CR_SNB_MASK) << CR_SNB_SHIFT);
        io.write32(CR, cr)?;
        io.write32(CR, cr | CR_STRT)?;
        let result = finish(io, addr);
        io.write32(CR, 0)?;
        result
    }

    fn mass_erase(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        let mut cr = CR_MER | CR_PSIZE_X32;
        if target.flash_size() > BANK_SIZE {
            cr |= CR_MER1;
        }
        wait_busy(io, SR, SR_BSY, FLASH_BASE)?;
        io.write32(CR, cr)?;
        io.write32(CR, cr | CR_STRT)?;
        let result = finish(io, FLASH_BASE);
        io.write32(CR, 0)?;
        result
    }

    fn program(
        &self,
        io: &mut dyn FlashAccess,
        _target: &Target,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        io.write32(CR, CR_PG | CR_PSIZE_X32)?;
        let result = (|| -> Result<()> {
            for (i, word) in data.chunks(4).enumerate() {
                let at = addr + (i * 4) as u32;
                io.write32(at, LittleEndian::read_u32(word))?;
                finish(io, at)?;
            }
            Ok(())
        })();
        io.write32(CR, 0)?;
        result
    }

    fn unit(&self) -> usize {
        4
    }

    fn verify_supported(&self, target: &Target) -> bool {
        !is_f7(target)
    }

    fn read_option_bytes(&self, io: &mut dyn FlashAccess, _target: &Target) -> Result<u32> {
        io.read32(OPTCR)
    }

    fn write_option_bytes(
        &self,
        io: &mut dyn FlashAccess,
        _target: &Target,
        value: u32,
    ) -> Result<()> {
        if io.read32(OPTCR)? & OPTCR_OPTLOCK != 0 {
            io.write32(OPTKEYR, OPTKEY1)?;
            io.write32(OPTKEYR, OPTKEY2)?;
            if io.read32(OPTCR)? & OPTCR_OPTLOCK != 0 {
                return flash_err(FlashError::Locked { address: OPTKEYR });
            }
        }

        wait_busy(io, SR, SR_BSY, OPTCR)?;
        let value = value & !(OPTCR_OPTLOCK | OPTCR_OPTSTRT);
        io.write32(OPTCR, value)?;
        io.write32(OPTCR, value | OPTCR_OPTSTRT)?;
        let result = finish(io, OPTCR);
        io.write32(OPTCR, value | OPTCR_OPTLOCK)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f4_sector_map() {
        assert_eq!(f4_sector(0), 0);
        assert_eq!(f4_sector_size(0), 16 * 1024);
        assert_eq!(f4_sector(0x3FFF), 0);
        assert_eq!(f4_sector(0x4000), 1);
        assert_eq!(f4_sector(0xC000), 3);
        assert_eq!(f4_sector(0x1_0000), 4);
        assert_eq!(f4_sector_size(4), 64 * 1024);
        assert_eq!(f4_sector(0x2_0000), 5);
        assert_eq!(f4_sector(0xE_0000), 11);
        assert_eq!(f4_sector(0x10_0000), 12);
        assert_eq!(f4_sector(0x12_0000), 17);

        for offset in (0..0x20_0000).step_by(0x4000) {
            let sector = f4_sector(offset);
            let start = f4_sector_start(sector);
            assert!(start <= offset && offset < start + f4_sector_size(sector));
        }
    }

    #[test]
    fn f4_sector_sizes_grow_within_bank() {
        let sizes: Vec<_> = (0..BANK_SECTORS).map(f4_sector_size).collect();
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sizes.iter().sum::<u32>(), BANK_SIZE);
    }

    #[test]
    fn f7_sector_map() {
        assert_eq!(f7_sector(0), 0);
        assert_eq!(f7_sector(0x1_8000), 3);
        assert_eq!(f7_sector(0x2_0000), 4);
        assert_eq!(f7_sector(0x4_0000), 5);
        assert_eq!(f7_sector(0xC_0000), 7);
        assert_eq!(f7_sector_size(3), 32 * 1024);
        assert_eq!(f7_sector_size(4), 128 * 1024);
        assert_eq!(f7_sector_size(7), 256 * 1024);
        for offset in (0..0x10_0000).step_by(0x8000) {
            let sector = f7_sector(offset);
            let start = f7_sector_start(sector);
            assert!(start <= offset && offset < start + f7_sector_size(sector));
        }
    }
}
