//! F0, F1 and F3 flash controller, programmed in half-words.

use super::{flash_err, wait_busy, FlashAccess, FlashController, FlashError, StatusBits, KEY1, KEY2};
use crate::chip::{FlashFamily, FLASH_BASE};
use crate::control::Target;
use crate::features::Features;
use crate::Result;
use log::trace;

const BASE: u32 = 0x4002_2000;
/// Offset of the second bank's registers on XL-density parts.
const BANK2_OFFSET: u32 = 0x40;
/// XL-density flash above this offset belongs to bank 2.
const BANK1_SIZE: u32 = 0x8_0000;

const KEYR: u32 = 0x04;
const SR: u32 = 0x0C;
const CR: u32 = 0x10;
const AR: u32 = 0x14;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_MER: u32 = 1 << 2;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

const ERRORS: StatusBits = StatusBits {
    write_protect: SR_WRPRTERR,
    alignment: 0,
    size: 0,
    option_validity: 0,
    other: SR_PGERR,
};

pub(crate) struct F0Flash;

/// Register block serving `addr`.
fn regs(target: &Target, addr: u32) -> u32 {
    if target.params().family() == FlashFamily::F1Xl && addr - FLASH_BASE >= BANK1_SIZE {
        BASE + BANK2_OFFSET
    } else {
        BASE
    }
}

/// Register blocks of all banks present on `target`.
fn banks(target: &Target) -> &'static [u32] {
    if target.params().family() == FlashFamily::F1Xl && target.flash_size() > BANK1_SIZE {
        &[BASE, BASE + BANK2_OFFSET]
    } else {
        &[BASE]
    }
}

/// Waits for the operation to finish, then checks and clears the error flags.
fn finish(io: &mut dyn FlashAccess, regs: u32, addr: u32) -> Result<()> {
    let sr = wait_busy(io, regs + SR, SR_BSY, addr)?;
    if sr & (ERRORS.all() | SR_EOP) != 0 {
        io.write32(regs + SR, ERRORS.all() | SR_EOP)?;
    }
    ERRORS.check(sr, addr)
}

impl FlashController for F0Flash {
    fn unlock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        for &regs in banks(target) {
            if io.read32(regs + CR)? & CR_LOCK == 0 {
                continue;
            }
            io.write32(regs + KEYR, KEY1)?;
            io.write32(regs + KEYR, KEY2)?;
            if io.read32(regs + CR)? & CR_LOCK != 0 {
                return flash_err(FlashError::Locked {
                    address: regs + KEYR,
                });
            }
        }
        Ok(())
    }

    fn lock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        for &regs in banks(target) {
            io.write32(regs + CR, CR_LOCK)?;
        }
        Ok(())
    }

    fn erase_page(&self, io: &mut dyn FlashAccess, target: &Target, addr: u32) -> Result<()> {
        let regs = regs(target, addr);
        wait_busy(io, regs + SR, SR_BSY, addr)?;
        io.write32(regs + CR, CR_PER)?;
        io.write32(regs + AR, addr)?;
        io.write32(regs + CR, CR_PER | CR_STRT)?;
        let result = finish(io, regs, addr);
        io.write32(regs + CR, 0)?;
        result
    }

    fn mass_erase(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        for &regs in banks(target) {
            io.write32(regs + CR, CR_MER)?;
            io.write32(regs + CR, CR_MER | CR_STRT)?;
            let result = finish(io, regs, FLASH_BASE);
            io.write32(regs + CR, 0)?;
            result?;
        }
        Ok(())
    }

    fn program(
        &self,
        io: &mut dyn FlashAccess,
        target: &Target,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut current = None;

        let result = (|| -> Result<()> {
            for (i, half) in data.chunks(2).enumerate() {
                let at = addr + (i * 2) as u32;
                let regs = regs(target, at);
                if current != Some(regs) {
                    if let Some(prev) = current {
                        io.write32(prev + CR, 0)?;
                    }
                    io.write32(regs + CR, CR_PG)?;
                    current = Some(regs);
                }

                trace!("program {:#010x} = {:02x?}", at, half);
                io.write_half(at, [half[0], half[1]])?;
                finish(io, regs, at)?;
            }
            Ok(())
        })();

        if let Some(regs) = current {
            io.write32(regs + CR, 0)?;
        }
        result
    }

    fn unit(&self) -> usize {
        2
    }

    fn required_features(&self) -> Features {
        Features::MEM16
    }
}
