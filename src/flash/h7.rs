//! H7 flash controller.
//!
//! Flash is split into two banks of 1 MiB with 128 KiB sectors, each bank with its own register
//! block. Programming happens in 256-bit flash words, which the controller collects in a write
//! buffer before committing them.

use super::{flash_err, wait_busy, FlashAccess, FlashController, FlashError, StatusBits, KEY1, KEY2};
use crate::chip::FLASH_BASE;
use crate::control::Target;
use crate::Result;
use log::debug;

const BASE: u32 = 0x5200_2000;
const BANK2_OFFSET: u32 = 0x100;

const BANK_SIZE: u32 = 0x10_0000;
const SECTOR_SIZE: u32 = 0x2_0000;
/// Bytes per flash word.
const FLASH_WORD: usize = 32;

const KEYR: u32 = 0x04;
const CR: u32 = 0x0C;
const SR: u32 = 0x10;
const CCR: u32 = 0x14;

const CR_LOCK: u32 = 1 << 0;
const CR_PG: u32 = 1 << 1;
const CR_SER: u32 = 1 << 2;
const CR_BER: u32 = 1 << 3;
const CR_PSIZE_X64: u32 = 3 << 4;
const CR_START: u32 = 1 << 7;
const CR_SNB_SHIFT: u32 = 8;
const CR_SNB_MASK: u32 = 0x7;

const SR_BSY: u32 = 1 << 0;
const SR_QW: u32 = 1 << 2;
const SR_EOP: u32 = 1 << 16;
const SR_WRPERR: u32 = 1 << 17;
const SR_PGSERR: u32 = 1 << 18;
const SR_STRBERR: u32 = 1 << 19;
const SR_INCERR: u32 = 1 << 21;
const SR_OPERR: u32 = 1 << 22;

const ERRORS: StatusBits = StatusBits {
    write_protect: SR_WRPERR,
    alignment: 0,
    size: 0,
    option_validity: 0,
    other: SR_PGSERR | SR_STRBERR | SR_INCERR | SR_OPERR,
};

/// Bank index (0 or 1) of the flash offset `offset`.
fn bank(offset: u32) -> u32 {
    offset / BANK_SIZE
}

/// Sector number of `offset` within its bank.
fn sector(offset: u32) -> u32 {
    offset % BANK_SIZE / SECTOR_SIZE
}

fn regs(bank: u32) -> u32 {
    BASE + bank * BANK2_OFFSET
}

fn bank_count(target: &Target) -> u32 {
    (target.flash_size() + BANK_SIZE - 1) / BANK_SIZE
}

fn finish(io: &mut dyn FlashAccess, regs: u32, addr: u32) -> Result<()> {
    let sr = wait_busy(io, regs + SR, SR_BSY | SR_QW, addr)?;
    if sr & (ERRORS.all() | SR_EOP) != 0 {
        io.write32(regs + CCR, ERRORS.all() | SR_EOP)?;
    }
    ERRORS.check(sr, addr)
}

pub(crate) struct H7Flash;

impl FlashController for H7Flash {
    fn unlock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        for bank in 0..bank_count(target) {
            let regs = regs(bank);
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
        for bank in 0..bank_count(target) {
            io.write32(regs(bank) + CR, CR_LOCK)?;
        }
        Ok(())
    }

    fn page_size(&self, _target: &Target, _addr: u32) -> u32 {
        SECTOR_SIZE
    }

    fn erase_page(&self, io: &mut dyn FlashAccess, _target: &Target, addr: u32) -> Result<()> {
        let offset = addr - FLASH_BASE;
        let regs = regs(bank(offset));
        let snb = sector(offset);
        debug!("erasing bank {} sector {} at {:#010x}", bank(offset) + 1, snb, addr);

        wait_busy(io, regs + SR, SR_BSY | SR_QW, addr)?;
        let cr = CR_SER | CR_PSIZE_X64 | ((snb & CR_SNB_MASK) << CR_SNB_SHIFT);
        io.write32(regs + CR, cr)?;
        io.write32(regs + CR, cr | CR_START)?;
        let result = finish(io, regs, addr);
        io.write32(regs + CR, 0)?;
        result
    }

    fn mass_erase(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        for bank in 0..bank_count(target) {
            let regs = regs(bank);
            let addr = FLASH_BASE + bank * BANK_SIZE;
            wait_busy(io, regs + SR, SR_BSY | SR_QW, addr)?;
            io.write32(regs + CR, CR_BER | CR_PSIZE_X64)?;
            io.write32(regs + CR, CR_BER | CR_PSIZE_X64 | CR_START)?;
            let result = finish(io, regs, addr);
            io.write32(regs + CR, 0)?;
            result?;
        }
        Ok(())
    }

    fn program(
        &self,
        io: &mut dyn FlashAccess,
        _target: &Target,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut current = None;

        let result = (|| -> Result<()> {
            for (i, word) in data.chunks(FLASH_WORD).enumerate() {
                let at = addr + (i * FLASH_WORD) as u32;
                let regs = regs(bank(at - FLASH_BASE));
                if current != Some(regs) {
                    if let Some(prev) = current {
                        io.write32(prev + CR, 0)?;
                    }
                    io.write32(regs + CR, CR_PG | CR_PSIZE_X64)?;
                    current = Some(regs);
                }

                io.write_bytes(at, word)?;
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
        FLASH_WORD
    }
}
