//! L0 and L1 flash controller.
//!
//! Flash and data EEPROM share the PECR register with two unlock levels: PEKEYR unlocks PECR
//! itself, PRGKEYR then unlocks program memory. Erased flash reads as zero.

use super::loader::{self, FlashLoaderContext};
use super::{flash_err, wait_busy, FlashAccess, FlashController, FlashError, StatusBits};
use crate::chip::{FlashFamily, FLASH_BASE};
use crate::control::Target;
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

const BASE_L0: u32 = 0x4002_2000;
const BASE_L1: u32 = 0x4002_3C00;

const PECR: u32 = 0x04;
const PEKEYR: u32 = 0x0C;
const PRGKEYR: u32 = 0x10;
const SR: u32 = 0x18;

const PEKEY1: u32 = 0x89AB_CDEF;
const PEKEY2: u32 = 0x0203_0405;
const PRGKEY1: u32 = 0x8C9D_AEBF;
const PRGKEY2: u32 = 0x1314_1516;

const PECR_PELOCK: u32 = 1 << 0;
const PECR_PRGLOCK: u32 = 1 << 1;
const PECR_PROG: u32 = 1 << 3;
const PECR_ERASE: u32 = 1 << 9;
const PECR_FPRG: u32 = 1 << 10;

const SR_BSY: u32 = 1 << 0;
const SR_EOP: u32 = 1 << 1;
const SR_WRPERR: u32 = 1 << 8;
const SR_PGAERR: u32 = 1 << 9;
const SR_SIZERR: u32 = 1 << 10;
const SR_OPTVERR: u32 = 1 << 11;
const SR_RDERR: u32 = 1 << 13;
const SR_NOTZEROERR: u32 = 1 << 16;
const SR_FWWERR: u32 = 1 << 17;

const ERRORS: StatusBits = StatusBits {
    write_protect: SR_WRPERR,
    alignment: SR_PGAERR,
    size: SR_SIZERR,
    option_validity: SR_OPTVERR,
    other: SR_RDERR | SR_NOTZEROERR | SR_FWWERR,
};

fn base(target: &Target) -> u32 {
    match target.params().family() {
        FlashFamily::L0 => BASE_L0,
        _ => BASE_L1,
    }
}

fn finish(io: &mut dyn FlashAccess, base: u32, addr: u32) -> Result<()> {
    let sr = wait_busy(io, base + SR, SR_BSY, addr)?;
    if sr & (ERRORS.all() | SR_EOP) != 0 {
        io.write32(base + SR, ERRORS.all() | SR_EOP)?;
    }
    ERRORS.check(sr, addr)
}

fn modify_pecr(io: &mut dyn FlashAccess, base: u32, set: u32, clear: u32) -> Result<()> {
    let pecr = io.read32(base + PECR)?;
    io.write32(base + PECR, (pecr & !clear) | set)
}

pub(crate) struct LxFlash;

impl LxFlash {
    fn program_words(
        &self,
        io: &mut dyn FlashAccess,
        base: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        for (i, word) in data.chunks(4).enumerate() {
            let at = addr + (i * 4) as u32;
            io.write32(at, LittleEndian::read_u32(word))?;
            finish(io, base, at)?;
        }
        Ok(())
    }

    fn program_half_page(
        &self,
        io: &mut dyn FlashAccess,
        base: u32,
        ctx: &FlashLoaderContext,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        wait_busy(io, base + SR, SR_BSY, addr)?;
        modify_pecr(io, base, PECR_FPRG | PECR_PROG, 0)?;
        let result = ctx.run(io, addr, data).and_then(|()| finish(io, base, addr));
        modify_pecr(io, base, 0, PECR_FPRG | PECR_PROG)?;
        result
    }
}

impl FlashController for LxFlash {
    fn unlock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        let base = base(target);
        let mut pecr = io.read32(base + PECR)?;

        if pecr & PECR_PELOCK != 0 {
            io.write32(base + PEKEYR, PEKEY1)?;
            io.write32(base + PEKEYR, PEKEY2)?;
            pecr = io.read32(base + PECR)?;
            if pecr & PECR_PELOCK != 0 {
                return flash_err(FlashError::Locked {
                    address: base + PEKEYR,
                });
            }
        }

        if pecr & PECR_PRGLOCK != 0 {
            io.write32(base + PRGKEYR, PRGKEY1)?;
            io.write32(base + PRGKEYR, PRGKEY2)?;
            if io.read32(base + PECR)? & PECR_PRGLOCK != 0 {
                return flash_err(FlashError::Locked {
                    address: base + PRGKEYR,
                });
            }
        }

        Ok(())
    }

    fn lock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        let base = base(target);
        modify_pecr(io, base, PECR_PRGLOCK, 0)?;
        modify_pecr(io, base, PECR_PELOCK, 0)
    }

    fn erase_page(&self, io: &mut dyn FlashAccess, target: &Target, addr: u32) -> Result<()> {
        let base = base(target);
        wait_busy(io, base + SR, SR_BSY, addr)?;
        modify_pecr(io, base, PECR_ERASE | PECR_PROG, 0)?;
        let result = io.write32(addr, 0).and_then(|()| finish(io, base, addr));
        modify_pecr(io, base, 0, PECR_ERASE | PECR_PROG)?;
        result
    }

    fn mass_erase(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        // There is no mass erase bit; go page by page.
        let page = target.page_size();
        let pages = target.flash_size() / page;
        debug!("erasing {} pages", pages);
        for i in 0..pages {
            self.erase_page(io, target, FLASH_BASE + i * page)?;
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
        let base = base(target);
        let loader = loader::for_family(target.params().family());
        let ctx = match loader {
            Some(loader) if data.len() >= loader.half_page_bytes() => {
                Some(FlashLoaderContext::stage(io, target, loader)?)
            }
            _ => None,
        };
        let half = loader.map(|loader| loader.half_page_bytes());

        let mut offset = 0;
        while offset < data.len() {
            let at = addr + offset as u32;
            let rest = &data[offset..];

            let len = match (&ctx, half) {
                (Some(ctx), Some(half)) if at as usize % half == 0 && rest.len() >= half => {
                    self.program_half_page(io, base, ctx, at, &rest[..half])?;
                    half
                }
                _ => {
                    // Word writes up to the next half page boundary.
                    let len = match half {
                        Some(half) => (half - at as usize % half).min(rest.len()),
                        None => rest.len(),
                    };
                    self.program_words(io, base, at, &rest[..len])?;
                    len
                }
            };
            offset += len;
        }

        Ok(())
    }

    fn unit(&self) -> usize {
        4
    }
}
