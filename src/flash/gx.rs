//! L4, G0, G4 and WB flash controller, programmed in double words.

use super::{
    flash_err, wait_busy, FlashAccess, FlashController, FlashError, StatusBits, KEY1, KEY2,
    OPTKEY1, OPTKEY2,
};
use crate::chip::{FlashFamily, FLASH_BASE};
use crate::control::Target;
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

const BASE: u32 = 0x4002_2000;
const BASE_WB: u32 = 0x5800_4000;

const KEYR: u32 = 0x08;
const OPTKEYR: u32 = 0x0C;
const SR: u32 = 0x10;
const CR: u32 = 0x14;
const OPTR: u32 = 0x20;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_MER1: u32 = 1 << 2;
const CR_PNB_SHIFT: u32 = 3;
const CR_BKER: u32 = 1 << 11;
const CR_MER2: u32 = 1 << 15;
const CR_STRT: u32 = 1 << 16;
const CR_OPTSTRT: u32 = 1 << 17;
const CR_OBL_LAUNCH: u32 = 1 << 27;
const CR_OPTLOCK: u32 = 1 << 30;
const CR_LOCK: u32 = 1 << 31;

const SR_EOP: u32 = 1 << 0;
const SR_OPERR: u32 = 1 << 1;
const SR_PROGERR: u32 = 1 << 3;
const SR_WRPERR: u32 = 1 << 4;
const SR_PGAERR: u32 = 1 << 5;
const SR_SIZERR: u32 = 1 << 6;
const SR_PGSERR: u32 = 1 << 7;
const SR_MISERR: u32 = 1 << 8;
const SR_FASTERR: u32 = 1 << 9;
const SR_OPTVERR: u32 = 1 << 15;
const SR_BSY: u32 = 1 << 16;

const ERRORS: StatusBits = StatusBits {
    write_protect: SR_WRPERR,
    alignment: SR_PGAERR,
    size: SR_SIZERR,
    option_validity: SR_OPTVERR,
    other: SR_OPERR | SR_PROGERR | SR_PGSERR | SR_MISERR | SR_FASTERR,
};

/// Page number field width and bank geometry of a family.
struct Layout {
    base: u32,
    pnb_mask: u32,
    /// Pages per bank on dual-bank parts.
    bank_pages: Option<u32>,
}

fn layout(target: &Target) -> Layout {
    match target.params().family() {
        FlashFamily::L4 => Layout {
            base: BASE,
            pnb_mask: 0xFF,
            bank_pages: Some(256),
        },
        FlashFamily::G4 => Layout {
            base: BASE,
            pnb_mask: 0x7F,
            bank_pages: Some(128),
        },
        FlashFamily::Wb => Layout {
            base: BASE_WB,
            pnb_mask: 0xFF,
            bank_pages: None,
        },
        _ => Layout {
            base: BASE,
            pnb_mask: 0x3FF,
            bank_pages: None,
        },
    }
}

impl Layout {
    fn dual_bank(&self, target: &Target) -> bool {
        match self.bank_pages {
            Some(pages) => target.flash_size() / target.page_size() > pages,
            None => false,
        }
    }
}

fn finish(io: &mut dyn FlashAccess, base: u32, addr: u32) -> Result<()> {
    let sr = wait_busy(io, base + SR, SR_BSY, addr)?;
    if sr & (ERRORS.all() | SR_EOP) != 0 {
        io.write32(base + SR, ERRORS.all() | SR_EOP)?;
    }
    ERRORS.check(sr, addr)
}

pub(crate) struct GxFlash;

impl FlashController for GxFlash {
    fn unlock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        let base = layout(target).base;
        if io.read32(base + CR)? & CR_LOCK == 0 {
            return Ok(());
        }
        io.write32(base + KEYR, KEY1)?;
        io.write32(base + KEYR, KEY2)?;
        if io.read32(base + CR)? & CR_LOCK != 0 {
            return flash_err(FlashError::Locked {
                address: base + KEYR,
            });
        }
        Ok(())
    }

    fn lock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        let base = layout(target).base;
        let cr = io.read32(base + CR)?;
        io.write32(base + CR, cr | CR_LOCK)
    }

    fn erase_page(&self, io: &mut dyn FlashAccess, target: &Target, addr: u32) -> Result<()> {
        let layout = layout(target);
        let mut page = (addr - FLASH_BASE) / target.page_size();
        let mut cr = CR_PER;
        if let Some(bank_pages) = layout.bank_pages {
            if layout.dual_bank(target) && page >= bank_pages {
                page -= bank_pages;
                cr |= CR_BKER;
            }
        }
        cr |= (page & layout.pnb_mask) << CR_PNB_SHIFT;
        debug!("erasing page {} at {:#010x}", page, addr);

        let base = layout.base;
        wait_busy(io, base + SR, SR_BSY, addr)?;
        io.write32(base + CR, cr)?;
        io.write32(base + CR, cr | CR_STRT)?;
        let result = finish(io, base, addr);
        io.write32(base + CR, 0)?;
        result
    }

    fn mass_erase(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()> {
        let layout = layout(target);
        let mut cr = CR_MER1;
        if layout.dual_bank(target) {
            cr |= CR_MER2;
        }

        let base = layout.base;
        wait_busy(io, base + SR, SR_BSY, FLASH_BASE)?;
        io.write32(base + CR, cr)?;
        io.write32(base + CR, cr | CR_STRT)?;
        let result = finish(io, base, FLASH_BASE);
        io.write32(base + CR, 0)?;
        result
    }

    fn program(
        &self,
        io: &mut dyn FlashAccess,
        target: &Target,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let base = layout(target).base;
        wait_busy(io, base + SR, SR_BSY, addr)?;
        io.write32(base + CR, CR_PG)?;

        let result = (|| -> Result<()> {
            for (i, dword) in data.chunks(8).enumerate() {
                let at = addr + (i * 8) as u32;
                io.write32(at, LittleEndian::read_u32(&dword[..4]))?;
                io.write32(at + 4, LittleEndian::read_u32(&dword[4..]))?;
                finish(io, base, at)?;
            }
            Ok(())
        })();

        io.write32(base + CR, 0)?;
        result
    }

    fn unit(&self) -> usize {
        8
    }

    fn read_option_bytes(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<u32> {
        io.read32(layout(target).base + OPTR)
    }

    fn write_option_bytes(
        &self,
        io: &mut dyn FlashAccess,
        target: &Target,
        value: u32,
    ) -> Result<()> {
        let base = layout(target).base;
        if io.read32(base + CR)? & CR_OPTLOCK != 0 {
            io.write32(base + OPTKEYR, OPTKEY1)?;
            io.write32(base + OPTKEYR, OPTKEY2)?;
            if io.read32(base + CR)? & CR_OPTLOCK != 0 {
                return flash_err(FlashError::Locked {
                    address: base + OPTKEYR,
                });
            }
        }

        wait_busy(io, base + SR, SR_BSY, base + OPTR)?;
        io.write32(base + OPTR, value)?;
        io.write32(base + CR, CR_OPTSTRT)?;
        finish(io, base, base + OPTR)?;

        // Reloading the option bytes resets the target.
        debug!("launching option byte reload");
        io.write32(base + CR, CR_OBL_LAUNCH)
    }
}
