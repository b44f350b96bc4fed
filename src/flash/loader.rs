//! RAM-resident flash loader.
//!
//! Half-page programming on L0/L1 requires a burst of consecutive word writes with no other bus
//! traffic in between, which the probe can't guarantee. A tiny Thumb routine is staged into SRAM
//! and copies each half page from a RAM buffer into flash.

use super::{flash_err, FlashAccess, FlashError};
use crate::chip::FlashFamily;
use crate::control::{RegisterIndex, Target};
use crate::{Error, ErrorKind, Result};
use log::{debug, trace};
use std::time::Instant;

/// Word copy loop, Thumb-1.
///
/// ```text
/// start:  cmp   r3, r2
///         bcs   done
///         ldr   r4, [r1]
///         str   r4, [r0]
///         adds  r0, #4
///         adds  r1, #4
///         adds  r3, #1
///         b     start
/// done:   bkpt
/// ```
///
/// In: r0 = destination, r1 = source, r2 = word count, r3 = 0.
/// Out: r3 = words written.
const COPY_WORDS_THUMB: &[u8] = &[
    0x93, 0x42, 0x05, 0xD2, 0x0C, 0x68, 0x04, 0x60, 0x04, 0x30, 0x04, 0x31, 0x01, 0x33, 0xF7,
    0xE7, 0x00, 0xBE,
];

/// How a loader takes its arguments.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LoaderRegisters {
    /// r0 = destination, r1 = source, r2 = word count, r3 = output count (starts at 0).
    DestSrcCount,
}

#[derive(Debug)]
pub(crate) struct Loader {
    family: FlashFamily,
    code: &'static [u8],
    registers: LoaderRegisters,
    /// Words per half page.
    half_page_words: u32,
}

impl Loader {
    pub(crate) fn half_page_bytes(&self) -> usize {
        self.half_page_words as usize * 4
    }
}

static LOADERS: &[Loader] = &[
    Loader {
        family: FlashFamily::L0,
        code: COPY_WORDS_THUMB,
        registers: LoaderRegisters::DestSrcCount,
        half_page_words: 16,
    },
    Loader {
        family: FlashFamily::L1,
        code: COPY_WORDS_THUMB,
        registers: LoaderRegisters::DestSrcCount,
        half_page_words: 32,
    },
];

pub(crate) fn for_family(family: FlashFamily) -> Option<&'static Loader> {
    LOADERS.iter().find(|loader| loader.family == family)
}

/// Places the loader at `sram_base` and its data buffer right after the code, word aligned.
///
/// Returns the loader and buffer addresses.
fn layout(loader: &Loader, sram_base: u32, sram_size: u32) -> Result<(u32, u32)> {
    let loader_addr = sram_base;
    let buffer_addr = (loader_addr + loader.code.len() as u32 + 3) & !3;
    let buffer_end = u64::from(buffer_addr) + loader.half_page_bytes() as u64;
    if buffer_end > u64::from(sram_base) + u64::from(sram_size) {
        return Err(Error::new(
            ErrorKind::Other,
            format!("flash loader doesn't fit into {} bytes of SRAM", sram_size),
        ));
    }
    Ok((loader_addr, buffer_addr))
}

/// A loader staged in target SRAM, followed by its data buffer.
#[derive(Debug)]
pub(crate) struct FlashLoaderContext {
    loader: &'static Loader,
    loader_addr: u32,
    buffer_addr: u32,
}

impl FlashLoaderContext {
    /// Halts the core and writes the loader code to the start of SRAM.
    pub(crate) fn stage(
        io: &mut dyn FlashAccess,
        target: &Target,
        loader: &'static Loader,
    ) -> Result<Self> {
        let (loader_addr, buffer_addr) = layout(loader, target.sram_base(), target.sram_size())?;

        io.halt_core()?;
        io.write_bytes(loader_addr, loader.code)?;
        debug!(
            "staged flash loader at {:#010x}, buffer at {:#010x}",
            loader_addr, buffer_addr
        );

        Ok(Self {
            loader,
            loader_addr,
            buffer_addr,
        })
    }

    /// Copies `data` (whole words, at most one half page) to flash at `dest` using the loader.
    pub(crate) fn run(&self, io: &mut dyn FlashAccess, dest: u32, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() % 4 == 0 && data.len() <= self.loader.half_page_bytes());
        let count = (data.len() / 4) as u32;

        io.write_bytes(self.buffer_addr, data)?;
        match self.loader.registers {
            LoaderRegisters::DestSrcCount => {
                io.write_core_reg(RegisterIndex::R(0), dest)?;
                io.write_core_reg(RegisterIndex::R(1), self.buffer_addr)?;
                io.write_core_reg(RegisterIndex::R(2), count)?;
                io.write_core_reg(RegisterIndex::R(3), 0)?;
            }
        }
        io.write_core_reg(RegisterIndex::PC, self.loader_addr)?;

        trace!("running flash loader for {} words at {:#010x}", count, dest);
        io.run_core()?;

        let deadline = Instant::now() + io.busy_timeout();
        while !io.core_halted()? {
            if Instant::now() > deadline {
                io.halt_core()?;
                return flash_err(FlashError::Timeout { address: dest });
            }
        }

        let written = io.read_core_reg(RegisterIndex::R(3))?;
        if written != count {
            return flash_err(FlashError::Loader {
                address: dest,
                expected: count,
                written,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::SRAM_BASE;
    use crate::sim::{SimProbe, SimTarget};

    #[test]
    fn table() {
        assert_eq!(for_family(FlashFamily::L0).unwrap().half_page_bytes(), 64);
        assert_eq!(for_family(FlashFamily::L1).unwrap().half_page_bytes(), 128);
        assert!(for_family(FlashFamily::F4).is_none());
    }

    #[test]
    fn code_ends_in_breakpoint() {
        assert_eq!(COPY_WORDS_THUMB.len() % 2, 0);
        assert_eq!(&COPY_WORDS_THUMB[COPY_WORDS_THUMB.len() - 2..], &[0x00, 0xBE]);
    }

    #[test]
    fn buffer_follows_code() {
        for loader in LOADERS {
            let (code, buffer) = layout(loader, SRAM_BASE, 0x4000).unwrap();
            let code_end = code + loader.code.len() as u32;
            assert_eq!(code, SRAM_BASE);
            assert_eq!(buffer % 4, 0);
            assert!(buffer >= code_end && buffer - code_end < 4);
        }
    }

    #[test]
    fn sram_must_hold_code_and_half_page() {
        let loader = for_family(FlashFamily::L1).unwrap();
        // 18 bytes of code padded to 20, plus a 128 byte half page.
        layout(loader, SRAM_BASE, 148).unwrap();
        let err = layout(loader, SRAM_BASE, 147).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);

        let loader = for_family(FlashFamily::L0).unwrap();
        layout(loader, SRAM_BASE, 84).unwrap();
        layout(loader, SRAM_BASE, 83).unwrap_err();
    }

    #[test]
    fn staged_code_survives_a_full_buffer() {
        let mut probe = SimProbe::new(SimTarget::l1()).build();
        let target = probe.attach().unwrap();
        let loader = for_family(FlashFamily::L1).unwrap();
        let ctx = FlashLoaderContext::stage(&mut probe, &target, loader).unwrap();

        let data: Vec<u8> = (0..loader.half_page_bytes()).map(|i| i as u8).collect();
        ctx.run(&mut probe, SRAM_BASE + 0x1000, &data).unwrap();

        let mut code = vec![0; COPY_WORDS_THUMB.len()];
        probe.read_memory(SRAM_BASE, &mut code).unwrap();
        assert_eq!(code, COPY_WORDS_THUMB);
        let mut copied = vec![0; data.len()];
        probe.read_memory(SRAM_BASE + 0x1000, &mut copied).unwrap();
        assert_eq!(copied, data);
    }
}
