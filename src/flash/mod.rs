//! Flash programming.
//!
//! The engine validates requests, erases and programs through a family-specific
//! [`FlashController`], relocks the controller on every exit path and verifies the result.

mod f0;
mod f4;
mod gx;
mod h7;
mod loader;
mod lx;

use crate::chip::{FlashFamily, FLASH_BASE};
use crate::control::{CoreState, RegisterIndex, Target};
use crate::error::ResultExt as _;
use crate::features::Features;
use crate::transport::Transport;
use crate::{Error, ErrorKind, Result, StLink};
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use std::{cmp, fmt};

/// Data moved per read-back transfer during verification.
const VERIFY_CHUNK: usize = 4096;

/// Key pair shared by the KEYR registers of the F0, F4, Gx and H7 controllers.
pub(crate) const KEY1: u32 = 0x4567_0123;
pub(crate) const KEY2: u32 = 0xCDEF_89AB;

/// Option byte key pair (F4, Gx).
pub(crate) const OPTKEY1: u32 = 0x0819_2A3B;
pub(crate) const OPTKEY2: u32 = 0x4C5D_6E7F;

/// An error reported by (or about) the flash controller.
///
/// Every variant names the address that was being operated on.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// The controller stayed locked after the unlock keys were written.
    Locked { address: u32 },
    /// The busy flag didn't clear within [`FlashOptions::busy_timeout`].
    ///
    /// [`FlashOptions::busy_timeout`]: struct.FlashOptions.html#structfield.busy_timeout
    Timeout { address: u32 },
    /// The page is write-protected.
    WriteProtected { address: u32 },
    /// The controller rejected the alignment of a programming access.
    Alignment { address: u32 },
    /// The controller rejected the size of a programming access.
    Size { address: u32 },
    /// The option bytes were rejected.
    OptionValidity { address: u32 },
    /// Any other error flag. `status` is the raw status register.
    Programming { address: u32, status: u32 },
    /// The RAM loader didn't write every word it was given.
    Loader {
        address: u32,
        expected: u32,
        written: u32,
    },
}

impl FlashError {
    /// Returns the address the failed operation was working on.
    pub fn address(&self) -> u32 {
        match *self {
            FlashError::Locked { address }
            | FlashError::Timeout { address }
            | FlashError::WriteProtected { address }
            | FlashError::Alignment { address }
            | FlashError::Size { address }
            | FlashError::OptionValidity { address }
            | FlashError::Programming { address, .. }
            | FlashError::Loader { address, .. } => address,
        }
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::Locked { address } => {
                write!(f, "controller stayed locked after writing keys to {:#010x}", address)
            }
            FlashError::Timeout { address } => {
                write!(f, "timeout waiting for the controller at {:#010x}", address)
            }
            FlashError::WriteProtected { address } => {
                write!(f, "write protection error at {:#010x}", address)
            }
            FlashError::Alignment { address } => {
                write!(f, "programming alignment error at {:#010x}", address)
            }
            FlashError::Size { address } => {
                write!(f, "programming size error at {:#010x}", address)
            }
            FlashError::OptionValidity { address } => {
                write!(f, "option byte validity error at {:#010x}", address)
            }
            FlashError::Programming { address, status } => write!(
                f,
                "programming error at {:#010x} (status {:#010x})",
                address, status
            ),
            FlashError::Loader {
                address,
                expected,
                written,
            } => write!(
                f,
                "flash loader wrote {} of {} words at {:#010x}",
                written, expected, address
            ),
        }
    }
}

impl std::error::Error for FlashError {}

/// The first difference found by verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyMismatch {
    /// Offset of the divergent byte from the start of the written data.
    pub offset: usize,
    /// Absolute address of the divergent byte.
    pub address: u32,
    /// Start address of the page containing it.
    pub page: u32,
    pub expected: u8,
    pub found: u8,
}

impl fmt::Display for VerifyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification failed at offset {:#x} ({:#010x}, page {:#010x}): expected {:#04x}, found {:#04x}",
            self.offset, self.address, self.page, self.expected, self.found
        )
    }
}

impl std::error::Error for VerifyMismatch {}

/// Knobs for flash operations.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Read back and compare after writing (default: `true`). Ignored on families where
    /// verification isn't supported.
    pub verify: bool,
    /// Stop at the first page that fails to erase (default: `false`, which erases the remaining
    /// pages and reports the first failure afterwards).
    pub abort_on_page_error: bool,
    /// Upper bound for every wait on the busy flag (default: 10 seconds).
    pub busy_timeout: Duration,
    /// Programming progress is logged after every this many bytes (default: 16 KiB).
    pub progress_chunk: usize,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            verify: true,
            abort_on_page_error: false,
            busy_timeout: Duration::from_secs(10),
            progress_chunk: 16 * 1024,
        }
    }
}

pub(crate) fn flash_err<T>(e: FlashError) -> Result<T> {
    Err(e).stlink_err()
}

/// Target access needed by flash controllers.
pub(crate) trait FlashAccess {
    fn read32(&mut self, addr: u32) -> Result<u32>;
    fn write32(&mut self, addr: u32, value: u32) -> Result<()>;
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()>;
    /// Writes one half-word with a single 2-byte transfer.
    fn write_half(&mut self, addr: u32, data: [u8; 2]) -> Result<()>;
    fn read_core_reg(&mut self, reg: RegisterIndex) -> Result<u32>;
    fn write_core_reg(&mut self, reg: RegisterIndex, value: u32) -> Result<()>;
    fn halt_core(&mut self) -> Result<()>;
    fn run_core(&mut self) -> Result<()>;
    fn core_halted(&mut self) -> Result<bool>;
    fn busy_timeout(&self) -> Duration;
}

impl<T: Transport> FlashAccess for StLink<T> {
    fn read32(&mut self, addr: u32) -> Result<u32> {
        self.read_debug32(addr)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.write_debug32(addr, value)
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.write_memory(addr, data)
    }

    fn write_half(&mut self, addr: u32, data: [u8; 2]) -> Result<()> {
        self.write_mem16(addr, &data)
    }

    fn read_core_reg(&mut self, reg: RegisterIndex) -> Result<u32> {
        self.read_reg(reg)
    }

    fn write_core_reg(&mut self, reg: RegisterIndex, value: u32) -> Result<()> {
        self.write_reg(reg, value)
    }

    fn halt_core(&mut self) -> Result<()> {
        self.halt()
    }

    fn run_core(&mut self) -> Result<()> {
        self.run()
    }

    fn core_halted(&mut self) -> Result<bool> {
        let halted = self.status()? == CoreState::Halted;
        if halted {
            self.core_state = CoreState::Halted;
        }
        Ok(halted)
    }

    fn busy_timeout(&self) -> Duration {
        self.flash_options.busy_timeout
    }
}

/// Error flags of a status register and the error each one maps to.
pub(crate) struct StatusBits {
    pub(crate) write_protect: u32,
    pub(crate) alignment: u32,
    pub(crate) size: u32,
    pub(crate) option_validity: u32,
    /// Remaining error flags, reported as `FlashError::Programming`.
    pub(crate) other: u32,
}

impl StatusBits {
    pub(crate) fn all(&self) -> u32 {
        self.write_protect | self.alignment | self.size | self.option_validity | self.other
    }

    /// Maps the error flags in `sr` to the matching `FlashError`.
    pub(crate) fn check(&self, sr: u32, address: u32) -> Result<()> {
        let error = if sr & self.write_protect != 0 {
            FlashError::WriteProtected { address }
        } else if sr & self.alignment != 0 {
            FlashError::Alignment { address }
        } else if sr & self.size != 0 {
            FlashError::Size { address }
        } else if sr & self.option_validity != 0 {
            FlashError::OptionValidity { address }
        } else if sr & self.other != 0 {
            FlashError::Programming {
                address,
                status: sr,
            }
        } else {
            return Ok(());
        };

        warn!("flash status {:#010x}: {}", sr, error);
        flash_err(error)
    }
}

/// Polls the status register at `sr` until none of the `busy` bits are set.
///
/// Returns the final status register value.
pub(crate) fn wait_busy(io: &mut dyn FlashAccess, sr: u32, busy: u32, address: u32) -> Result<u32> {
    let deadline = Instant::now() + io.busy_timeout();
    loop {
        let status = io.read32(sr)?;
        if status & busy == 0 {
            return Ok(status);
        }
        if Instant::now() > deadline {
            return flash_err(FlashError::Timeout { address });
        }
    }
}

/// A flash controller family.
///
/// Addresses passed in are absolute and already validated against the target's flash region.
pub(crate) trait FlashController: Sync {
    /// Unlocks program and erase access. Does nothing if already unlocked.
    fn unlock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()>;

    fn lock(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()>;

    /// Size of the page or sector containing `addr`.
    fn page_size(&self, target: &Target, addr: u32) -> u32 {
        let _ = addr;
        target.page_size()
    }

    /// Start of the page or sector containing `addr`.
    fn page_base(&self, target: &Target, addr: u32) -> u32 {
        let size = self.page_size(target, addr);
        FLASH_BASE + (addr - FLASH_BASE) / size * size
    }

    fn erase_page(&self, io: &mut dyn FlashAccess, target: &Target, addr: u32) -> Result<()>;

    fn mass_erase(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<()>;

    /// Programs `data` at `addr`. Both are multiples of `unit()`.
    fn program(
        &self,
        io: &mut dyn FlashAccess,
        target: &Target,
        addr: u32,
        data: &[u8],
    ) -> Result<()>;

    /// Natural programming unit in bytes.
    fn unit(&self) -> usize;

    /// Probe features `program` depends on.
    fn required_features(&self) -> Features {
        Features::empty()
    }

    fn verify_supported(&self, target: &Target) -> bool {
        let _ = target;
        true
    }

    fn read_option_bytes(&self, io: &mut dyn FlashAccess, target: &Target) -> Result<u32> {
        let _ = io;
        Err(no_option_bytes(target))
    }

    fn write_option_bytes(
        &self,
        io: &mut dyn FlashAccess,
        target: &Target,
        value: u32,
    ) -> Result<()> {
        let _ = (io, value);
        Err(no_option_bytes(target))
    }
}

fn no_option_bytes(target: &Target) -> Error {
    Error::new(
        ErrorKind::MissingFeature,
        format!(
            "option bytes of the {} family are not supported",
            target.params().family()
        ),
    )
}

/// Selects the controller implementation for `family`.
pub(crate) fn controller(family: FlashFamily) -> &'static dyn FlashController {
    match family {
        FlashFamily::F0 | FlashFamily::F1 | FlashFamily::F1Xl => &f0::F0Flash,
        FlashFamily::F4 | FlashFamily::F7 => &f4::F4Flash,
        FlashFamily::L0 | FlashFamily::L1 => &lx::LxFlash,
        FlashFamily::L4 | FlashFamily::G0 | FlashFamily::G4 | FlashFamily::Wb => &gx::GxFlash,
        FlashFamily::H7 => &h7::H7Flash,
    }
}

impl<T: Transport> StLink<T> {
    fn flash_target(&self) -> Result<(Target, &'static dyn FlashController)> {
        let target = self.target()?.clone();
        let ctrl = controller(target.params().family());
        Ok((target, ctrl))
    }

    fn check_flash_range(&self, target: &Target, addr: u32, len: usize) -> Result<()> {
        if !target.contains_flash(addr, len) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "{} bytes at {:#010x} are outside of flash ({:#010x}..{:#010x})",
                    len,
                    addr,
                    target.flash_base(),
                    u64::from(target.flash_base()) + u64::from(target.flash_size())
                ),
            ));
        }
        Ok(())
    }

    /// Runs `op` with the controller unlocked, and relocks it whatever `op` returns.
    fn with_unlocked<R>(
        &mut self,
        target: &Target,
        ctrl: &dyn FlashController,
        op: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        if let Err(e) = ctrl.unlock(self, target) {
            // Unlocking may have got partway, so lock whatever it opened.
            if let Err(lock_err) = ctrl.lock(self, target) {
                warn!("relocking after failed unlock: {}", lock_err);
            }
            return Err(e);
        }
        let result = op(self);
        let locked = ctrl.lock(self, target);
        let value = result?;
        locked?;
        Ok(value)
    }

    /// Erases every page touched by `[addr, addr + len)`.
    ///
    /// Unless `abort_on_page_error` is set, a failing page doesn't stop the remaining ones, and
    /// the first error is returned at the end.
    fn erase_pages(
        &mut self,
        target: &Target,
        ctrl: &dyn FlashController,
        addr: u32,
        len: usize,
    ) -> Result<()> {
        let end = u64::from(addr) + len as u64;
        let mut page = ctrl.page_base(target, addr);
        let mut first_error = None;

        while u64::from(page) < end {
            let size = ctrl.page_size(target, page);
            debug!("erasing page {:#010x} ({} bytes)", page, size);
            if let Err(e) = ctrl.erase_page(self, target, page) {
                if self.flash_options.abort_on_page_error {
                    return Err(e);
                }
                warn!("erasing page {:#010x} failed: {}", page, e);
                first_error.get_or_insert(e);
            }
            page += size;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the size of the flash page or sector containing `addr`.
    pub fn page_size_at(&self, addr: u32) -> Result<u32> {
        let (target, ctrl) = self.flash_target()?;
        self.check_flash_range(&target, addr, 1)?;
        Ok(ctrl.page_size(&target, addr))
    }

    /// Erases the page or sector containing `addr`.
    pub fn erase_page(&mut self, addr: u32) -> Result<()> {
        let (target, ctrl) = self.flash_target()?;
        self.check_flash_range(&target, addr, 1)?;
        let page = ctrl.page_base(&target, addr);
        self.with_unlocked(&target, ctrl, |this| ctrl.erase_page(this, &target, page))
    }

    /// Erases every page touched by `[addr, addr + len)`.
    pub fn erase_range(&mut self, addr: u32, len: usize) -> Result<()> {
        let (target, ctrl) = self.flash_target()?;
        self.check_flash_range(&target, addr, len)?;
        if len == 0 {
            return Ok(());
        }
        self.with_unlocked(&target, ctrl, |this| {
            this.erase_pages(&target, ctrl, addr, len)
        })
    }

    /// Erases the whole flash array.
    pub fn mass_erase(&mut self) -> Result<()> {
        let (target, ctrl) = self.flash_target()?;
        info!("mass erasing {} KiB of flash", target.flash_size() / 1024);
        self.with_unlocked(&target, ctrl, |this| ctrl.mass_erase(this, &target))
    }

    /// Erases and programs `data` at `addr`, then verifies it.
    ///
    /// `addr` must be the start of a page, and `addr` and `data.len()` must be multiples of 2.
    /// The last programming unit is padded with the erased value.
    pub fn write_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let (target, ctrl) = self.flash_target()?;
        self.check_flash_range(&target, addr, data.len())?;
        if addr % 2 != 0 || data.len() % 2 != 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "flash write of {} bytes at {:#010x} is not half-word aligned",
                    data.len(),
                    addr
                ),
            ));
        }
        if ctrl.page_base(&target, addr) != addr {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("flash write address {:#010x} is not page aligned", addr),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        if !self.features.contains(ctrl.required_features()) {
            return Err(Error::new(
                ErrorKind::MissingFeature,
                format!(
                    "firmware {} can't program {} flash (needs {:?})",
                    self.version,
                    target.params().family(),
                    ctrl.required_features()
                ),
            ));
        }

        let unit = ctrl.unit();
        let mut image = data.to_vec();
        let padded = (data.len() + unit - 1) / unit * unit;
        image.resize(padded, target.params().family().erased_value());
        self.check_flash_range(&target, addr, image.len())?;

        // Keep progress chunks aligned to every family's programming burst.
        let chunk = cmp::max(self.flash_options.progress_chunk & !0xFF, 0x100);

        info!("writing {} bytes to {:#010x}", data.len(), addr);
        self.with_unlocked(&target, ctrl, |this| {
            this.erase_pages(&target, ctrl, addr, image.len())?;

            let mut written = 0;
            for block in image.chunks(chunk) {
                ctrl.program(this, &target, addr + written as u32, block)?;
                written += block.len();
                info!("programmed {}/{} bytes", cmp::min(written, data.len()), data.len());
            }
            Ok(())
        })?;

        if self.flash_options.verify {
            if ctrl.verify_supported(&target) {
                self.verify_flash(addr, data)?;
            } else {
                debug!("skipping verification on {}", target.params().family());
            }
        }

        Ok(())
    }

    /// Compares flash contents at `addr` with `data`.
    ///
    /// Fails with [`ErrorKind::VerifyMismatch`] naming the first divergent byte.
    ///
    /// [`ErrorKind::VerifyMismatch`]: enum.ErrorKind.html#variant.VerifyMismatch
    pub fn verify_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let (target, ctrl) = self.flash_target()?;
        self.check_flash_range(&target, addr, data.len())?;

        let mut buf = vec![0; VERIFY_CHUNK];
        for (i, expected) in data.chunks(VERIFY_CHUNK).enumerate() {
            let base = i * VERIFY_CHUNK;
            let found = &mut buf[..expected.len()];
            self.read_memory(addr + base as u32, found)?;

            if let Some(pos) = expected.iter().zip(found.iter()).position(|(a, b)| a != b) {
                let offset = base + pos;
                let address = addr + offset as u32;
                return Err(VerifyMismatch {
                    offset,
                    address,
                    page: ctrl.page_base(&target, address),
                    expected: expected[pos],
                    found: found[pos],
                })
                .stlink_err();
            }
        }

        debug!("verified {} bytes at {:#010x}", data.len(), addr);
        Ok(())
    }

    /// Reads `len` bytes of flash starting at `addr`.
    pub fn read_flash(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let target = self.target()?.clone();
        self.check_flash_range(&target, addr, len)?;
        let mut buf = vec![0; len];
        self.read_memory(addr, &mut buf)?;
        Ok(buf)
    }

    /// Reads the user option bytes register.
    ///
    /// Supported on the F2/F4/F7 and L4/G0/G4/WB families.
    pub fn read_option_bytes(&mut self) -> Result<u32> {
        let (target, ctrl) = self.flash_target()?;
        ctrl.read_option_bytes(self, &target)
    }

    /// Programs the user option bytes register.
    ///
    /// Supported on the F2/F4/F7 and L4/G0/G4/WB families. Depending on the family, the new
    /// values may only take effect after a reset.
    pub fn write_option_bytes(&mut self, value: u32) -> Result<()> {
        let (target, ctrl) = self.flash_target()?;
        info!("writing option bytes {:#010x}", value);
        self.with_unlocked(&target, ctrl, |this| {
            ctrl.write_option_bytes(this, &target, value)
        })
    }
}
