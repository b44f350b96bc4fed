//! Core control and target identification.

use crate::chip::{ChipParams, FlashSize, FLASH_BASE, SRAM_BASE};
use crate::features::Features;
use crate::protocol::DebugCommand;
use crate::transport::Transport;
use crate::{Error, ErrorKind, Result, StLink};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::fmt;

/// Chip-id register of most Cortex-M3/M4/M7 parts (DBGMCU_IDCODE).
const DBGMCU_IDCODE: u32 = 0xE004_2000;
/// Chip-id register of Cortex-M0/M0+ parts.
const DBGMCU_IDCODE_M0: u32 = 0x4001_5800;
/// Chip-id register of the H7.
const DBGMCU_IDCODE_H7: u32 = 0x5C00_1000;
/// System control block CPUID register.
const CPUID: u32 = 0xE000_ED00;

const CORE_ID_M0: u32 = 0x0BB1_1477;
const CORE_ID_M0_PLUS: u32 = 0x0BC1_1477;
const CORE_ID_H7: u32 = 0x6BA0_2477;

/// F2 chip id that early F4 revisions report.
const CHIP_ID_F2: u16 = 0x411;
const CHIP_ID_F4: u16 = 0x413;
const CHIP_ID_L1_HIGH: u16 = 0x436;

/// Number of status polls after `force_debug` before `halt` gives up.
const HALT_POLL_LIMIT: u32 = 100;

const STATUS_RUNNING: u8 = 0x80;
const STATUS_HALTED: u8 = 0x81;

/// State of the target core, as last observed or commanded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreState {
    /// The core is executing code.
    Running,
    /// The core is stopped in debug state.
    Halted,
    /// A reset was requested and the core has not been observed since.
    Reset,
    /// Debug mode was entered; the core keeps running.
    DebugRunning,
    /// Nothing is known about the core.
    Unknown,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoreState::Running => "running",
            CoreState::Halted => "halted",
            CoreState::Reset => "in reset",
            CoreState::DebugRunning => "running (debug)",
            CoreState::Unknown => "unknown",
        })
    }
}

/// Level to drive the target's NRST line to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetLine {
    /// Pull NRST low, holding the target in reset.
    Assert,
    /// Release NRST.
    Deassert,
}

/// A core register, as addressed by the register read/write commands.
///
/// Indices 0 to 15 are the general purpose registers. The indices above are aliases for special
/// registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterIndex {
    /// General purpose register `r0` to `r15` (`r13` is SP, `r14` LR, `r15` PC).
    R(u8),
    /// Program status register (index 16).
    Xpsr,
    /// Main stack pointer (index 17).
    MainSp,
    /// Process stack pointer (index 18).
    ProcessSp,
    /// CONTROL, FAULTMASK, BASEPRI and PRIMASK packed into one word (index 19).
    Rw,
    /// Second special-register word (index 20).
    Rw2,
}

impl RegisterIndex {
    /// The stack pointer.
    pub const SP: RegisterIndex = RegisterIndex::R(13);
    /// The link register.
    pub const LR: RegisterIndex = RegisterIndex::R(14);
    /// The program counter.
    pub const PC: RegisterIndex = RegisterIndex::R(15);

    /// Decodes a wire register index. Returns `None` for indices above 20.
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0..=15 => RegisterIndex::R(index),
            16 => RegisterIndex::Xpsr,
            17 => RegisterIndex::MainSp,
            18 => RegisterIndex::ProcessSp,
            19 => RegisterIndex::Rw,
            20 => RegisterIndex::Rw2,
            _ => return None,
        })
    }

    /// Returns the wire register index.
    pub fn index(self) -> u8 {
        match self {
            RegisterIndex::R(n) => n,
            RegisterIndex::Xpsr => 16,
            RegisterIndex::MainSp => 17,
            RegisterIndex::ProcessSp => 18,
            RegisterIndex::Rw => 19,
            RegisterIndex::Rw2 => 20,
        }
    }

    fn check(self) -> Result<u8> {
        match self {
            RegisterIndex::R(n) if n > 15 => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("r{} is not a core register", n),
            )),
            _ => Ok(self.index()),
        }
    }
}

impl fmt::Display for RegisterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterIndex::R(n) => write!(f, "r{}", n),
            RegisterIndex::Xpsr => f.write_str("xpsr"),
            RegisterIndex::MainSp => f.write_str("msp"),
            RegisterIndex::ProcessSp => f.write_str("psp"),
            RegisterIndex::Rw => f.write_str("rw"),
            RegisterIndex::Rw2 => f.write_str("rw2"),
        }
    }
}

/// A snapshot of all core registers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    r: [u32; 16],
    xpsr: u32,
    main_sp: u32,
    process_sp: u32,
    rw: u32,
    rw2: u32,
}

impl Registers {
    /// Decodes the 84-byte `read-all-registers` reply.
    fn parse(raw: &[u8]) -> Self {
        let word = |i: usize| LittleEndian::read_u32(&raw[i * 4..i * 4 + 4]);
        let mut r = [0; 16];
        for (i, reg) in r.iter_mut().enumerate() {
            *reg = word(i);
        }
        Self {
            r,
            xpsr: word(16),
            main_sp: word(17),
            process_sp: word(18),
            rw: word(19),
            rw2: word(20),
        }
    }

    /// Returns the value of `reg`.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] for general purpose registers above `r15`.
    ///
    /// [`ErrorKind::InvalidArgument`]: enum.ErrorKind.html#variant.InvalidArgument
    pub fn get(&self, reg: RegisterIndex) -> Result<u32> {
        reg.check()?;
        Ok(match reg {
            RegisterIndex::R(n) => self.r[usize::from(n)],
            RegisterIndex::Xpsr => self.xpsr,
            RegisterIndex::MainSp => self.main_sp,
            RegisterIndex::ProcessSp => self.process_sp,
            RegisterIndex::Rw => self.rw,
            RegisterIndex::Rw2 => self.rw2,
        })
    }

    /// Sets the value of `reg` in this snapshot.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] for general purpose registers above `r15`.
    ///
    /// [`ErrorKind::InvalidArgument`]: enum.ErrorKind.html#variant.InvalidArgument
    pub fn set(&mut self, reg: RegisterIndex, value: u32) -> Result<()> {
        reg.check()?;
        let slot = match reg {
            RegisterIndex::R(n) => &mut self.r[usize::from(n)],
            RegisterIndex::Xpsr => &mut self.xpsr,
            RegisterIndex::MainSp => &mut self.main_sp,
            RegisterIndex::ProcessSp => &mut self.process_sp,
            RegisterIndex::Rw => &mut self.rw,
            RegisterIndex::Rw2 => &mut self.rw2,
        };
        *slot = value;
        Ok(())
    }
}

/// An identified target microcontroller and its memory layout.
#[derive(Debug, Clone)]
pub struct Target {
    chip_id: u16,
    core_id: u32,
    params: &'static ChipParams,
    flash_size: u32,
}

impl Target {
    /// The 12-bit chip id, after errata correction.
    pub fn chip_id(&self) -> u16 {
        self.chip_id
    }

    /// The debug port identification code of the core.
    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    /// The static parameters of this part.
    pub fn params(&self) -> &'static ChipParams {
        self.params
    }

    /// Start of the flash array.
    pub fn flash_base(&self) -> u32 {
        FLASH_BASE
    }

    /// Flash size in bytes.
    pub fn flash_size(&self) -> u32 {
        self.flash_size
    }

    /// Nominal page size. Use [`StLink::page_size_at`] for sector-organized parts.
    ///
    /// [`StLink::page_size_at`]: struct.StLink.html#method.page_size_at
    pub fn page_size(&self) -> u32 {
        self.params.page_size()
    }

    /// Start of the main SRAM.
    pub fn sram_base(&self) -> u32 {
        SRAM_BASE
    }

    /// Size of the main SRAM in bytes.
    pub fn sram_size(&self) -> u32 {
        self.params.sram_size()
    }

    /// Start of the system memory (boot ROM).
    pub fn sys_base(&self) -> u32 {
        self.params.bootrom_base()
    }

    /// Size of the system memory in bytes.
    pub fn sys_size(&self) -> u32 {
        self.params.bootrom_size()
    }

    /// Returns whether `[addr, addr + len)` lies inside the flash array.
    pub(crate) fn contains_flash(&self, addr: u32, len: usize) -> bool {
        let end = u64::from(FLASH_BASE) + u64::from(self.flash_size);
        addr >= FLASH_BASE && u64::from(addr) + len as u64 <= end
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STM32{} (chip id {:#05x}, core id {:#010x}): {} KiB flash in {} byte pages, {} KiB SRAM",
            self.params.description(),
            self.chip_id,
            self.core_id,
            self.flash_size / 1024,
            self.params.page_size(),
            self.params.sram_size() / 1024,
        )
    }
}

impl<T: Transport> StLink<T> {
    /// Reads the core status. This doesn't change the recorded core state.
    pub fn status(&mut self) -> Result<CoreState> {
        let raw = self.debug_command_raw(DebugCommand::GetStatus, None)?;
        Ok(match raw {
            STATUS_RUNNING => CoreState::Running,
            STATUS_HALTED => CoreState::Halted,
            other => {
                warn!("unknown core status {:#04x}", other);
                CoreState::Unknown
            }
        })
    }

    /// Requests the core to stop and enter debug state.
    pub fn force_debug(&mut self) -> Result<()> {
        self.debug_simple(DebugCommand::ForceDebug, None, "halting core")?;
        self.core_state = CoreState::Halted;
        Ok(())
    }

    /// Halts the core and waits until it reports being halted.
    pub fn halt(&mut self) -> Result<()> {
        self.force_debug()?;
        for _ in 0..HALT_POLL_LIMIT {
            if self.status()? == CoreState::Halted {
                return Ok(());
            }
        }

        self.core_state = CoreState::Unknown;
        Err(Error::new(
            ErrorKind::Protocol,
            format!("core did not halt after {} polls", HALT_POLL_LIMIT),
        ))
    }

    /// Lets the core run from its current program counter.
    pub fn run(&mut self) -> Result<()> {
        self.debug_simple(DebugCommand::RunCore, None, "resuming core")?;
        self.core_state = CoreState::Running;
        Ok(())
    }

    /// Executes a single instruction.
    pub fn step(&mut self) -> Result<()> {
        self.debug_simple(DebugCommand::StepCore, None, "stepping core")?;
        self.core_state = CoreState::Halted;
        Ok(())
    }

    /// Resets the target system through the debug port.
    ///
    /// If the core was halted, it is halted again after the reset.
    pub fn reset(&mut self) -> Result<()> {
        let was_halted = self.core_state == CoreState::Halted;
        self.debug_simple(DebugCommand::ResetSys, None, "resetting target")?;
        self.core_state = CoreState::Reset;

        if was_halted {
            self.halt()
        } else {
            self.core_state = match self.status()? {
                CoreState::Unknown => CoreState::Reset,
                observed => observed,
            };
            Ok(())
        }
    }

    /// Drives the NRST line.
    ///
    /// Requires [`Features::API_V2`].
    ///
    /// [`Features::API_V2`]: struct.Features.html#associatedconstant.API_V2
    pub fn jtag_reset(&mut self, line: ResetLine) -> Result<()> {
        if !self.features.contains(Features::API_V2) {
            return Err(Error::new(
                ErrorKind::MissingFeature,
                format!("firmware {} cannot drive NRST", self.version),
            ));
        }

        let level = match line {
            ResetLine::Assert => 0,
            ResetLine::Deassert => 1,
        };
        self.debug_simple(DebugCommand::DriveNrst, Some(level), "driving NRST")?;
        if line == ResetLine::Assert {
            self.core_state = CoreState::Reset;
        }
        Ok(())
    }

    /// Reads all core registers at once. The core should be halted.
    pub fn read_registers(&mut self) -> Result<Registers> {
        let raw = self.read_all_regs_raw()?;
        Ok(Registers::parse(raw))
    }

    /// Reads one core register.
    pub fn read_reg(&mut self, reg: RegisterIndex) -> Result<u32> {
        let index = reg.check()?;
        self.read_reg_raw(index)
    }

    /// Writes one core register.
    pub fn write_reg(&mut self, reg: RegisterIndex, value: u32) -> Result<()> {
        let index = reg.check()?;
        self.write_reg_raw(index, value)
    }

    /// Identifies the attached microcontroller and derives its memory layout.
    ///
    /// The result is also stored in the session and used by all flash operations. Fails with
    /// [`UnknownDevice`] if the chip is not supported; the stored target is cleared in that case.
    ///
    /// [`UnknownDevice`]: enum.ErrorKind.html#variant.UnknownDevice
    pub fn identify(&mut self) -> Result<Target> {
        self.target = None;

        let core_id = self.read_core_id()?;
        let idcode_reg = match core_id {
            CORE_ID_M0 | CORE_ID_M0_PLUS => DBGMCU_IDCODE_M0,
            CORE_ID_H7 => DBGMCU_IDCODE_H7,
            _ => DBGMCU_IDCODE,
        };
        let mut chip_id = (self.read_debug32(idcode_reg)? & 0xFFF) as u16;
        debug!("core id {:#010x}, chip id {:#05x}", core_id, chip_id);

        // Early F4 revisions report the F2 chip id. The Cortex-M4 CPUID tells them apart.
        if chip_id == CHIP_ID_F2 {
            let cpuid = self.read_debug32(CPUID)?;
            if cpuid & 0xFFF0 == 0xC240 {
                debug!("CPUID {:#010x} is a Cortex-M4, treating as F4", cpuid);
                chip_id = CHIP_ID_F4;
            }
        }

        let params = ChipParams::lookup(chip_id).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownDevice,
                format!("unsupported chip id {:#05x} (core id {:#010x})", chip_id, core_id),
            )
        })?;

        let flash_size = match params.flash_size() {
            FlashSize::Fixed(size) => size,
            FlashSize::Register(addr) => self.read_flash_size(params, addr)?,
        };

        let target = Target {
            chip_id,
            core_id,
            params,
            flash_size,
        };
        debug!("identified {}", target);
        self.target = Some(target.clone());
        Ok(target)
    }

    fn read_flash_size(&mut self, params: &ChipParams, addr: u32) -> Result<u32> {
        // The size register is 16 bits wide and may sit in the upper half of a word.
        let word = self.read_debug32(addr & !3)?;
        let kib = (word >> ((addr & 2) * 8)) & 0xFFFF;

        // L1 high density parts encode the size as a 0/1 selector.
        if params.chip_id() == CHIP_ID_L1_HIGH {
            return Ok(if kib & 1 == 0 { 384 * 1024 } else { 256 * 1024 });
        }

        if kib == 0 || kib == 0xFFFF {
            if let Some(size) = params.default_flash_size() {
                warn!(
                    "flash size register {:#010x} is blank, assuming {} KiB",
                    addr,
                    size / 1024
                );
                return Ok(size);
            }
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("flash size register {:#010x} reads {:#06x}", addr, kib),
            ));
        }
        Ok(kib * 1024)
    }
}
