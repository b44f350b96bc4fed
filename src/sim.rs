//! A simulated ST-Link with an emulated STM32 attached, used by the tests.
//!
//! The probe side decodes native and legacy command frames. The target side has sparse memory,
//! a core with registers and a run state, one of four flash controller models, and a tiny Thumb
//! interpreter that runs staged flash loaders.

use crate::chip::{FLASH_BASE, SRAM_BASE};
use crate::flash::{KEY1, KEY2, OPTKEY1, OPTKEY2};
use crate::protocol::Framing;
use crate::transport::Transport;
use crate::{Result, StLink};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const STATUS_OK: u8 = 0x80;
const STATUS_HALTED: u8 = 0x81;

const REG_COUNT: usize = 21;
const PC: usize = 15;

/// Instruction limit for one loader run.
const MAX_STEPS: usize = 100_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Model {
    F1,
    F4,
    L1,
    G0,
}

mod f1 {
    pub const BASE: u32 = 0x4002_2000;
    pub const KEYR: u32 = BASE + 0x04;
    pub const SR: u32 = BASE + 0x0C;
    pub const CR: u32 = BASE + 0x10;
    pub const AR: u32 = BASE + 0x14;

    pub const CR_PG: u32 = 1 << 0;
    pub const CR_PER: u32 = 1 << 1;
    pub const CR_MER: u32 = 1 << 2;
    pub const CR_STRT: u32 = 1 << 6;
    pub const CR_LOCK: u32 = 1 << 7;

    pub const SR_BSY: u32 = 1 << 0;
    pub const SR_PGERR: u32 = 1 << 2;
    pub const SR_WRPRTERR: u32 = 1 << 4;
    pub const SR_EOP: u32 = 1 << 5;
}

mod f4 {
    pub const BASE: u32 = 0x4002_3C00;
    pub const KEYR: u32 = BASE + 0x04;
    pub const OPTKEYR: u32 = BASE + 0x08;
    pub const SR: u32 = BASE + 0x0C;
    pub const CR: u32 = BASE + 0x10;
    pub const OPTCR: u32 = BASE + 0x14;

    pub const CR_PG: u32 = 1 << 0;
    pub const CR_SER: u32 = 1 << 1;
    pub const CR_MER: u32 = 1 << 2;
    pub const CR_STRT: u32 = 1 << 16;
    pub const CR_LOCK: u32 = 1 << 31;

    pub const SR_EOP: u32 = 1 << 0;
    pub const SR_WRPERR: u32 = 1 << 4;
    pub const SR_PGSERR: u32 = 1 << 7;
    pub const SR_BSY: u32 = 1 << 16;

    pub const OPTCR_OPTLOCK: u32 = 1 << 0;
    pub const OPTCR_OPTSTRT: u32 = 1 << 1;
}

mod l1 {
    pub const BASE: u32 = 0x4002_3C00;
    pub const PECR: u32 = BASE + 0x04;
    pub const PEKEYR: u32 = BASE + 0x0C;
    pub const PRGKEYR: u32 = BASE + 0x10;
    pub const SR: u32 = BASE + 0x18;

    pub const PEKEY1: u32 = 0x89AB_CDEF;
    pub const PEKEY2: u32 = 0x0203_0405;
    pub const PRGKEY1: u32 = 0x8C9D_AEBF;
    pub const PRGKEY2: u32 = 0x1314_1516;

    pub const PECR_PELOCK: u32 = 1 << 0;
    pub const PECR_PRGLOCK: u32 = 1 << 1;
    pub const PECR_PROG: u32 = 1 << 3;
    pub const PECR_ERASE: u32 = 1 << 9;

    pub const SR_BSY: u32 = 1 << 0;
    pub const SR_EOP: u32 = 1 << 1;
    pub const SR_WRPERR: u32 = 1 << 8;
}

mod g0 {
    pub const BASE: u32 = 0x4002_2000;
    pub const KEYR: u32 = BASE + 0x08;
    pub const OPTKEYR: u32 = BASE + 0x0C;
    pub const SR: u32 = BASE + 0x10;
    pub const CR: u32 = BASE + 0x14;
    pub const OPTR: u32 = BASE + 0x20;

    pub const CR_PG: u32 = 1 << 0;
    pub const CR_PER: u32 = 1 << 1;
    pub const CR_MER1: u32 = 1 << 2;
    pub const CR_STRT: u32 = 1 << 16;
    pub const CR_OPTSTRT: u32 = 1 << 17;
    pub const CR_OPTLOCK: u32 = 1 << 30;
    pub const CR_LOCK: u32 = 1 << 31;

    pub const SR_EOP: u32 = 1 << 0;
    pub const SR_WRPERR: u32 = 1 << 4;
    pub const SR_PGSERR: u32 = 1 << 7;
    pub const SR_BSY: u32 = 1 << 16;
}

/// The emulated microcontroller.
#[derive(Debug, Clone)]
pub(crate) struct SimTarget {
    chip_id: u16,
    core_id: u32,
    idcode_reg: u32,
    cpuid: u32,
    model: Model,
    /// Size register address and contents in KiB.
    size_reg: Option<(u32, u16)>,
    flash_size: u32,
    page_size: u32,
    options: u32,
    protected: Vec<u32>,
    stuck_busy: bool,
    reject_keys: bool,
    reject_prg_keys: bool,
    corrupt_writes: bool,
}

impl SimTarget {
    /// STM32F103 medium density with 64 KiB flash.
    pub(crate) fn f1() -> Self {
        Self {
            chip_id: 0x410,
            core_id: 0x1BA0_1477,
            idcode_reg: 0xE004_2000,
            cpuid: 0x411F_C231,
            model: Model::F1,
            size_reg: Some((0x1FFF_F7E0, 64)),
            flash_size: 64 * 1024,
            page_size: 0x400,
            options: 0,
            protected: Vec::new(),
            stuck_busy: false,
            reject_keys: false,
            reject_prg_keys: false,
            corrupt_writes: false,
        }
    }

    /// An early STM32F407 reporting the F2 chip id.
    pub(crate) fn f4() -> Self {
        Self {
            chip_id: 0x411,
            core_id: 0x2BA0_1477,
            cpuid: 0x410F_C241,
            model: Model::F4,
            size_reg: None,
            flash_size: 1024 * 1024,
            page_size: 0x4000,
            // Reads back with OPTLOCK set until unlocked.
            options: 0x0FFF_AAEC,
            ..Self::f1()
        }
    }

    /// STM32L151 medium density with 128 KiB flash.
    pub(crate) fn l1() -> Self {
        Self {
            chip_id: 0x416,
            core_id: 0x2BA0_1477,
            cpuid: 0x412F_C231,
            model: Model::L1,
            size_reg: Some((0x1FF8_004C, 128)),
            flash_size: 128 * 1024,
            page_size: 0x100,
            ..Self::f1()
        }
    }

    /// STM32G031 with 64 KiB flash.
    pub(crate) fn g0() -> Self {
        Self {
            chip_id: 0x466,
            core_id: 0x0BC1_1477,
            idcode_reg: 0x4001_5800,
            cpuid: 0x410C_C601,
            model: Model::G0,
            size_reg: Some((0x1FFF_75E0, 64)),
            flash_size: 64 * 1024,
            page_size: 0x800,
            options: 0xFFFF_FEAA,
            ..Self::f1()
        }
    }

    pub(crate) fn with_chip_id(mut self, chip_id: u16) -> Self {
        self.chip_id = chip_id;
        self
    }

    /// Leaves the flash size register unprogrammed.
    pub(crate) fn blank_size_register(mut self) -> Self {
        if let Some((_, kib)) = &mut self.size_reg {
            *kib = 0;
        }
        self
    }

    /// Makes erasing and programming the page at `page` fail.
    pub(crate) fn write_protect(mut self, page: u32) -> Self {
        self.protected.push(page);
        self
    }

    /// Makes the busy flag stay set forever.
    pub(crate) fn stuck_busy(mut self) -> Self {
        self.stuck_busy = true;
        self
    }

    /// Makes the controller ignore the unlock keys.
    pub(crate) fn reject_keys(mut self) -> Self {
        self.reject_keys = true;
        self
    }

    /// Makes the L1 controller ignore the program memory keys while accepting the PECR keys.
    pub(crate) fn reject_prg_keys(mut self) -> Self {
        self.reject_prg_keys = true;
        self
    }

    /// Flips the low bit of the first byte of every programming access.
    pub(crate) fn corrupt_writes(mut self) -> Self {
        self.corrupt_writes = true;
        self
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct Controller {
    locked: bool,
    opt_locked: bool,
    /// L1 program memory lock, below the PECR lock.
    prg_locked: bool,
    key_stage: u8,
    opt_key_stage: u8,
    prg_key_stage: u8,
    /// CR, or PECR on L1.
    cr: u32,
    sr: u32,
    ar: u32,
    options: u32,
}

fn key_step(stage: &mut u8, value: u32, first: u32, second: u32) -> bool {
    match (*stage, value) {
        (0, v) if v == first => {
            *stage = 1;
            false
        }
        (1, v) if v == second => {
            *stage = 0;
            true
        }
        _ => {
            *stage = 0;
            false
        }
    }
}

fn flag(set: bool, bit: u32) -> u32 {
    if set {
        bit
    } else {
        0
    }
}

enum Reply {
    None,
    In(Vec<u8>),
    /// Waiting for a data phase to write at this address, with accesses of this many bytes.
    Out(u32, u8),
}

/// The simulated probe. Implements `Transport`.
#[derive(Debug)]
pub(crate) struct SimProbe {
    /// Every command frame sent so far, as it appeared on the wire.
    pub(crate) frames: Vec<Vec<u8>>,
    /// Makes the next `recv` return no data.
    pub(crate) truncate_next_reply: bool,
    framing: Framing,
    version: [u8; 6],
    mode: u8,
    tag: u32,
    replies: VecDeque<u8>,
    pending_out: Option<(u32, u8)>,
    trace: VecDeque<u8>,
    tracing: bool,

    target: SimTarget,
    mem: HashMap<u32, u8>,
    regs: [u32; REG_COUNT],
    halted: bool,
    flash: Controller,
    loader_runs: usize,
}

impl SimProbe {
    pub(crate) fn new(target: SimTarget) -> Self {
        let flash = Controller {
            locked: true,
            opt_locked: true,
            prg_locked: true,
            options: target.options,
            ..Controller::default()
        };

        let mut this = Self {
            frames: Vec::new(),
            truncate_next_reply: false,
            framing: Framing::Native,
            version: [0; 6],
            mode: 0,
            tag: 0,
            replies: VecDeque::new(),
            pending_out: None,
            trace: VecDeque::new(),
            tracing: false,
            target,
            mem: HashMap::new(),
            regs: [0; REG_COUNT],
            halted: false,
            flash,
            loader_runs: 0,
        };

        this.firmware_mut(2, 37);
        let idcode = 0x1000_0000 | u32::from(this.target.chip_id);
        this.store(this.target.idcode_reg, &idcode.to_le_bytes());
        this.store(0xE000_ED00, &this.target.cpuid.to_le_bytes());
        if let Some((addr, kib)) = this.target.size_reg {
            this.store(addr, &kib.to_le_bytes());
        }
        this
    }

    /// Uses the legacy command envelope.
    pub(crate) fn legacy(mut self) -> Self {
        self.framing = Framing::Legacy;
        self
    }

    /// Sets the reported hardware and JTAG firmware versions.
    pub(crate) fn firmware(mut self, hw: u8, jtag: u8) -> Self {
        self.firmware_mut(hw, jtag);
        self
    }

    fn firmware_mut(&mut self, hw: u8, jtag: u8) {
        let bits = (u16::from(hw) << 12) | (u16::from(jtag) << 6) | 4;
        BigEndian::write_u16(&mut self.version[0..2], bits);
        LittleEndian::write_u16(&mut self.version[2..4], 0x0483);
        LittleEndian::write_u16(&mut self.version[4..6], 0x3748);
    }

    pub(crate) fn build(self) -> StLink<SimProbe> {
        StLink::new(self).unwrap()
    }

    pub(crate) fn last_frame(&self) -> &[u8] {
        self.frames.last().expect("no frames sent")
    }

    /// Overwrites flash contents without going through the controller.
    pub(crate) fn fill_flash(&mut self, addr: u32, data: &[u8]) {
        self.store(addr, data);
    }

    pub(crate) fn flash_locked(&self) -> bool {
        match self.target.model {
            Model::L1 => self.flash.locked && self.flash.prg_locked,
            _ => self.flash.locked,
        }
    }

    pub(crate) fn loader_runs(&self) -> usize {
        self.loader_runs
    }

    pub(crate) fn push_trace(&mut self, data: &[u8]) {
        self.trace.extend(data);
    }

    pub(crate) fn tracing(&self) -> bool {
        self.tracing
    }

    fn push_trailer(&mut self) {
        if self.framing == Framing::Legacy {
            let mut trailer = [0; 13];
            trailer[0..4].copy_from_slice(b"USBS");
            LittleEndian::write_u32(&mut trailer[4..8], self.tag);
            self.replies.extend(&trailer);
        }
    }

    // Memory

    fn in_flash(&self, addr: u32) -> bool {
        addr >= FLASH_BASE && addr - FLASH_BASE < self.target.flash_size
    }

    fn erased_value(&self) -> u8 {
        match self.target.model {
            Model::L1 => 0x00,
            _ => 0xFF,
        }
    }

    fn store(&mut self, addr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.mem.insert(addr + i as u32, b);
        }
    }

    fn load(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr + i as u32;
            *b = match self.mem.get(&a) {
                Some(&b) => b,
                None if self.in_flash(a) => self.erased_value(),
                None => 0,
            };
        }
    }

    fn read32(&self, addr: u32) -> u32 {
        if let Some(value) = self.ctrl_read(addr) {
            return value;
        }
        let mut word = [0; 4];
        self.load(addr, &mut word);
        LittleEndian::read_u32(&word)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        if !self.ctrl_write(addr, value) {
            self.write_bytes(addr, &value.to_le_bytes(), 4);
        }
    }

    /// Writes `data` using bus accesses `width` bytes wide.
    fn write_bytes(&mut self, addr: u32, data: &[u8], width: u8) {
        if self.in_flash(addr) {
            self.program(addr, data, width);
        } else {
            self.store(addr, data);
        }
    }

    // Flash controller

    fn protected(&self, start: u32, len: u32) -> bool {
        let page = self.target.page_size;
        self.target
            .protected
            .iter()
            .any(|&p| p < start + len && start < p + page)
    }

    fn erase(&mut self, start: u32, len: u32) -> bool {
        if self.protected(start, len) {
            return false;
        }
        let end = u64::from(start) + u64::from(len);
        self.mem
            .retain(|&a, _| a < start || u64::from(a) >= end);
        true
    }

    fn erase_page_at(&mut self, addr: u32) -> bool {
        let page = self.target.page_size;
        let start = FLASH_BASE + (addr - FLASH_BASE) / page * page;
        self.erase(start, page)
    }

    fn program(&mut self, addr: u32, data: &[u8], width: u8) {
        let ctrl = self.flash;
        let (allowed, and_in, lock_err, wp_err, eop) = match self.target.model {
            // Only half-word accesses program; anything else is a programming error.
            Model::F1 => (
                !ctrl.locked && ctrl.cr & f1::CR_PG != 0 && width == 2,
                true,
                f1::SR_PGERR,
                f1::SR_WRPRTERR,
                f1::SR_EOP,
            ),
            Model::F4 => (
                !ctrl.locked && ctrl.cr & f4::CR_PG != 0,
                true,
                f4::SR_PGSERR,
                f4::SR_WRPERR,
                f4::SR_EOP,
            ),
            Model::G0 => (
                !ctrl.locked && ctrl.cr & g0::CR_PG != 0,
                true,
                g0::SR_PGSERR,
                g0::SR_WRPERR,
                g0::SR_EOP,
            ),
            Model::L1 => {
                if ctrl.cr & (l1::PECR_ERASE | l1::PECR_PROG) == l1::PECR_ERASE | l1::PECR_PROG {
                    if !self.erase_page_at(addr) {
                        self.flash.sr |= l1::SR_WRPERR;
                    } else {
                        self.flash.sr |= l1::SR_EOP;
                    }
                    return;
                }
                (
                    !ctrl.locked && !ctrl.prg_locked,
                    false,
                    l1::SR_WRPERR,
                    l1::SR_WRPERR,
                    l1::SR_EOP,
                )
            }
        };

        if !allowed {
            self.flash.sr |= lock_err;
            return;
        }
        if self.protected(addr, data.len() as u32) {
            self.flash.sr |= wp_err;
            return;
        }

        let mut old = vec![0; data.len()];
        self.load(addr, &mut old);
        let mut new: Vec<u8> = if and_in {
            old.iter().zip(data).map(|(o, d)| o & d).collect()
        } else {
            data.to_vec()
        };
        if self.target.corrupt_writes {
            new[0] ^= 0x01;
        }
        self.store(addr, &new);
        self.flash.sr |= eop;
    }

    fn unlock_with(&mut self, value: u32, first: u32, second: u32) -> bool {
        let done = key_step(&mut self.flash.key_stage, value, first, second);
        done && !self.target.reject_keys
    }

    fn ctrl_read(&self, addr: u32) -> Option<u32> {
        let c = &self.flash;
        let busy = self.target.stuck_busy;
        Some(match (self.target.model, addr) {
            (Model::F1, f1::CR) => c.cr | flag(c.locked, f1::CR_LOCK),
            (Model::F1, f1::SR) => c.sr | flag(busy, f1::SR_BSY),
            (Model::F1, f1::AR) => c.ar,
            (Model::F4, f4::CR) => c.cr | flag(c.locked, f4::CR_LOCK),
            (Model::F4, f4::SR) => c.sr | flag(busy, f4::SR_BSY),
            (Model::F4, f4::OPTCR) => c.options | flag(c.opt_locked, f4::OPTCR_OPTLOCK),
            (Model::L1, l1::PECR) => {
                c.cr | flag(c.locked, l1::PECR_PELOCK) | flag(c.prg_locked, l1::PECR_PRGLOCK)
            }
            (Model::L1, l1::SR) => c.sr | flag(busy, l1::SR_BSY),
            (Model::G0, g0::CR) => {
                c.cr | flag(c.locked, g0::CR_LOCK) | flag(c.opt_locked, g0::CR_OPTLOCK)
            }
            (Model::G0, g0::SR) => c.sr | flag(busy, g0::SR_BSY),
            (Model::G0, g0::OPTR) => c.options,
            _ => return None,
        })
    }

    /// Handles a write to a flash controller register. Returns `false` for other addresses.
    fn ctrl_write(&mut self, addr: u32, value: u32) -> bool {
        match (self.target.model, addr) {
            (Model::F1, f1::KEYR) | (Model::F4, f4::KEYR) | (Model::G0, g0::KEYR) => {
                if self.unlock_with(value, KEY1, KEY2) {
                    self.flash.locked = false;
                }
            }
            (Model::F4, f4::OPTKEYR) | (Model::G0, g0::OPTKEYR) => {
                let done = key_step(&mut self.flash.opt_key_stage, value, OPTKEY1, OPTKEY2);
                if done && !self.target.reject_keys {
                    self.flash.opt_locked = false;
                }
            }
            (Model::L1, l1::PEKEYR) => {
                if self.unlock_with(value, l1::PEKEY1, l1::PEKEY2) {
                    self.flash.locked = false;
                }
            }
            (Model::L1, l1::PRGKEYR) => {
                let stage = &mut self.flash.prg_key_stage;
                let done = key_step(stage, value, l1::PRGKEY1, l1::PRGKEY2);
                let rejected = self.target.reject_keys || self.target.reject_prg_keys;
                if done && !self.flash.locked && !rejected {
                    self.flash.prg_locked = false;
                }
            }
            (Model::F1, f1::SR)
            | (Model::F4, f4::SR)
            | (Model::L1, l1::SR)
            | (Model::G0, g0::SR) => self.flash.sr &= !value,
            (Model::F1, f1::AR) => self.flash.ar = value,
            (Model::F1, f1::CR) => self.f1_cr(value),
            (Model::F4, f4::CR) => self.f4_cr(value),
            (Model::F4, f4::OPTCR) => {
                if value & f4::OPTCR_OPTLOCK != 0 {
                    self.flash.opt_locked = true;
                } else if !self.flash.opt_locked {
                    self.flash.options = value & !(f4::OPTCR_OPTLOCK | f4::OPTCR_OPTSTRT);
                }
            }
            (Model::L1, l1::PECR) => {
                if value & l1::PECR_PELOCK != 0 {
                    self.flash.locked = true;
                    self.flash.prg_locked = true;
                } else if value & l1::PECR_PRGLOCK != 0 {
                    self.flash.prg_locked = true;
                }
                if !self.flash.locked {
                    self.flash.cr = value & !(l1::PECR_PELOCK | l1::PECR_PRGLOCK);
                }
            }
            (Model::G0, g0::CR) => self.g0_cr(value),
            (Model::G0, g0::OPTR) => {
                if !self.flash.opt_locked {
                    self.flash.options = value;
                }
            }
            _ => return false,
        }
        true
    }

    fn f1_cr(&mut self, value: u32) {
        if value & f1::CR_LOCK != 0 {
            self.flash.locked = true;
        }
        if self.flash.locked {
            return;
        }
        self.flash.cr = value & !(f1::CR_LOCK | f1::CR_STRT);
        if value & f1::CR_STRT == 0 {
            return;
        }

        let ok = if value & f1::CR_MER != 0 {
            self.erase(FLASH_BASE, self.target.flash_size)
        } else if value & f1::CR_PER != 0 {
            self.erase_page_at(self.flash.ar)
        } else {
            true
        };
        self.flash.sr |= if ok { f1::SR_EOP } else { f1::SR_WRPRTERR };
    }

    fn f4_cr(&mut self, value: u32) {
        if value & f4::CR_LOCK != 0 {
            self.flash.locked = true;
        }
        if self.flash.locked {
            return;
        }
        self.flash.cr = value & !(f4::CR_LOCK | f4::CR_STRT);
        if value & f4::CR_STRT == 0 {
            return;
        }

        let ok = if value & f4::CR_MER != 0 {
            self.erase(FLASH_BASE, self.target.flash_size)
        } else if value & f4::CR_SER != 0 {
            let mut snb = (value >> 3) & 0x1F;
            let mut bank = 0;
            if snb >= 16 {
                snb -= 16;
                bank = 0x10_0000;
            }
            let (start, len) = match snb {
                0..=3 => (snb * 0x4000, 0x4000),
                4 => (0x1_0000, 0x1_0000),
                n => ((n - 4) * 0x2_0000, 0x2_0000),
            };
            self.erase(FLASH_BASE + bank + start, len)
        } else {
            true
        };
        self.flash.sr |= if ok { f4::SR_EOP } else { f4::SR_WRPERR };
    }

    fn g0_cr(&mut self, value: u32) {
        if value & g0::CR_LOCK != 0 {
            self.flash.locked = true;
            self.flash.opt_locked = true;
        }
        if self.flash.locked {
            return;
        }
        self.flash.cr = value & !(g0::CR_LOCK | g0::CR_OPTLOCK | g0::CR_STRT | g0::CR_OPTSTRT);

        if value & g0::CR_OPTSTRT != 0 {
            self.flash.sr |= if self.flash.opt_locked {
                g0::SR_PGSERR
            } else {
                g0::SR_EOP
            };
        }
        if value & g0::CR_STRT == 0 {
            return;
        }

        let ok = if value & g0::CR_MER1 != 0 {
            self.erase(FLASH_BASE, self.target.flash_size)
        } else if value & g0::CR_PER != 0 {
            let page = (value >> 3) & 0x3FF;
            self.erase(FLASH_BASE + page * self.target.page_size, self.target.page_size)
        } else {
            true
        };
        self.flash.sr |= if ok { g0::SR_EOP } else { g0::SR_WRPERR };
    }

    // Core

    fn fetch16(&self, addr: u32) -> u16 {
        let mut half = [0; 2];
        self.load(addr, &mut half);
        LittleEndian::read_u16(&half)
    }

    /// Runs Thumb code from the current PC until a breakpoint.
    ///
    /// Only the instructions used by the flash loader are supported.
    fn run_loader(&mut self) {
        self.loader_runs += 1;
        let mut carry = false;

        for _ in 0..MAX_STEPS {
            let pc = self.regs[PC];
            let op = self.fetch16(pc);
            let lo = usize::from(op & 7);
            let mid = usize::from((op >> 3) & 7);
            let mut next = pc + 2;

            match op {
                // cmp rn, rm
                _ if op & 0xFFC0 == 0x4280 => carry = self.regs[lo] >= self.regs[mid],
                // b<cond>
                _ if op & 0xF000 == 0xD000 => {
                    let taken = match (op >> 8) & 0xF {
                        2 => carry,
                        3 => !carry,
                        cond => panic!("unsupported condition {}", cond),
                    };
                    if taken {
                        let offset = i32::from(op as u8 as i8) * 2;
                        next = (pc as i32 + 4 + offset) as u32;
                    }
                }
                // ldr rt, [rn, #imm]
                _ if op & 0xF800 == 0x6800 => {
                    let imm = u32::from((op >> 6) & 0x1F) * 4;
                    self.regs[lo] = self.read32(self.regs[mid] + imm);
                }
                // str rt, [rn, #imm]
                _ if op & 0xF800 == 0x6000 => {
                    let imm = u32::from((op >> 6) & 0x1F) * 4;
                    let (addr, value) = (self.regs[mid] + imm, self.regs[lo]);
                    self.write32(addr, value);
                }
                // adds rdn, #imm8
                _ if op & 0xF800 == 0x3000 => {
                    let rdn = usize::from((op >> 8) & 7);
                    self.regs[rdn] = self.regs[rdn].wrapping_add(u32::from(op & 0xFF));
                }
                // b
                _ if op & 0xF800 == 0xE000 => {
                    let imm11 = i32::from(op & 0x7FF);
                    let offset = if imm11 & 0x400 != 0 { imm11 - 0x800 } else { imm11 } * 2;
                    next = (pc as i32 + 4 + offset) as u32;
                }
                // bkpt
                _ if op & 0xFF00 == 0xBE00 => {
                    self.halted = true;
                    return;
                }
                _ => panic!("unsupported instruction {:#06x} at {:#010x}", op, pc),
            }

            self.regs[PC] = next;
        }

        panic!("loader didn't finish in {} steps", MAX_STEPS);
    }

    // Probe

    fn ok() -> Reply {
        Reply::In(vec![STATUS_OK, 0])
    }

    fn execute(&mut self, cmd: &[u8]) -> Reply {
        let addr = LittleEndian::read_u32(&cmd[2..6]);
        let len = usize::from(LittleEndian::read_u16(&cmd[6..8]));

        match (cmd[0], cmd[1]) {
            (0xF1, _) => Reply::In(self.version.to_vec()),
            (0xF5, _) => Reply::In(vec![self.mode, 0]),
            (0xF3, 0x07) => {
                self.mode = 1;
                Reply::None
            }
            (0xF7, _) => {
                let mut reply = vec![0; 8];
                LittleEndian::write_u32(&mut reply[0..4], 1000);
                LittleEndian::write_u32(&mut reply[4..8], 1375);
                Reply::In(reply)
            }
            (0xF2, 0x30) => {
                self.mode = 2;
                Reply::None
            }
            (0xF2, 0x21) => {
                self.mode = 1;
                Reply::None
            }
            (0xF2, 0x22) => Reply::In(self.target.core_id.to_le_bytes().to_vec()),
            (0xF2, 0x01) => Reply::In(vec![
                if self.halted { STATUS_HALTED } else { STATUS_OK },
                0,
            ]),
            (0xF2, 0x02) | (0xF2, 0x0A) => {
                self.halted = true;
                Self::ok()
            }
            (0xF2, 0x03) => {
                self.halted = false;
                Self::ok()
            }
            (0xF2, 0x09) => {
                self.halted = false;
                let pc = self.regs[PC];
                if pc >= SRAM_BASE && pc < SRAM_BASE + 0x10_0000 {
                    self.run_loader();
                }
                Self::ok()
            }
            (0xF2, 0x3C) => Self::ok(),
            (0xF2, 0x04) => {
                let mut reply = vec![0; REG_COUNT * 4];
                for (i, reg) in self.regs.iter().enumerate() {
                    LittleEndian::write_u32(&mut reply[i * 4..i * 4 + 4], *reg);
                }
                Reply::In(reply)
            }
            (0xF2, 0x05) => Reply::In(self.regs[usize::from(cmd[2])].to_le_bytes().to_vec()),
            (0xF2, 0x06) => {
                self.regs[usize::from(cmd[2])] = LittleEndian::read_u32(&cmd[3..7]);
                Self::ok()
            }
            (0xF2, 0x07) => {
                let mut reply = vec![0; len];
                self.load(addr, &mut reply);
                Reply::In(reply)
            }
            (0xF2, 0x0C) => {
                let mut reply = vec![0; cmp::max(len, 2)];
                self.load(addr, &mut reply[..len]);
                Reply::In(reply)
            }
            (0xF2, 0x08) => Reply::Out(addr, 4),
            (0xF2, 0x0D) => Reply::Out(addr, 1),
            (0xF2, 0x48) => Reply::Out(addr, 2),
            (0xF2, 0x36) => {
                let mut reply = vec![STATUS_OK, 0, 0, 0, 0, 0, 0, 0];
                LittleEndian::write_u32(&mut reply[4..8], self.read32(addr));
                Reply::In(reply)
            }
            (0xF2, 0x35) => {
                self.write32(addr, LittleEndian::read_u32(&cmd[6..10]));
                Self::ok()
            }
            (0xF2, 0x40) => {
                self.tracing = true;
                Self::ok()
            }
            (0xF2, 0x41) => {
                self.tracing = false;
                Self::ok()
            }
            (0xF2, 0x42) => {
                let available = cmp::min(self.trace.len(), 0xFFFF) as u16;
                Reply::In(available.to_le_bytes().to_vec())
            }
            _ => panic!("unsupported command {:x?}", cmd),
        }
    }
}

impl Transport for SimProbe {
    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        if let Some((addr, width)) = self.pending_out.take() {
            self.write_bytes(addr, data, width);
            self.push_trailer();
            return Ok(data.len());
        }

        let cmd = match self.framing {
            Framing::Native => {
                assert_eq!(data.len(), 16);
                data.to_vec()
            }
            Framing::Legacy => {
                assert_eq!(data.len(), 31);
                assert_eq!(&data[0..4], b"USBC");
                self.tag = LittleEndian::read_u32(&data[4..8]);
                data[15..31].to_vec()
            }
        };
        self.frames.push(data.to_vec());

        match self.execute(&cmd) {
            Reply::None => self.push_trailer(),
            Reply::In(reply) => {
                self.replies.extend(reply);
                self.push_trailer();
            }
            Reply::Out(addr, width) => self.pending_out = Some((addr, width)),
        }
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.truncate_next_reply {
            self.truncate_next_reply = false;
            self.replies.clear();
            return Ok(0);
        }

        let len = cmp::min(buf.len(), self.replies.len());
        for (b, reply) in buf.iter_mut().zip(self.replies.drain(..len)) {
            *b = reply;
        }
        Ok(len)
    }

    fn recv_trace(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let len = cmp::min(buf.len(), self.trace.len());
        for (b, byte) in buf.iter_mut().zip(self.trace.drain(..len)) {
            *b = byte;
        }
        Ok(len)
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn serial(&self) -> &str {
        "SIM0001"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_copies_words() {
        let mut sim = SimProbe::new(SimTarget::f1());
        let code = [
            0x93, 0x42, 0x05, 0xD2, 0x0C, 0x68, 0x04, 0x60, 0x04, 0x30, 0x04, 0x31, 0x01, 0x33,
            0xF7, 0xE7, 0x00, 0xBE,
        ];
        sim.store(SRAM_BASE, &code);
        sim.store(SRAM_BASE + 0x100, &[1, 2, 3, 4, 5, 6, 7, 8]);
        sim.regs[0] = SRAM_BASE + 0x200;
        sim.regs[1] = SRAM_BASE + 0x100;
        sim.regs[2] = 2;
        sim.regs[3] = 0;
        sim.regs[PC] = SRAM_BASE;

        sim.run_loader();
        assert!(sim.halted);
        assert_eq!(sim.regs[3], 2);
        assert_eq!(sim.read32(SRAM_BASE + 0x200), 0x0403_0201);
        assert_eq!(sim.read32(SRAM_BASE + 0x204), 0x0807_0605);
        assert_eq!(sim.regs[PC], SRAM_BASE + 16);
    }

    #[test]
    fn f1_programs_only_half_words() {
        let mut sim = SimProbe::new(SimTarget::f1());
        sim.write32(f1::KEYR, KEY1);
        sim.write32(f1::KEYR, KEY2);
        sim.write32(f1::CR, f1::CR_PG);

        sim.write_bytes(FLASH_BASE, &[0x12, 0x34], 1);
        assert_eq!(sim.read32(f1::SR) & f1::SR_PGERR, f1::SR_PGERR);
        assert_eq!(sim.read32(FLASH_BASE), 0xFFFF_FFFF);

        sim.write32(f1::SR, f1::SR_PGERR);
        sim.write_bytes(FLASH_BASE, &[0x12, 0x34], 2);
        assert_eq!(sim.read32(f1::SR) & f1::SR_PGERR, 0);
        assert_eq!(sim.read32(FLASH_BASE), 0xFFFF_3412);
    }
}
