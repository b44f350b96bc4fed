//! The ST-Link command codec.
//!
//! Every operation is a single command frame, optionally followed by a data phase in either
//! direction. Multi-byte parameters are little-endian.

use crate::error::ResultExt as _;
use crate::features::Features;
use crate::mode::Mode;
use crate::transport::Transport;
use crate::{Error, ErrorKind, Result, StLink};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};
use std::time::Duration;
use std::{cmp, fmt};

/// Per-transfer USB timeout.
pub(crate) const TIMEOUT_DEFAULT: Duration = Duration::from_secs(3);

/// Size of a native command frame.
pub(crate) const CMD_LEN: usize = 16;

/// Size of the legacy command envelope wrapping a command frame.
pub(crate) const ENVELOPE_LEN: usize = 31;

/// Size of the legacy status trailer read after every command.
const TRAILER_LEN: usize = 13;

/// Command length announced in the legacy envelope.
const ENVELOPE_CMD_LEN: u8 = 10;

/// Capacity of the session data buffer, and the largest 32-bit memory transfer.
pub(crate) const DATA_BUF_LEN: usize = 6144;

/// Largest 8-bit memory transfer on V1/V2 probes.
pub(crate) const MAX_MEM8_LEN: usize = 64;

/// Largest 8-bit memory transfer on V3 probes.
pub(crate) const MAX_MEM8_LEN_V3: usize = 512;

/// Reply size of `read-all-registers`: 21 32-bit words.
pub(crate) const ALL_REGS_LEN: usize = 84;

#[repr(u8)]
#[derive(Copy, Clone)]
enum Command {
    GetVersion = 0xF1,
    Debug = 0xF2,
    Dfu = 0xF3,
    GetCurrentMode = 0xF5,
    GetTargetVoltage = 0xF7,
}

#[repr(u8)]
#[derive(Copy, Clone)]
pub(crate) enum DebugCommand {
    GetStatus = 0x01,
    ForceDebug = 0x02,
    ResetSys = 0x03,
    ReadAllRegs = 0x04,
    ReadReg = 0x05,
    WriteReg = 0x06,
    ReadMem32 = 0x07,
    WriteMem32 = 0x08,
    RunCore = 0x09,
    StepCore = 0x0A,
    ReadMem8 = 0x0C,
    WriteMem8 = 0x0D,
    Exit = 0x21,
    ReadCoreId = 0x22,
    Enter = 0x30,
    WriteDebugReg = 0x35,
    ReadDebugReg = 0x36,
    DriveNrst = 0x3C,
    StartTraceRx = 0x40,
    StopTraceRx = 0x41,
    GetTraceCount = 0x42,
    WriteMem16 = 0x48,
}

const DFU_EXIT: u8 = 0x07;
const ENTER_SWD: u8 = 0xA3;

/// How command frames are put on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Bare 16-byte command frames (V2 and later).
    Native,

    /// Command frames wrapped in a 31-byte envelope and followed by a 13-byte status trailer (V1).
    Legacy,
}

/// Direction and size of the data phase following a command frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Data {
    None,
    /// Receive this many bytes into the data buffer.
    In(usize),
    /// Send this many bytes from the data buffer.
    Out(usize),
}

impl Data {
    fn len(self) -> usize {
        match self {
            Data::None => 0,
            Data::In(len) | Data::Out(len) => len,
        }
    }
}

/// Status byte returned by debug commands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    Fault,
    UnknownError,
    NoDeviceConnected,
    CmdWait,
    CmdError,
    AlignmentError,
    WriteError,
    SwdApWait,
    SwdApFault,
    SwdApError,
    SwdDpWait,
    SwdDpFault,
    SwdDpError,
    SwoNotAvailable,
    Other(u8),
}

impl From<u8> for Status {
    fn from(raw: u8) -> Self {
        match raw {
            0x80 => Status::Ok,
            0x81 => Status::Fault,
            0x01 => Status::UnknownError,
            0x05 => Status::NoDeviceConnected,
            0x07 => Status::CmdWait,
            0x08 => Status::CmdError,
            0x0A => Status::AlignmentError,
            0x0C => Status::WriteError,
            0x10 => Status::SwdApWait,
            0x11 => Status::SwdApFault,
            0x12 => Status::SwdApError,
            0x14 => Status::SwdDpWait,
            0x15 => Status::SwdDpFault,
            0x16 => Status::SwdDpError,
            0x20 => Status::SwoNotAvailable,
            other => Status::Other(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("ok"),
            Status::Fault => f.write_str("fault"),
            Status::UnknownError => f.write_str("unknown error"),
            Status::NoDeviceConnected => f.write_str("no target connected"),
            Status::CmdWait => f.write_str("command wait"),
            Status::CmdError => f.write_str("command error"),
            Status::AlignmentError => f.write_str("alignment error"),
            Status::WriteError => f.write_str("write error"),
            Status::SwdApWait => f.write_str("SWD AP wait"),
            Status::SwdApFault => f.write_str("SWD AP fault"),
            Status::SwdApError => f.write_str("SWD AP error"),
            Status::SwdDpWait => f.write_str("SWD DP wait"),
            Status::SwdDpFault => f.write_str("SWD DP fault"),
            Status::SwdDpError => f.write_str("SWD DP error"),
            Status::SwoNotAvailable => f.write_str("SWO not available"),
            Status::Other(raw) => write!(f, "status {:#04x}", raw),
        }
    }
}

/// Firmware version reported by the probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Version {
    hardware: u8,
    jtag: u8,
    swim: u8,
    vid: u16,
    pid: u16,
}

impl Version {
    /// Decodes the 6-byte `get-version` reply.
    ///
    /// The first two bytes are a big-endian bitfield: hardware version in bits 15..12, JTAG
    /// firmware version in bits 11..6 and SWIM version in bits 5..0. VID and PID follow as
    /// little-endian halfwords.
    pub(crate) fn parse(reply: &[u8]) -> Self {
        let bits = BigEndian::read_u16(&reply[0..2]);
        Self {
            hardware: (bits >> 12) as u8,
            jtag: ((bits >> 6) & 0x3F) as u8,
            swim: (bits & 0x3F) as u8,
            vid: LittleEndian::read_u16(&reply[2..4]),
            pid: LittleEndian::read_u16(&reply[4..6]),
        }
    }

    /// The hardware generation (1, 2 or 3).
    pub fn hardware(&self) -> u8 {
        self.hardware
    }

    /// The JTAG/SWD firmware version.
    pub fn jtag(&self) -> u8 {
        self.jtag
    }

    /// The SWIM firmware version.
    pub fn swim(&self) -> u8 {
        self.swim
    }

    /// The USB vendor ID reported by the firmware.
    pub fn vid(&self) -> u16 {
        self.vid
    }

    /// The USB product ID reported by the firmware.
    pub fn pid(&self) -> u16 {
        self.pid
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}J{}S{}", self.hardware, self.jtag, self.swim)
    }
}

fn send_all<T: Transport>(transport: &mut T, data: &[u8]) -> Result<()> {
    let written = transport.send(data, TIMEOUT_DEFAULT)?;
    if written != data.len() {
        return Err(Error::new(
            ErrorKind::Usb,
            format!(
                "incomplete write (expected {} bytes, wrote {})",
                data.len(),
                written
            ),
        ));
    }
    Ok(())
}

fn recv_exact<T: Transport>(transport: &mut T, buf: &mut [u8]) -> Result<()> {
    let mut total = 0;

    while total < buf.len() {
        let bytes = transport.recv(&mut buf[total..], TIMEOUT_DEFAULT)?;
        if bytes == 0 {
            return Err(Error::new(
                ErrorKind::Usb,
                format!(
                    "incomplete read (expected {} bytes, got {})",
                    buf.len(),
                    total
                ),
            ));
        }
        total += bytes;
    }

    Ok(())
}

fn check_alignment(addr: u32, len: usize, what: &str) -> Result<()> {
    if addr % 4 != 0 || len % 4 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!(
                "{} of {} bytes at {:#010x} is not 32-bit aligned",
                what, len, addr
            ),
        ));
    }
    Ok(())
}

/// Rejects ranges that run past the end of the 32-bit address space.
fn check_range(addr: u32, len: usize, what: &str) -> Result<()> {
    if u64::from(addr) + len as u64 > 1 << 32 {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!(
                "{} of {} bytes at {:#010x} wraps around the address space",
                what, len, addr
            ),
        ));
    }
    Ok(())
}

fn check_len(len: usize, max: usize, what: &str) -> Result<()> {
    if len > max {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("{} of {} bytes exceeds the {} byte limit", what, len, max),
        ));
    }
    Ok(())
}

impl<T: Transport> StLink<T> {
    /// Sends one command frame and performs its data phase.
    ///
    /// Received data is left at the start of the data buffer; outbound data must already be
    /// staged there.
    pub(crate) fn transfer(&mut self, cmd: &[u8], data: Data) -> Result<()> {
        debug_assert!(cmd.len() <= CMD_LEN);

        let frame_len = match self.framing {
            Framing::Native => {
                let frame = &mut self.cmd_buf[..CMD_LEN];
                frame.iter_mut().for_each(|b| *b = 0);
                frame[..cmd.len()].copy_from_slice(cmd);
                CMD_LEN
            }
            Framing::Legacy => {
                self.sequence = self.sequence.wrapping_add(1);
                let frame = &mut self.cmd_buf[..ENVELOPE_LEN];
                frame.iter_mut().for_each(|b| *b = 0);
                frame[0..4].copy_from_slice(b"USBC");
                LittleEndian::write_u32(&mut frame[4..8], self.sequence);
                LittleEndian::write_u32(&mut frame[8..12], data.len() as u32);
                frame[12] = match data {
                    Data::In(_) => 0x80,
                    _ => 0x00,
                };
                frame[13] = 0; // LUN
                frame[14] = ENVELOPE_CMD_LEN;
                frame[15..15 + cmd.len()].copy_from_slice(cmd);
                ENVELOPE_LEN
            }
        };

        trace!("command {:x?} ({:?})", cmd, data);
        send_all(&mut self.transport, &self.cmd_buf[..frame_len])?;

        match data {
            Data::None => {}
            Data::In(len) => recv_exact(&mut self.transport, &mut self.data_buf[..len])?,
            Data::Out(len) => send_all(&mut self.transport, &self.data_buf[..len])?,
        }

        if self.framing == Framing::Legacy {
            self.read_trailer()?;
        }

        Ok(())
    }

    fn read_trailer(&mut self) -> Result<()> {
        let mut trailer = [0; TRAILER_LEN];
        recv_exact(&mut self.transport, &mut trailer)?;

        let mut rd = &trailer[4..];
        let tag = rd.read_u32::<LittleEndian>().stlink_err()?;
        let residue = rd.read_u32::<LittleEndian>().stlink_err()?;
        let status = trailer[12];

        if &trailer[0..4] != b"USBS" {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("bad status trailer signature {:x?}", &trailer[0..4]),
            ));
        }
        if tag != self.sequence {
            warn!(
                "status trailer tag {} doesn't match sequence number {}",
                tag, self.sequence
            );
        }
        if status != 0 {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!(
                    "command {} failed with status {} (residue {})",
                    self.sequence, status, residue
                ),
            ));
        }

        Ok(())
    }

    /// Copies `data` into the data buffer for a following `Data::Out` phase.
    fn stage(&mut self, data: &[u8]) {
        self.data_buf[..data.len()].copy_from_slice(data);
    }

    /// Sends a debug command with a 2-byte status reply and checks the status.
    pub(crate) fn debug_command(&mut self, cmd: &[u8], what: &'static str) -> Result<()> {
        self.transfer(cmd, Data::In(2))?;
        match Status::from(self.data_buf[0]) {
            Status::Ok => Ok(()),
            status => Err(Error::with_while(
                ErrorKind::Protocol,
                format!("probe reported {}", status),
                what,
            )),
        }
    }

    pub(crate) fn read_version(&mut self) -> Result<Version> {
        self.transfer(&[Command::GetVersion as u8, 0x80], Data::In(6))?;
        Ok(Version::parse(&self.data_buf[..6]))
    }

    /// Returns the operating mode the probe is currently in.
    pub fn current_mode(&mut self) -> Result<Mode> {
        self.transfer(&[Command::GetCurrentMode as u8], Data::In(2))?;
        Ok(Mode::from_u8(self.data_buf[0]))
    }

    /// Leaves DFU or debug mode, whichever the probe is in.
    pub fn leave_current_mode(&mut self) -> Result<()> {
        let mode = self.current_mode()?;
        debug!("probe is in {} mode", mode);
        match mode {
            Mode::Dfu => self.exit_dfu(),
            Mode::Debug => self.exit_debug(),
            _ => Ok(()),
        }
    }

    /// Leaves the probe's firmware update mode.
    pub fn exit_dfu(&mut self) -> Result<()> {
        self.transfer(&[Command::Dfu as u8, DFU_EXIT], Data::None)
    }

    /// Enters debug mode using the SWD wire protocol.
    pub fn enter_swd(&mut self) -> Result<()> {
        self.transfer(
            &[Command::Debug as u8, DebugCommand::Enter as u8, ENTER_SWD],
            Data::None,
        )?;
        self.core_state = crate::CoreState::DebugRunning;
        Ok(())
    }

    /// Leaves debug mode.
    pub fn exit_debug(&mut self) -> Result<()> {
        self.transfer(
            &[Command::Debug as u8, DebugCommand::Exit as u8],
            Data::None,
        )?;
        self.core_state = crate::CoreState::Unknown;
        Ok(())
    }

    /// Reads the 32-bit debug port identification code of the target core.
    pub fn read_core_id(&mut self) -> Result<u32> {
        self.transfer(
            &[Command::Debug as u8, DebugCommand::ReadCoreId as u8],
            Data::In(4),
        )?;
        Ok(LittleEndian::read_u32(&self.data_buf[..4]))
    }

    /// Sends a debug command with a 2-byte reply and returns the first reply byte.
    pub(crate) fn debug_command_raw(&mut self, cmd: DebugCommand, arg: Option<u8>) -> Result<u8> {
        let mut frame = [Command::Debug as u8, cmd as u8, 0];
        let len = match arg {
            Some(arg) => {
                frame[2] = arg;
                3
            }
            None => 2,
        };
        self.transfer(&frame[..len], Data::In(2))?;
        Ok(self.data_buf[0])
    }

    /// Like `debug_command_raw`, but requires the reply to report success.
    pub(crate) fn debug_simple(
        &mut self,
        cmd: DebugCommand,
        arg: Option<u8>,
        what: &'static str,
    ) -> Result<()> {
        match Status::from(self.debug_command_raw(cmd, arg)?) {
            Status::Ok => Ok(()),
            status => Err(Error::with_while(
                ErrorKind::Protocol,
                format!("probe reported {}", status),
                what,
            )),
        }
    }

    /// Reads a 32-bit word through the debug register interface.
    ///
    /// This works while the core is running and is used for all memory-mapped peripheral
    /// registers (flash controller, identification registers).
    pub fn read_debug32(&mut self, addr: u32) -> Result<u32> {
        let mut cmd = [0; 6];
        cmd[0] = Command::Debug as u8;
        cmd[1] = DebugCommand::ReadDebugReg as u8;
        LittleEndian::write_u32(&mut cmd[2..6], addr);
        self.transfer(&cmd, Data::In(8))?;

        let status = Status::from(self.data_buf[0]);
        if status != Status::Ok {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("reading {:#010x} failed: {}", addr, status),
            ));
        }
        Ok(LittleEndian::read_u32(&self.data_buf[4..8]))
    }

    /// Writes a 32-bit word through the debug register interface.
    pub fn write_debug32(&mut self, addr: u32, value: u32) -> Result<()> {
        let mut cmd = [0; 10];
        cmd[0] = Command::Debug as u8;
        cmd[1] = DebugCommand::WriteDebugReg as u8;
        LittleEndian::write_u32(&mut cmd[2..6], addr);
        LittleEndian::write_u32(&mut cmd[6..10], value);
        self.debug_command(&cmd, "writing debug register")
    }

    fn mem_command(&mut self, cmd: DebugCommand, addr: u32, len: usize, data: Data) -> Result<()> {
        let mut frame = [0; 8];
        frame[0] = Command::Debug as u8;
        frame[1] = cmd as u8;
        LittleEndian::write_u32(&mut frame[2..6], addr);
        LittleEndian::write_u16(&mut frame[6..8], len as u16);
        self.transfer(&frame, data)
    }

    /// Reads target memory using 32-bit accesses.
    ///
    /// `addr` and `buf.len()` must be multiples of 4, and at most 6144 bytes can be read at once.
    pub fn read_mem32(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_alignment(addr, buf.len(), "32-bit read")?;
        check_len(buf.len(), DATA_BUF_LEN, "32-bit read")?;
        if buf.is_empty() {
            return Ok(());
        }

        self.mem_command(DebugCommand::ReadMem32, addr, buf.len(), Data::In(buf.len()))?;
        buf.copy_from_slice(&self.data_buf[..buf.len()]);
        Ok(())
    }

    /// Writes target memory using 32-bit accesses.
    ///
    /// `addr` and `data.len()` must be multiples of 4, and at most 6144 bytes can be written at
    /// once.
    pub fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_alignment(addr, data.len(), "32-bit write")?;
        check_len(data.len(), DATA_BUF_LEN, "32-bit write")?;
        if data.is_empty() {
            return Ok(());
        }

        self.stage(data);
        self.mem_command(DebugCommand::WriteMem32, addr, data.len(), Data::Out(data.len()))
    }

    /// Reads target memory using 8-bit accesses.
    pub fn read_mem8(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len(), self.max_mem8_len(), "8-bit read")?;
        if buf.is_empty() {
            return Ok(());
        }

        // Single byte reads return two bytes.
        let reply_len = cmp::max(buf.len(), 2);
        self.mem_command(DebugCommand::ReadMem8, addr, buf.len(), Data::In(reply_len))?;
        buf.copy_from_slice(&self.data_buf[..buf.len()]);
        Ok(())
    }

    /// Writes target memory using 8-bit accesses. No alignment is required.
    pub fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_len(data.len(), self.max_mem8_len(), "8-bit write")?;
        if data.is_empty() {
            return Ok(());
        }

        self.stage(data);
        self.mem_command(DebugCommand::WriteMem8, addr, data.len(), Data::Out(data.len()))
    }

    /// Writes target memory using 16-bit accesses.
    ///
    /// `addr` and `data.len()` must be multiples of 2. Requires [`Features::MEM16`].
    ///
    /// [`Features::MEM16`]: struct.Features.html#associatedconstant.MEM16
    pub fn write_mem16(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if addr % 2 != 0 || data.len() % 2 != 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "16-bit write of {} bytes at {:#010x} is not half-word aligned",
                    data.len(),
                    addr
                ),
            ));
        }
        check_len(data.len(), DATA_BUF_LEN, "16-bit write")?;
        if !self.features.contains(Features::MEM16) {
            return Err(Error::new(
                ErrorKind::MissingFeature,
                format!("firmware {} doesn't support 16-bit memory access", self.version),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }

        self.stage(data);
        self.mem_command(DebugCommand::WriteMem16, addr, data.len(), Data::Out(data.len()))
    }

    pub(crate) fn max_mem8_len(&self) -> usize {
        if self.features.contains(Features::RW8_512) {
            MAX_MEM8_LEN_V3
        } else {
            MAX_MEM8_LEN
        }
    }

    /// Reads an arbitrary range of target memory, splitting it into transfers the probe accepts.
    ///
    /// Unaligned ranges are widened to the surrounding 32-bit words.
    pub fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_range(addr, buf.len(), "read")?;
        if buf.is_empty() {
            return Ok(());
        }

        let start = addr & !3;
        let end = (u64::from(addr) + buf.len() as u64 + 3) & !3;
        let mut words = vec![0; (end - u64::from(start)) as usize];
        for (i, chunk) in words.chunks_mut(DATA_BUF_LEN).enumerate() {
            self.read_mem32(start + (i * DATA_BUF_LEN) as u32, chunk)?;
        }

        let skip = (addr - start) as usize;
        buf.copy_from_slice(&words[skip..skip + buf.len()]);
        Ok(())
    }

    /// Writes an arbitrary range of target memory.
    ///
    /// The aligned middle part is written with 32-bit accesses, unaligned edges with 8-bit ones.
    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_range(addr, data.len(), "write")?;
        let head = cmp::min((4 - (addr % 4) as usize) % 4, data.len());
        let body = (data.len() - head) & !3;
        let (head_data, rest) = data.split_at(head);
        let (body_data, tail_data) = rest.split_at(body);

        self.write_mem8(addr, head_data)?;

        let mut offset = head as u32;
        for chunk in body_data.chunks(DATA_BUF_LEN) {
            self.write_mem32(addr + offset, chunk)?;
            offset += chunk.len() as u32;
        }

        if tail_data.is_empty() {
            return Ok(());
        }
        self.write_mem8(addr + offset, tail_data)
    }

    /// Reads the target supply voltage in millivolts.
    pub fn target_voltage(&mut self) -> Result<u32> {
        self.transfer(&[Command::GetTargetVoltage as u8], Data::In(8))?;
        let factor = LittleEndian::read_u32(&self.data_buf[0..4]);
        let reading = LittleEndian::read_u32(&self.data_buf[4..8]);

        if factor == 0 {
            return Err(Error::new(
                ErrorKind::Protocol,
                "probe returned a zero voltage reference".to_string(),
            ));
        }
        Ok((2400 * u64::from(reading) / u64::from(factor)) as u32)
    }

    pub(crate) fn read_reg_raw(&mut self, index: u8) -> Result<u32> {
        self.transfer(
            &[Command::Debug as u8, DebugCommand::ReadReg as u8, index],
            Data::In(4),
        )?;
        Ok(LittleEndian::read_u32(&self.data_buf[..4]))
    }

    pub(crate) fn write_reg_raw(&mut self, index: u8, value: u32) -> Result<()> {
        let mut cmd = [0; 7];
        cmd[0] = Command::Debug as u8;
        cmd[1] = DebugCommand::WriteReg as u8;
        cmd[2] = index;
        LittleEndian::write_u32(&mut cmd[3..7], value);
        self.debug_command(&cmd, "writing core register")
    }

    /// Reads all core registers into the data buffer and returns them.
    pub(crate) fn read_all_regs_raw(&mut self) -> Result<&[u8]> {
        self.transfer(
            &[Command::Debug as u8, DebugCommand::ReadAllRegs as u8],
            Data::In(ALL_REGS_LEN),
        )?;
        Ok(&self.data_buf[..ALL_REGS_LEN])
    }

    pub(crate) fn start_trace_rx(&mut self, buf_size: u16, frequency: u32) -> Result<()> {
        let mut cmd = [0; 8];
        cmd[0] = Command::Debug as u8;
        cmd[1] = DebugCommand::StartTraceRx as u8;
        LittleEndian::write_u16(&mut cmd[2..4], buf_size);
        LittleEndian::write_u32(&mut cmd[4..8], frequency);
        self.debug_command(&cmd, "starting trace reception")
    }

    pub(crate) fn trace_bytes_available(&mut self) -> Result<usize> {
        self.transfer(
            &[Command::Debug as u8, DebugCommand::GetTraceCount as u8],
            Data::In(2),
        )?;
        Ok(usize::from(LittleEndian::read_u16(&self.data_buf[..2])))
    }

    pub(crate) fn recv_trace_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let bytes = self
                .transport
                .recv_trace(&mut buf[total..], TIMEOUT_DEFAULT)?;
            if bytes == 0 {
                return Err(Error::new(
                    ErrorKind::Usb,
                    format!(
                        "incomplete trace read (expected {} bytes, got {})",
                        buf.len(),
                        total
                    ),
                ));
            }
            total += bytes;
        }
        Ok(())
    }
}
