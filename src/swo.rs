//! SWO trace capture.
//!
//! Setting up tracing programs the target's debug, trace port (TPIU), ITM and DWT units for
//! asynchronous NRZ output on the SWO pin, then makes the probe sample that pin into its trace
//! buffer. The captured bytes are a raw ITM packet stream; see [`TraceDecoder`].
//!
//! [`TraceDecoder`]: struct.TraceDecoder.html

use crate::features::Features;
use crate::protocol::DebugCommand;
use crate::transport::Transport;
use crate::{Error, ErrorKind, Result, StLink};
use log::{debug, warn};
use std::io::{self, Cursor, Read};
use std::time::{Duration, Instant};
use std::{cmp, fmt, thread};

/// Size of the trace buffer allocated on the probe.
///
/// A read returning this many bytes means the buffer was full, and data was likely dropped.
pub const TRACE_BUF_LEN: usize = 4096;

const DHCSR: u32 = 0xE000_EDF0;
const DEMCR: u32 = 0xE000_EDFC;
const FP_CTRL: u32 = 0xE000_2000;
const DWT_CTRL: u32 = 0xE000_1000;
const DWT_FUNCTION0: u32 = 0xE000_1028;
const DBGMCU_CR: u32 = 0xE004_2004;
const TPI_CSPSR: u32 = 0xE004_0004;
const TPI_ACPR: u32 = 0xE004_0010;
const TPI_SPPR: u32 = 0xE004_00F0;
const TPI_FFCR: u32 = 0xE004_0304;
const ITM_LAR: u32 = 0xE000_0FB0;
const ITM_TCR: u32 = 0xE000_0E80;
const ITM_TER: u32 = 0xE000_0E00;
const ITM_TPR: u32 = 0xE000_0E40;

const DHCSR_DEBUGEN_HALT: u32 = 0xA05F_0003;
const DEMCR_TRCENA: u32 = 1 << 24;
const FP_CTRL_KEY: u32 = 1 << 1;
/// Keep debug clocks running in sleep, stop and standby, and enable the trace pin.
const DBGMCU_CR_TRACE: u32 = 0x27;
/// Port size of one bit.
const TPI_CSPSR_1BIT: u32 = 1;
/// Disable the formatter; ITM packets go out as-is.
const TPI_FFCR_TRIGIN: u32 = 0x100;
const TPI_SPPR_NRZ: u32 = 2;
const ITM_LAR_KEY: u32 = 0xC5AC_CE55;
/// Trace bus id 1, timestamps and ITM enabled.
const ITM_TCR_ENABLE: u32 = (1 << 16) | 3;
/// Cycle counter, exception and PC sampling with the slowest tap.
const DWT_CTRL_TRACE: u32 = (4 << 28) | (1 << 9) | (0xF << 5) | (0xF << 1) | 1;

/// Clock settings for [`StLink::start_trace`].
///
/// [`StLink::start_trace`]: struct.StLink.html#method.start_trace
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Frequency the target core (and thus the trace port) runs at.
    pub core_clock_hz: u32,
    /// SWO baud rate. Must divide `core_clock_hz` without too much error.
    pub trace_hz: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            core_clock_hz: 72_000_000,
            trace_hz: 2_000_000,
        }
    }
}

impl TraceConfig {
    fn prescaler(&self) -> Result<u32> {
        if self.trace_hz == 0 || self.trace_hz > self.core_clock_hz {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "cannot derive a {} Hz trace clock from a {} Hz core clock",
                    self.trace_hz, self.core_clock_hz
                ),
            ));
        }
        Ok(self.core_clock_hz / self.trace_hz - 1)
    }
}

impl<T: Transport> StLink<T> {
    fn require_trace(&self) -> Result<()> {
        if !self.features.contains(Features::TRACE) {
            return Err(Error::new(
                ErrorKind::MissingFeature,
                format!("firmware {} doesn't support SWO trace", self.version),
            ));
        }
        Ok(())
    }

    /// Configures the target for SWO output and starts capturing on the probe.
    ///
    /// Requires [`Features::TRACE`]. The core is halted by the setup.
    ///
    /// [`Features::TRACE`]: struct.Features.html#associatedconstant.TRACE
    pub fn start_trace(&mut self, config: &TraceConfig) -> Result<()> {
        self.require_trace()?;
        let prescaler = config.prescaler()?;
        debug!(
            "starting trace at {} Hz (core clock {} Hz, prescaler {})",
            config.trace_hz, config.core_clock_hz, prescaler
        );

        self.write_debug32(DHCSR, DHCSR_DEBUGEN_HALT)?;
        self.write_debug32(DEMCR, DEMCR_TRCENA)?;
        self.write_debug32(FP_CTRL, FP_CTRL_KEY)?;
        for n in 0..4 {
            self.write_debug32(DWT_FUNCTION0 + 0x10 * n, 0)?;
        }
        self.write_debug32(DWT_CTRL, 0)?;
        self.write_debug32(DBGMCU_CR, DBGMCU_CR_TRACE)?;

        self.start_trace_rx(TRACE_BUF_LEN as u16, config.trace_hz)?;

        self.write_debug32(TPI_CSPSR, TPI_CSPSR_1BIT)?;
        self.write_debug32(TPI_ACPR, prescaler)?;
        self.write_debug32(TPI_FFCR, TPI_FFCR_TRIGIN)?;
        self.write_debug32(TPI_SPPR, TPI_SPPR_NRZ)?;

        self.write_debug32(ITM_LAR, ITM_LAR_KEY)?;
        self.write_debug32(ITM_TCR, ITM_TCR_ENABLE)?;
        self.write_debug32(ITM_TER, 0xFFFF_FFFF)?;
        self.write_debug32(ITM_TPR, 0xF)?;
        self.write_debug32(DWT_CTRL, DWT_CTRL_TRACE)?;
        self.write_debug32(DEMCR, DEMCR_TRCENA)?;

        self.core_state = crate::CoreState::Halted;
        Ok(())
    }

    /// Stops capturing trace data.
    pub fn stop_trace(&mut self) -> Result<()> {
        self.require_trace()?;
        self.debug_simple(DebugCommand::StopTraceRx, None, "stopping trace reception")
    }

    /// Reads captured trace bytes into `buf` without waiting.
    ///
    /// Returns the number of bytes read, which is 0 if the probe has nothing buffered. A return
    /// value of [`TRACE_BUF_LEN`] or more means the probe buffer ran full.
    ///
    /// [`TRACE_BUF_LEN`]: constant.TRACE_BUF_LEN.html
    pub fn read_trace(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.trace_bytes_available()?;
        let len = cmp::min(available, buf.len());
        if len == 0 {
            return Ok(0);
        }
        if available > buf.len() {
            debug!("{} trace bytes buffered, reading {}", available, len);
        }

        self.recv_trace_exact(&mut buf[..len])?;
        Ok(len)
    }

    /// Starts tracing and returns a blocking `io::Read` over the captured bytes.
    pub fn trace_stream(&mut self, config: &TraceConfig) -> Result<TraceStream<'_, T>> {
        self.start_trace(config)?;
        Ok(TraceStream {
            probe: self,
            trace_hz: config.trace_hz,
            next_poll: Instant::now(),
            buf: Cursor::new(Vec::new()),
            overrun: false,
        })
    }
}

/// A trace data stream that implements `std::io::Read`.
///
/// Reading from this stream blocks until the probe has captured some data. The stream doesn't
/// stop tracing when dropped; call [`StLink::stop_trace`] afterwards.
///
/// [`StLink::stop_trace`]: struct.StLink.html#method.stop_trace
pub struct TraceStream<'a, T: Transport> {
    probe: &'a mut StLink<T>,
    trace_hz: u32,
    next_poll: Instant,
    /// Holds one probe buffer's worth of data.
    buf: Cursor<Vec<u8>>,
    overrun: bool,
}

impl<T: Transport> TraceStream<'_, T> {
    /// Returns whether the probe buffer ran full since the last call, and clears the flag.
    pub fn did_overrun(&mut self) -> bool {
        let did = self.overrun;
        self.overrun = false;
        did
    }

    /// Polling interval that empties the probe buffer about twice as often as it fills up.
    fn poll_interval(&self) -> Duration {
        const MULTIPLIER: u32 = 2;

        let bytes_per_sec = self.trace_hz / 10;
        let buffers_per_sec = cmp::max(1, bytes_per_sec / TRACE_BUF_LEN as u32) * MULTIPLIER;
        Duration::from_micros(1_000_000 / u64::from(buffers_per_sec))
    }
}

fn to_io_error(error: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

impl<T: Transport> Read for TraceStream<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buf.position() == self.buf.get_ref().len() as u64 {
            self.buf.get_mut().resize(TRACE_BUF_LEN, 0);
            loop {
                let now = Instant::now();
                if now < self.next_poll {
                    thread::sleep(self.next_poll - now);
                }

                let len = self
                    .probe
                    .read_trace(self.buf.get_mut())
                    .map_err(to_io_error)?;
                self.next_poll = Instant::now() + self.poll_interval();

                if len >= TRACE_BUF_LEN {
                    warn!("trace buffer full, data may have been dropped");
                    self.overrun = true;
                }

                if len != 0 {
                    self.buf.get_mut().truncate(len);
                    self.buf.set_position(0);
                    break;
                }

                // Nothing captured yet. Returning 0 would signal end of stream, so keep polling.
            }
        }

        self.buf.read(buf)
    }
}

impl<T: Transport> fmt::Debug for TraceStream<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceStream")
            .field("trace_hz", &self.trace_hz)
            .field("buffered", &(self.buf.get_ref().len() as u64 - self.buf.position()))
            .field("overrun", &self.overrun)
            .finish()
    }
}
