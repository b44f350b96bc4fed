//! SWO packet stream decoder.
//!
//! The decoder extracts the bytes the target writes to ITM stimulus port 0 and discards every
//! other packet, keeping counters and bitmaps of what it saw. It never fails: malformed or unknown
//! bytes are only recorded.

use bitflags::bitflags;
use log::{debug, warn};
use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

/// Time of trace capture after which the configuration check runs.
const CHECK_AFTER: Duration = Duration::from_secs(10);

/// Minimum raw byte count expected within the check period.
const MIN_RAW_BYTES: u64 = 100;
/// Maximum protocol errors tolerated within the check period.
const MAX_ERRORS: u64 = 1;
/// Minimum timestamp packets expected within the check period.
const MIN_TIMESTAMPS: u64 = 10;

/// Header of a single-byte packet from stimulus port 0.
const TARGET_SOURCE: u8 = 0x01;
const OVERFLOW: u8 = 0x70;

fn is_overflow(b: u8) -> bool {
    b == OVERFLOW
}

fn is_local_timestamp(b: u8) -> bool {
    b & 0x0F == 0 && b & 0x70 != 0
}

fn is_global_timestamp(b: u8) -> bool {
    b & 0xDF == 0x94
}

fn is_timestamp(b: u8) -> bool {
    is_local_timestamp(b) || is_global_timestamp(b)
}

fn is_extension(b: u8) -> bool {
    b & 0x0B == 0x08
}

/// Payload size of a source packet header, or `None` if `b` isn't one.
fn source_size(b: u8) -> Option<u8> {
    match b & 0x03 {
        0 => None,
        1 => Some(1),
        2 => Some(2),
        _ => Some(4),
    }
}

/// Hardware (DWT) sources have bit 2 set; software (ITM) sources don't.
fn is_hardware_source(b: u8) -> bool {
    b & 0x04 != 0
}

fn source_address(b: u8) -> u8 {
    b >> 3
}

fn continuation_bit(b: u8) -> bool {
    b & 0x80 != 0
}

fn after(b: u8) -> DecoderState {
    if continuation_bit(b) {
        DecoderState::SkipFrame
    } else {
        DecoderState::Idle
    }
}

/// State of the trace decoder between two bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecoderState {
    /// Waiting for a packet header.
    Idle,
    /// The next byte is target output.
    TargetSource,
    /// Skipping bytes until one without the continuation bit.
    SkipFrame,
    /// Four payload bytes left to skip.
    Skip4,
    /// Three payload bytes left to skip.
    Skip3,
    /// Two payload bytes left to skip.
    Skip2,
    /// One payload byte left to skip.
    Skip1,
}

/// Statistics collected by a [`TraceDecoder`].
///
/// All counters only ever increase during a session.
///
/// [`TraceDecoder`]: struct.TraceDecoder.html
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TraceCounters {
    /// Bytes fed into the decoder.
    pub raw_bytes: u64,
    /// Bytes of target output.
    pub target_bytes: u64,
    /// Local and global timestamp packets.
    pub timestamps: u64,
    /// Overflow packets sent by the target.
    pub hw_overflows: u64,
    /// Reads that returned a full probe buffer, which means data was probably dropped.
    pub sw_overflows: u64,
    /// Unknown packet headers.
    pub errors: u64,
}

impl fmt::Display for TraceCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, {} target bytes, {} timestamps, {} hw overflows, {} sw overflows, {} errors",
            self.raw_bytes,
            self.target_bytes,
            self.timestamps,
            self.hw_overflows,
            self.sw_overflows,
            self.errors
        )
    }
}

bitflags! {
    /// Problems found by [`TraceDecoder::check_configuration`].
    ///
    /// [`TraceDecoder::check_configuration`]: struct.TraceDecoder.html#method.check_configuration
    pub struct ConfigurationIssues: u8 {
        /// Almost no data arrived. The trace clock, the pin configuration or the target firmware
        /// is probably wrong.
        const NO_DATA = 1 << 0;
        /// Data arrived but doesn't look like a valid packet stream, which usually means a wrong
        /// trace frequency.
        const BAD_DATA = 1 << 1;
        /// The host didn't read fast enough and data was dropped.
        const DROPPED_DATA = 1 << 2;
    }
}

/// Decodes the SWO byte stream of one trace session.
#[derive(Debug, Clone)]
pub struct TraceDecoder {
    state: DecoderState,
    counters: TraceCounters,
    unknown_opcodes: [u32; 8],
    unknown_sources: u32,
    checked: bool,
}

impl Default for TraceDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
            counters: TraceCounters::default(),
            unknown_opcodes: [0; 8],
            unknown_sources: 0,
            checked: false,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Returns the counters accumulated so far.
    pub fn counters(&self) -> &TraceCounters {
        &self.counters
    }

    /// Returns the unknown packet headers seen so far, in ascending order.
    pub fn unknown_opcodes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8)
            .filter(move |&b| self.unknown_opcodes[usize::from(b >> 5)] & (1 << (b & 31)) != 0)
    }

    /// Returns the addresses of unexpected software sources seen so far, in ascending order.
    pub fn unknown_sources(&self) -> impl Iterator<Item = u8> + '_ {
        (0..32u8).filter(move |&addr| self.unknown_sources & (1 << addr) != 0)
    }

    /// Processes one byte and returns it if it is target output.
    pub fn step(&mut self, b: u8) -> Option<u8> {
        self.counters.raw_bytes += 1;

        let (next, output) = match self.state {
            DecoderState::Idle => (self.classify(b), None),
            DecoderState::TargetSource => {
                self.counters.target_bytes += 1;
                (DecoderState::Idle, Some(b))
            }
            DecoderState::SkipFrame => (after(b), None),
            DecoderState::Skip4 => (DecoderState::Skip3, None),
            DecoderState::Skip3 => (DecoderState::Skip2, None),
            DecoderState::Skip2 => (DecoderState::Skip1, None),
            DecoderState::Skip1 => (DecoderState::Idle, None),
        };

        self.state = next;
        output
    }

    /// Handles a packet header.
    fn classify(&mut self, b: u8) -> DecoderState {
        if is_overflow(b) {
            self.counters.hw_overflows += 1;
            return after(b);
        }
        if is_timestamp(b) {
            self.counters.timestamps += 1;
            return after(b);
        }
        if is_extension(b) {
            return after(b);
        }

        if let Some(size) = source_size(b) {
            if b == TARGET_SOURCE {
                return DecoderState::TargetSource;
            }

            if !is_hardware_source(b) {
                let addr = source_address(b);
                if self.unknown_sources & (1 << addr) == 0 {
                    debug!("trace data from unexpected stimulus port {}", addr);
                    self.unknown_sources |= 1 << addr;
                }
            }

            return match size {
                1 => DecoderState::Skip1,
                2 => DecoderState::Skip2,
                _ => DecoderState::Skip4,
            };
        }

        let (word, bit) = (usize::from(b >> 5), 1 << (b & 31));
        if self.unknown_opcodes[word] & bit == 0 {
            debug!("unknown trace packet header {:#04x}", b);
            self.unknown_opcodes[word] |= bit;
        }
        self.counters.errors += 1;
        after(b)
    }

    /// Decodes `data`, writing target output to `sink`.
    ///
    /// `sink` is flushed after every newline.
    pub fn feed<W: Write>(&mut self, data: &[u8], sink: &mut W) -> io::Result<()> {
        for &b in data {
            if let Some(c) = self.step(b) {
                sink.write_all(&[c])?;
                if c == b'\n' {
                    sink.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Records the size of a read from the probe's trace buffer.
    ///
    /// A read that returns the whole probe buffer (`buffer_len` bytes or more) counts as a
    /// software overflow.
    pub fn record_read(&mut self, len: usize, buffer_len: usize) {
        if len >= buffer_len {
            self.counters.sw_overflows += 1;
        }
    }

    /// Checks the counters for signs of a broken trace setup.
    ///
    /// Returns `None` until `elapsed` reaches 10 seconds, then returns the result of the check
    /// exactly once (an empty set means everything looks fine). Subsequent calls return `None`.
    pub fn check_configuration(&mut self, elapsed: Duration) -> Option<ConfigurationIssues> {
        if self.checked || elapsed < CHECK_AFTER {
            return None;
        }
        self.checked = true;

        let c = &self.counters;
        let mut issues = ConfigurationIssues::empty();
        if c.raw_bytes < MIN_RAW_BYTES {
            issues |= ConfigurationIssues::NO_DATA;
        }
        if c.errors > MAX_ERRORS || c.timestamps < MIN_TIMESTAMPS || self.unknown_sources != 0 {
            issues |= ConfigurationIssues::BAD_DATA;
        }
        if c.sw_overflows > 0 {
            issues |= ConfigurationIssues::DROPPED_DATA;
        }

        if !issues.is_empty() {
            warn!("trace configuration looks wrong ({:?}): {}", issues, c);
        }
        Some(issues)
    }
}
