//! A crate for talking to ST-Link debug probes connected via USB.
//!
//! This crate speaks the vendor-specific command protocol of ST-Link V1, V2, V2-1 and V3 probes
//! to control an attached STM32 microcontroller over SWD. On top of the raw commands it offers
//! core control (halt, run, step, reset, register access), chip identification, flash
//! programming for all common STM32 flash controller families, and SWO trace capture with a
//! decoder for the ITM packet stream.
//!
//! It does *not* provide access to the virtual COM port or the mass storage drive of the probe
//! (both are regular USB class devices, so no special support is needed).
//!
//! # Usage
//!
//! ```no_run
//! use stlink::StLink;
//!
//! let mut probe = StLink::open_by_serial(None)?;
//! let target = probe.attach()?;
//! println!("{}", target);
//!
//! probe.write_flash(target.flash_base(), &[0xFF; 1024])?;
//! # Ok::<_, stlink::Error>(())
//! ```
//!
//! # Pinout
//!
//! ST-Link/V2 uses the standard 20-pin ARM JTAG connector. Only the SWD signals are used by this
//! library:
//!
//! ```notrust
//!            ┌───────────┐
//!     VAPP   │ *  1  2 * │ VAPP
//!         -  │ *  3  4 * │ GND
//!         -  │ *  5  6 * │ GND
//!     SWDIO  │ *  7  8 * │ GND
//!     SWCLK ┌┘ *  9 10 * │ GND
//!         - └┐ * 11 12 * │ GND
//!       SWO  │ * 13 14 * │ GND
//!     NRST   │ * 15 16 * │ GND
//!         -  │ * 17 18 * │ GND
//!         -  │ * 19 20 * │ GND
//!            └───────────┘
//! ```
//!
//! # Transports
//!
//! [`StLink`] is generic over a [`Transport`]. [`UsbTransport`] talks to real hardware through
//! libusb; other implementations can be plugged in for testing or for tunnelling the protocol.
//!
//! [`StLink`]: struct.StLink.html
//! [`Transport`]: trait.Transport.html
//! [`UsbTransport`]: struct.UsbTransport.html

#![doc(html_root_url = "https://docs.rs/stlink/0.1.0")]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod chip;
mod control;
mod error;
mod features;
mod flash;
mod mode;
mod protocol;
mod readme;
mod swo;
mod trace;
mod transport;

#[cfg(test)]
mod sim;

pub use self::chip::{ChipParams, FlashFamily, FlashSize, FLASH_BASE, SRAM_BASE};
pub use self::control::{CoreState, RegisterIndex, Registers, ResetLine, Target};
pub use self::error::{Error, ErrorKind};
pub use self::features::Features;
pub use self::flash::{FlashError, FlashOptions, VerifyMismatch};
pub use self::mode::Mode;
pub use self::protocol::{Framing, Version};
pub use self::swo::{TraceConfig, TraceStream, TRACE_BUF_LEN};
pub use self::trace::{ConfigurationIssues, DecoderState, TraceCounters, TraceDecoder};
pub use self::transport::{scan_usb, ProbeModel, Transport, UsbDeviceInfo, UsbTransport};

use self::protocol::{DATA_BUF_LEN, ENVELOPE_LEN};
use log::debug;
use std::fmt;

/// A result type with the error hardwired to [`Error`].
///
/// [`Error`]: struct.Error.html
pub type Result<T> = std::result::Result<T, Error>;

/// A session with an ST-Link probe.
///
/// This is the main interface type of this library. There are multiple ways of obtaining an
/// instance of it:
///
/// * [`StLink::open_by_serial`]: Either opens the only ST-Link probe connected to the computer, or
///   opens a specific one by its serial number. Recommended for applications that interact with
///   one probe only (ie. most of them).
/// * [`StLink::open_usb`]: Opens a specific probe according to the given [`UsbDeviceInfo`]. Also
///   see [`scan_usb`].
/// * [`StLink::new`]: Wraps any [`Transport`].
///
/// The session owns its command and data buffers; all operations take `&mut self`, so at most one
/// command is ever in flight.
///
/// [`StLink::open_by_serial`]: struct.StLink.html#method.open_by_serial
/// [`StLink::open_usb`]: struct.StLink.html#method.open_usb
/// [`StLink::new`]: struct.StLink.html#method.new
/// [`UsbDeviceInfo`]: struct.UsbDeviceInfo.html
/// [`scan_usb`]: fn.scan_usb.html
/// [`Transport`]: trait.Transport.html
pub struct StLink<T: Transport = UsbTransport> {
    transport: T,
    framing: Framing,
    /// Sequence number of the last legacy envelope.
    sequence: u32,
    cmd_buf: [u8; ENVELOPE_LEN],
    data_buf: Vec<u8>,
    version: Version,
    features: Features,
    core_state: CoreState,
    /// Set by `identify`. Flash operations need it.
    target: Option<Target>,
    flash_options: FlashOptions,
}

impl StLink<UsbTransport> {
    /// Opens an attached ST-Link probe by its serial number.
    ///
    /// If `serial` is `None`, this will open the only attached probe, and return an error of type
    /// [`MultipleDevicesFound`] when more than one is attached. This is usually the desired
    /// behavior of robust applications.
    ///
    /// [`MultipleDevicesFound`]: enum.ErrorKind.html#variant.MultipleDevicesFound
    pub fn open_by_serial(serial: Option<&str>) -> Result<Self> {
        let mut devices = scan_usb()?.filter_map(|usb_device| {
            let dev = match usb_device.open() {
                Ok(dev) => dev,
                Err(e) => {
                    debug!("skipping probe that failed to open: {}", e);
                    return None;
                }
            };

            match serial {
                Some(serial) if dev.serial() != serial => None,
                _ => Some(dev),
            }
        });

        let first = devices.next().ok_or_else(|| {
            let message = if let Some(serial) = serial {
                format!("no ST-Link probe with serial {} was found (make sure your current user has permissions to access it)", serial)
            } else {
                "no ST-Link probes found (make sure your current user has permissions to access them)".to_string()
            };
            Error::new(ErrorKind::DeviceNotFound, message)
        })?;

        if devices.next().is_some() {
            let msg = if let Some(serial) = serial {
                format!("found multiple probes matching serial {}", serial)
            } else {
                "multiple probes found (specify serial number to select one)".to_string()
            };
            return Err(Error::new(ErrorKind::MultipleDevicesFound, msg));
        }

        Ok(first)
    }

    /// Opens a specific ST-Link USB device.
    pub fn open_usb(usb_device: UsbDeviceInfo) -> Result<Self> {
        Self::new(UsbTransport::open(usb_device)?)
    }
}

impl<T: Transport> StLink<T> {
    /// Creates a session on top of `transport` and queries the probe's firmware version.
    pub fn new(transport: T) -> Result<Self> {
        let mut this = Self {
            framing: transport.framing(),
            transport,
            sequence: 0,
            cmd_buf: [0; ENVELOPE_LEN],
            data_buf: vec![0; DATA_BUF_LEN],
            version: Version::parse(&[0; 6]),
            features: Features::empty(),
            core_state: CoreState::Unknown,
            target: None,
            flash_options: FlashOptions::default(),
        };

        this.version = this.read_version()?;
        this.features = Features::from_version(&this.version);
        debug!(
            "probe firmware {} (VID {:#06x}, PID {:#06x}), features: {:?}",
            this.version,
            this.version.vid(),
            this.version.pid(),
            this.features
        );

        Ok(this)
    }

    /// Returns the firmware version read when the session was opened.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Returns the features supported by the probe firmware.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Returns the serial number of the probe.
    ///
    /// This serial number string can be passed to [`StLink::open_by_serial`] to open a specific
    /// probe.
    ///
    /// [`StLink::open_by_serial`]: #method.open_by_serial
    pub fn serial(&self) -> &str {
        self.transport.serial()
    }

    /// Returns the last known state of the target core.
    pub fn core_state(&self) -> CoreState {
        self.core_state
    }

    /// Returns the identified target.
    ///
    /// Fails with [`UnknownDevice`] if [`identify`] or [`attach`] hasn't succeeded yet.
    ///
    /// [`UnknownDevice`]: enum.ErrorKind.html#variant.UnknownDevice
    /// [`identify`]: #method.identify
    /// [`attach`]: #method.attach
    pub fn target(&self) -> Result<&Target> {
        self.target.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownDevice,
                "target has not been identified yet".to_string(),
            )
        })
    }

    /// Returns a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns the options used by flash operations.
    pub fn flash_options(&self) -> &FlashOptions {
        &self.flash_options
    }

    /// Replaces the options used by flash operations.
    pub fn set_flash_options(&mut self, options: FlashOptions) {
        self.flash_options = options;
    }

    /// Brings the probe into SWD debug mode and identifies the target.
    ///
    /// This leaves whatever mode the probe is currently in first, so it can be called on a probe
    /// in any state.
    pub fn attach(&mut self) -> Result<Target> {
        self.leave_current_mode()?;
        self.enter_swd()?;
        self.identify()
    }
}

impl<T: Transport> fmt::Debug for StLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StLink")
            .field("serial", &self.transport.serial())
            .field("framing", &self.framing)
            .field("version", &self.version)
            .field("core_state", &self.core_state)
            .field("target", &self.target)
            .finish()
    }
}
