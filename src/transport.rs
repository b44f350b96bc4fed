//! USB bulk transport to the probe.

use crate::error::ResultExt as _;
use crate::protocol::Framing;
use crate::{Error, ErrorKind, Result, StLink};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The USB vendor ID of STMicroelectronics.
pub(crate) const VID_ST: u16 = 0x0483;

/// The interface carrying the debug endpoints. It is the only one claimed.
const INTERFACE: u8 = 0;

/// A byte-oriented channel to an ST-Link probe.
///
/// The protocol is strictly half-duplex: every command is a `send`, optionally followed by more
/// `send`s or `recv`s. [`UsbTransport`] is the implementation used for real hardware, but any
/// type implementing this trait can be wrapped in a [`StLink`].
///
/// [`UsbTransport`]: struct.UsbTransport.html
/// [`StLink`]: struct.StLink.html
pub trait Transport {
    /// Sends `data` to the probe's command endpoint, returning the number of bytes written.
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Receives up to `buf.len()` bytes from the probe's reply endpoint.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Receives up to `buf.len()` bytes from the probe's SWO trace endpoint.
    fn recv_trace(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Returns the framing this probe expects around command frames.
    fn framing(&self) -> Framing;

    /// Returns the serial number of the probe, if it has one.
    fn serial(&self) -> &str {
        ""
    }
}

/// A known ST-Link hardware model, identified by its USB product ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProbeModel {
    pid: u16,
    name: &'static str,
    ep_out: u8,
    ep_in: u8,
    ep_trace: Option<u8>,
    framing: Framing,
}

impl ProbeModel {
    const fn new(
        pid: u16,
        name: &'static str,
        ep_out: u8,
        ep_in: u8,
        ep_trace: Option<u8>,
        framing: Framing,
    ) -> Self {
        Self {
            pid,
            name,
            ep_out,
            ep_in,
            ep_trace,
            framing,
        }
    }

    /// Looks up the model with USB product ID `pid`.
    pub fn from_pid(pid: u16) -> Option<&'static ProbeModel> {
        PROBE_MODELS.iter().find(|model| model.pid == pid)
    }

    /// Returns the USB product ID.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Returns the hardware generation name (eg. `"V2-1"`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns whether the probe captures SWO data.
    pub fn has_trace(&self) -> bool {
        self.ep_trace.is_some()
    }

    /// Returns the framing used by this model.
    pub fn framing(&self) -> Framing {
        self.framing
    }
}

#[rustfmt::skip]
static PROBE_MODELS: &[ProbeModel] = &[
    ProbeModel::new(0x3744, "V1",   0x02, 0x81, None,       Framing::Legacy),
    ProbeModel::new(0x3748, "V2",   0x02, 0x81, Some(0x83), Framing::Native),
    ProbeModel::new(0x374b, "V2-1", 0x01, 0x81, Some(0x82), Framing::Native),
    ProbeModel::new(0x374a, "V2-1", 0x01, 0x81, Some(0x82), Framing::Native), // Audio
    ProbeModel::new(0x3742, "V2-1", 0x01, 0x81, Some(0x82), Framing::Native), // No MSD
    ProbeModel::new(0x3752, "V2-1", 0x01, 0x81, Some(0x82), Framing::Native),
    ProbeModel::new(0x374e, "V3",   0x01, 0x81, Some(0x82), Framing::Native),
    ProbeModel::new(0x374f, "V3",   0x01, 0x81, Some(0x82), Framing::Native), // Bridge
    ProbeModel::new(0x3753, "V3",   0x01, 0x81, Some(0x82), Framing::Native), // 2VCP
];

/// A claimed ST-Link USB interface.
///
/// The interface is released when this value is dropped.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    model: &'static ProbeModel,
    serial: String,
}

impl UsbTransport {
    /// Opens and claims a specific ST-Link USB device.
    ///
    /// Claiming fails if another process already has the probe open.
    pub fn open(usb_device: UsbDeviceInfo) -> Result<Self> {
        let descr = usb_device
            .inner
            .device_descriptor()
            .stlink_err_while("reading device descriptor")?;
        let mut handle = usb_device
            .inner
            .open()
            .stlink_err_while("opening USB device")?;

        debug!("open: {} probe, device descriptor: {:#x?}", usb_device.model.name, descr);

        let conf = handle
            .active_configuration()
            .stlink_err_while("reading device configuration")?;
        if conf != 1 {
            warn!(
                "device in configuration {}, expected 1; changing configuration",
                conf
            );
            handle.set_active_configuration(1).stlink_err()?;
        }

        // The V1 probe enumerates as a mass storage device and is usually bound to the kernel's
        // driver.
        if rusb::supports_detach_kernel_driver()
            && handle.kernel_driver_active(INTERFACE).unwrap_or(false)
        {
            debug!("detaching kernel driver from interface {}", INTERFACE);
            handle
                .detach_kernel_driver(INTERFACE)
                .stlink_err_while("detaching kernel driver")?;
        }

        handle
            .claim_interface(INTERFACE)
            .stlink_err_while("taking control over USB device")?;

        let serial = match handle.read_serial_number_string_ascii(&descr) {
            Ok(serial) => serial,
            Err(e) => {
                warn!("could not read serial number: {}", e);
                String::new()
            }
        };

        Ok(Self {
            handle,
            model: usb_device.model,
            serial,
        })
    }

    /// Returns the hardware model of the opened probe.
    pub fn model(&self) -> &'static ProbeModel {
        self.model
    }
}

impl Transport for UsbTransport {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        trace!("send {} bytes: {:x?}", data.len(), data);
        self.handle
            .write_bulk(self.model.ep_out, data, timeout)
            .stlink_err_while("writing data to device")
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self
            .handle
            .read_bulk(self.model.ep_in, buf, timeout)
            .stlink_err_while("reading from device")?;
        trace!("recv {} bytes: {:x?}", n, &buf[..n]);
        Ok(n)
    }

    fn recv_trace(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let ep = self.model.ep_trace.ok_or_else(|| {
            Error::new(
                ErrorKind::MissingFeature,
                format!("ST-Link {} has no trace endpoint", self.model.name),
            )
        })?;
        self.handle
            .read_bulk(ep, buf, timeout)
            .stlink_err_while("reading trace data")
    }

    fn framing(&self) -> Framing {
        self.model.framing
    }

    fn serial(&self) -> &str {
        &self.serial
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            warn!("failed to release USB interface: {}", e);
        }
    }
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("model", &self.model.name)
            .field("serial", &self.serial)
            .finish()
    }
}

/// Generic info about an attached ST-Link probe.
///
/// Returned by [`scan_usb`].
///
/// [`scan_usb`]: fn.scan_usb.html
#[derive(Debug)]
pub struct UsbDeviceInfo {
    inner: rusb::Device<rusb::GlobalContext>,
    model: &'static ProbeModel,
}

impl UsbDeviceInfo {
    /// Returns the vendor ID.
    pub fn vid(&self) -> u16 {
        VID_ST
    }

    /// Returns the product ID.
    pub fn pid(&self) -> u16 {
        self.model.pid
    }

    /// Returns the hardware model of this probe.
    pub fn model(&self) -> &'static ProbeModel {
        self.model
    }

    /// Returns the bus this device is attached to.
    pub fn bus_number(&self) -> u8 {
        self.inner.bus_number()
    }

    /// Returns the device address on the bus it's attached to.
    pub fn address(&self) -> u8 {
        self.inner.address()
    }

    /// Tries to open this USB device.
    ///
    /// This method is equivalent to [`StLink::open_usb`].
    ///
    /// [`StLink::open_usb`]: struct.StLink.html#method.open_usb
    pub fn open(self) -> Result<StLink> {
        StLink::open_usb(self)
    }
}

/// Scans for ST-Link USB devices.
///
/// The returned iterator yields all devices with ST's vendor ID and a product ID of a known
/// ST-Link model.
pub fn scan_usb() -> Result<impl Iterator<Item = UsbDeviceInfo>> {
    log_libusb_info();

    Ok(rusb::devices()
        .stlink_err()?
        .iter()
        .filter_map(|dev| {
            let descr = match dev.device_descriptor() {
                Ok(descr) => descr,
                Err(e) => {
                    warn!("skipping device without readable descriptor: {}", e);
                    return None;
                }
            };

            if descr.vendor_id() != VID_ST {
                return None;
            }

            let model = ProbeModel::from_pid(descr.product_id())?;
            Some(UsbDeviceInfo { inner: dev, model })
        })
        .collect::<Vec<_>>()
        .into_iter())
}

fn log_libusb_info() {
    static DID_LOG: AtomicBool = AtomicBool::new(false);

    if DID_LOG.swap(true, Ordering::Acquire) {
        return;
    }

    let vers = rusb::version();
    debug!(
        "libusb {}.{}.{}.{}{}",
        vers.major(),
        vers.minor(),
        vers.micro(),
        vers.nano(),
        vers.rc().map(|rc| format!("-{}", rc)).unwrap_or_default(),
    );
    debug!(
        "libusb can detach kernel driver: {:?}",
        rusb::supports_detach_kernel_driver()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_lookup() {
        let v2 = ProbeModel::from_pid(0x3748).unwrap();
        assert_eq!(v2.name(), "V2");
        assert_eq!(v2.framing(), Framing::Native);
        assert!(v2.has_trace());

        let v1 = ProbeModel::from_pid(0x3744).unwrap();
        assert_eq!(v1.framing(), Framing::Legacy);
        assert!(!v1.has_trace());

        assert!(ProbeModel::from_pid(0x1234).is_none());
    }

    #[test]
    fn pids_are_unique() {
        for (i, model) in PROBE_MODELS.iter().enumerate() {
            assert!(
                PROBE_MODELS[i + 1..].iter().all(|m| m.pid != model.pid),
                "duplicate PID {:#06x}",
                model.pid
            );
        }
    }
}
