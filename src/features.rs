use crate::protocol::Version;
use bitflags::bitflags;

bitflags! {
    /// Optional protocol features supported by the probe firmware.
    ///
    /// ST-Link probes don't advertise capabilities; support is derived from the firmware version
    /// returned by the `get-version` command.
    pub struct Features: u32 {
        /// Second-generation debug API (JTAG firmware version 11 and up). Required for driving
        /// the reset line.
        const API_V2 = 1 << 0;

        /// SWO trace capture (JTAG firmware version 13 and up).
        const TRACE = 1 << 1;

        /// 8-bit memory transfers of up to 512 bytes (V3 hardware).
        const RW8_512 = 1 << 2;

        /// 16-bit memory transfers (JTAG firmware version 26 and up). Required for programming
        /// the F0/F1/F3 flash, which only accepts half-word writes.
        const MEM16 = 1 << 3;
    }
}

impl Features {
    pub(crate) fn from_version(version: &Version) -> Self {
        let mut features = Features::empty();

        // V3 probes restarted the firmware numbering but support everything.
        if version.hardware() >= 3 {
            features |= Features::all();
        } else {
            if version.jtag() >= 11 {
                features |= Features::API_V2;
            }
            if version.jtag() >= 13 {
                features |= Features::TRACE;
            }
            if version.jtag() >= 26 {
                features |= Features::MEM16;
            }
        }

        log::debug!("firmware {} supports {:?}", version, features);
        features
    }
}
