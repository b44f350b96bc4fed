use std::fmt;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// List of specific errors that may occur when using this library.
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A USB transport error occurred.
    ///
    /// This variant is used for all errors reported by the operating system when performing a USB
    /// operation, and for transfers that completed with fewer bytes than required. It may indicate
    /// that the probe was unplugged, that another process has claimed it, or that the current user
    /// does not have permission to access it.
    Usb,

    /// No (matching) ST-Link probe was found.
    ///
    /// This error occurs when calling [`StLink::open_by_serial`] while no probe is connected (or
    /// no probe matching the serial number is connected).
    ///
    /// [`StLink::open_by_serial`]: struct.StLink.html#method.open_by_serial
    DeviceNotFound,

    /// Automatic probe selection failed because multiple probes were found.
    ///
    /// This library will refuse to "guess" a probe and requires specifying a serial number in this
    /// case. The [`scan_usb`] function can also be used to find a specific probe to connect to.
    ///
    /// [`scan_usb`]: fn.scan_usb.html
    MultipleDevicesFound,

    /// The probe sent a reply that doesn't follow the command protocol.
    Protocol,

    /// The target chip is not known to this library, or it has not been identified yet.
    ///
    /// Flash operations need the chip parameters resolved by [`StLink::identify`].
    ///
    /// [`StLink::identify`]: struct.StLink.html#method.identify
    UnknownDevice,

    /// An operation was requested with an address, length or alignment that is not allowed.
    ///
    /// These errors are detected before anything is sent to the probe.
    InvalidArgument,

    /// The flash controller reported an error, or didn't finish an operation in time.
    ///
    /// The inner [`FlashError`] can be retrieved with [`Error::downcast_ref`].
    ///
    /// [`FlashError`]: enum.FlashError.html
    /// [`Error::downcast_ref`]: struct.Error.html#method.downcast_ref
    Flash,

    /// Reading back programmed flash returned different data.
    ///
    /// The inner [`VerifyMismatch`] names the first divergent byte.
    ///
    /// [`VerifyMismatch`]: struct.VerifyMismatch.html
    VerifyMismatch,

    /// The probe firmware is too old to support the operation.
    ///
    /// Supported features can be queried with [`StLink::features`].
    ///
    /// [`StLink::features`]: struct.StLink.html#method.features
    MissingFeature,

    /// An unspecified error occurred.
    Other,
}

pub(crate) trait Cause {
    const KIND: ErrorKind;
}

/// The error type used by this library.
///
/// Errors can be introspected by the user by calling [`Error::kind`] and inspecting the returned
/// [`ErrorKind`].
///
/// [`Error::kind`]: #method.kind
/// [`ErrorKind`]: enum.ErrorKind.html
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: BoxedError,
    while_: Option<&'static str>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, inner: impl Into<BoxedError>) -> Self {
        Self {
            kind,
            inner: inner.into(),
            while_: None,
        }
    }

    pub(crate) fn with_while(
        kind: ErrorKind,
        inner: impl Into<BoxedError>,
        while_: &'static str,
    ) -> Self {
        Self {
            kind,
            inner: inner.into(),
            while_: Some(while_),
        }
    }

    /// Returns the [`ErrorKind`] describing this error.
    ///
    /// [`ErrorKind`]: enum.ErrorKind.html
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns a reference to the underlying error if it is of type `E`.
    ///
    /// Errors of kind [`Flash`] carry a [`FlashError`], and errors of kind [`VerifyMismatch`]
    /// carry a [`VerifyMismatch`] value.
    ///
    /// [`Flash`]: enum.ErrorKind.html#variant.Flash
    /// [`VerifyMismatch`]: struct.VerifyMismatch.html
    /// [`FlashError`]: enum.FlashError.html
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Prefix foreign errors with further explanation where they're coming from
        let prefix = match self.kind {
            ErrorKind::Usb => Some("USB communication error"),
            ErrorKind::Flash => Some("flash controller error"),
            _ => None,
        };

        match (prefix, self.while_) {
            (Some(prefix), Some(while_)) => write!(f, "{} while {}: {}", prefix, while_, self.inner),
            (Some(prefix), None) => write!(f, "{}: {}", prefix, self.inner),
            (None, Some(while_)) => write!(f, "error while {}: {}", while_, self.inner),
            (None, None) => self.inner.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner)
    }
}

pub(crate) trait ResultExt<T, E> {
    fn stlink_err(self) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>;

    fn stlink_err_while(self, while_: &'static str) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn stlink_err(self) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>,
    {
        self.map_err(|e| Error::new(E::KIND, e))
    }

    fn stlink_err_while(self, while_: &'static str) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>,
    {
        self.map_err(|e| Error::with_while(E::KIND, e, while_))
    }
}

macro_rules! error_mapping {
    (
        $(
            $errty:ty => $kind:ident,
        )+
    ) => {
        $(
            impl Cause for $errty {
                const KIND: ErrorKind = ErrorKind::$kind;
            }
        )+
    };
}

error_mapping! {
    rusb::Error => Usb,
    String => Other,
    std::io::Error => Other,
    crate::flash::FlashError => Flash,
    crate::flash::VerifyMismatch => VerifyMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FlashError;

    #[test]
    fn display_includes_context() {
        let err: Result<(), _> = Err(rusb::Error::Timeout);
        let err = err.stlink_err_while("reading from probe").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usb);
        assert!(err
            .to_string()
            .starts_with("USB communication error while reading from probe: "));
    }

    #[test]
    fn flash_detail_is_reachable() {
        let err: Result<(), _> = Err(FlashError::WriteProtected { address: 0x0800_0400 });
        let err = err.stlink_err().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Flash);
        assert_eq!(
            err.downcast_ref::<FlashError>(),
            Some(&FlashError::WriteProtected { address: 0x0800_0400 })
        );
        assert!(err.to_string().contains("0x08000400"));
    }
}
