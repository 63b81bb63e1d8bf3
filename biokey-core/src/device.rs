//! Device handles and device selection.

use std::fmt;

use serde::Serialize;

/// Physical link a security key is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTransport {
    Usb,
    Nfc,
}

impl fmt::Display for DeviceTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Nfc => write!(f, "NFC"),
        }
    }
}

/// Firmware version reported by the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identifies one physical security key found during discovery.
///
/// The `path` is the transport-level address (HID path, reader name) and is
/// what two handles are compared by; the serial number is optional because
/// some keys do not expose it over every interface.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHandle {
    pub path: String,
    pub name: String,
    pub serial: Option<u32>,
    pub transports: Vec<DeviceTransport>,
    pub firmware: FirmwareVersion,
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for DeviceHandle {}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.serial {
            Some(serial) => write!(f, "{} (serial {serial})", self.name),
            None => write!(f, "{} ({})", self.name, self.path),
        }
    }
}

/// How [`DeviceSessionManager::connect`](crate::DeviceSessionManager::connect)
/// picks a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// A handle obtained from an earlier discovery.
    Handle(DeviceHandle),
    /// The connected key with this serial number.
    Serial(u32),
    /// The only connected key.
    ///
    /// Several keys fail with [`ConnectionError::Ambiguous`]; no key at all
    /// fails with [`ConnectionError::NoDevice`], not `Ambiguous`, so match on
    /// both when handling an unusable selection.
    ///
    /// [`ConnectionError::Ambiguous`]: crate::ConnectionError::Ambiguous
    /// [`ConnectionError::NoDevice`]: crate::ConnectionError::NoDevice
    #[default]
    Auto,
}

impl DeviceSelector {
    /// `Serial` when a serial number is given, `Auto` otherwise.
    pub fn from_serial(serial: Option<u32>) -> Self {
        serial.map_or(Self::Auto, Self::Serial)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "device {handle}"),
            Self::Serial(serial) => write!(f, "serial {serial}"),
            Self::Auto => write!(f, "auto"),
        }
    }
}
