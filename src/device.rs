//! Remote device identity and device-state events.

use crate::utils::normalize_mac;

/// Identifies a target reader by Bluetooth address and advertised name.
///
/// Immutable once resolved; supplied by the Bluetooth collaborator
/// (see [`crate::ble::BluetoothRadio`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RemoteDeviceDescriptor {
    /// Bluetooth MAC address, upper-case colon-separated.
    pub address: String,
    /// Advertised device name. May be blank if the device never
    /// answered a name request.
    pub name: String,
}

impl RemoteDeviceDescriptor {
    /// Create a descriptor, normalizing the address when possible.
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            address: normalize_mac(&address).unwrap_or(address),
            name: name.into(),
        }
    }

    /// Whether the resolved name is missing or blank.
    ///
    /// The vendor SDK resolves any well-formed address to a device
    /// object; a blank name is the only signal that nothing actually
    /// answered at that address.
    pub fn has_blank_name(&self) -> bool {
        self.name.trim().is_empty()
    }
}

impl std::fmt::Display for RemoteDeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_blank_name() {
            write!(f, "<unnamed> ({})", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

/// Device-state change delivered asynchronously by the reader handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStateEvent {
    /// The reader dropped the link.
    Disconnected,
    /// The reader started charging over USB.
    UsbChargingEnabled,
    /// The reader stopped charging over USB.
    UsbChargingDisabled,
}
