//! BLE Service and Characteristic UUIDs.
//!
//! Handheld UHF readers expose their command channel either over
//! classic Serial Port Profile or over a BLE serial service; these are
//! the UUIDs involved in telling those devices apart during discovery.

use uuid::Uuid;

/// Classic Bluetooth Serial Port Profile UUID.
pub const SPP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_00805f9b34fb);
/// Nordic UART Service UUID (BLE serial emulation used by several
/// handheld reader models).
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);

/// Check if a service UUID is a serial command channel a reader could
/// be driven over.
pub fn is_serial_service(uuid: &Uuid) -> bool {
    *uuid == SPP_SERVICE_UUID || *uuid == NUS_SERVICE_UUID
}
