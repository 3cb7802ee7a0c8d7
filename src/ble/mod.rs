//! Bluetooth radio access.
//!
//! This module covers the radio preflight the controller runs before
//! every connection attempt: is there an adapter, is it switched on,
//! and does anything answer at the target address.

pub mod radio;
pub mod uuids;

pub use radio::{BluetoothRadio, BtleRadio};
pub use uuids::*;
