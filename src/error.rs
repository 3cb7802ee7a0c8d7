//! Error types for the rfid-reader-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The host has no Bluetooth adapter at all.
    #[error("Bluetooth not supported on this host")]
    BluetoothUnsupported,

    /// Bluetooth access was denied by the OS.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The Bluetooth adapter is present but switched off.
    #[error("Bluetooth adapter is disabled")]
    BluetoothDisabled,

    /// No reader answered at the given address, or the resolved
    /// device carries a blank name.
    #[error("No reader found at {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// The vendor port returned no handle for the device.
    #[error("Reader open failed for {address}")]
    ReaderOpenFailed {
        /// The address of the device that failed to open.
        address: String,
    },

    /// The reader handle was obtained but refused to start.
    #[error("Reader module failed to start")]
    ReaderStartFailed,

    /// The reader dropped the link without an explicit disconnect.
    #[error("Reader disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// Operation requires a connection but no reader is connected.
    #[error("Reader not connected")]
    NotConnected,

    /// The controller task has already shut down.
    #[error("Controller is shut down")]
    Shutdown,

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
