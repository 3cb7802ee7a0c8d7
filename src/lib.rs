// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # rfid-reader-ble
//!
//! A cross-platform Rust library for managing the Bluetooth connection
//! lifecycle of handheld UHF RFID readers.
//!
//! The vendor reader driver (framing, command/response handling, tag
//! anti-collision) stays behind the [`ReaderPort`]/[`ReaderHandle`]
//! trait seams; this crate owns everything around it: radio preflight,
//! address resolution, the connect/retry/reconnect state machine, the
//! auto-reconnect flag, and inventory/power control on an open reader.
//!
//! ## Features
//!
//! - **Connection lifecycle**: one controller type drives connect,
//!   retry on a fixed timer, and automatic reconnect after lost links
//! - **Single-handle guarantee**: at most one reader handle is ever
//!   open, across any sequence of requests
//! - **Auto-reconnect toggle**: observed before every retry fires
//! - **Inventory**: toggle tag inventory and receive parsed tag reports
//! - **Radio power**: read and set RF output power with bounds checking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rfid_reader_ble::{
//!     BtleRadio, ConnectionController, ControllerConfig, LifecycleEvent, Result,
//! };
//! # use rfid_reader_ble::ReaderPort;
//! # async fn vendor_port() -> Arc<dyn ReaderPort> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let radio = Arc::new(BtleRadio::new().await?);
//!     let port = vendor_port().await;
//!
//!     let config = ControllerConfig::new("00:05:C4:C1:00:13");
//!     let controller = ConnectionController::spawn(config, radio, port);
//!
//!     let mut events = controller.subscribe();
//!     controller.connect().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             LifecycleEvent::StateChanged(state) => println!("state: {state}"),
//!             LifecycleEvent::Tag(tag) => println!("tag: {tag}"),
//!             _ => {}
//!         }
//!     }
//!
//!     controller.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for config and
//!   device types

// Public modules
pub mod ble;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod inventory;
pub mod reader;
pub mod utils;

// Re-exports for convenience
pub use ble::{BluetoothRadio, BtleRadio};
pub use config::{
    ControllerConfig, DEFAULT_INITIAL_DELAY, DEFAULT_OPEN_TIMEOUT, DEFAULT_RETRY_DELAY,
};
pub use controller::{ConnectionController, LifecycleEvent, LifecycleState};
pub use device::{DeviceStateEvent, RemoteDeviceDescriptor};
pub use error::{Error, Result};
pub use inventory::TagReport;
pub use reader::{
    ReaderEvent, ReaderHandle, ReaderPort, RemoteSettingChange, RemoteSettings, RfidStatus,
    TriggerModule, MAX_RADIO_POWER, MIN_RADIO_POWER,
};
pub use utils::{format_power_dbm, is_valid_mac, normalize_mac};
