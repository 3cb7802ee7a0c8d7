//! Collaborator contract for the vendor reader SDK.
//!
//! The actual reader driver (link framing, command/response state
//! machine, tag anti-collision) lives behind these traits. The crate
//! only ever drives a reader through [`ReaderPort`] and
//! [`ReaderHandle`], which mirror the vendor surface: an open call
//! that may yield no handle, a boolean start call, an explicit
//! destroy, and an asynchronous event stream.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::device::{DeviceStateEvent, RemoteDeviceDescriptor};
use crate::error::Result;

/// Lowest radio power the RF module accepts, in dBm.
pub const MIN_RADIO_POWER: i32 = 0;

/// Highest radio power the RF module accepts, in dBm.
pub const MAX_RADIO_POWER: i32 = 30;

/// Outcome of a reader operation, as reported by the vendor module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfidStatus {
    /// The operation was accepted.
    Success,
    /// The operation was refused because the battery is too low.
    LowBattery,
    /// The operation failed with a vendor status code.
    Failure(i32),
}

impl RfidStatus {
    /// Check if the operation was accepted.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Which hardware module the trigger key drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerModule {
    /// Trigger starts/stops RFID inventory.
    #[default]
    Rfid,
    /// Trigger drives the barcode engine.
    Barcode,
}

/// Settings pushed to the remote device after a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RemoteSettings {
    /// Module activated by the hardware trigger key.
    pub trigger_module: TriggerModule,
    /// Play the boot chime.
    pub boot_sound: bool,
    /// Vibrate on key events.
    pub vibrator: bool,
    /// Beep on key events.
    pub key_sound: bool,
    /// Speaker volume, 0..=15.
    pub sound_volume: u8,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        // Quiet handheld: trigger bound to RFID, all feedback muted.
        Self {
            trigger_module: TriggerModule::Rfid,
            boot_sound: false,
            vibrator: false,
            key_sound: false,
            sound_volume: 1,
        }
    }
}

/// A remote setting echoed back by the reader after it changed,
/// either locally or from another controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSettingChange {
    /// The RF output power changed, in dBm.
    RadioPower(i32),
    /// The speaker volume changed.
    SoundVolume(u8),
}

/// Event delivered asynchronously by an open reader handle.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    /// The device link changed state.
    DeviceState(DeviceStateEvent),
    /// An inventory round reported data (one tag line per event).
    Inventory {
        /// Vendor status for the round.
        status: RfidStatus,
        /// Raw tag line as reported by the module.
        data: String,
    },
    /// A remote setting was changed on the device side.
    RemoteSettingChanged(RemoteSettingChange),
}

/// Factory seam over the vendor SDK's reader-open call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReaderPort: Send + Sync {
    /// Open a reader for the given device.
    ///
    /// Mirrors the vendor call exactly: `None` means the reader did
    /// not answer within `timeout` (typically powered off), not an
    /// error the caller can act on beyond retrying.
    async fn open(
        &self,
        device: &RemoteDeviceDescriptor,
        timeout: Duration,
    ) -> Option<Box<dyn ReaderHandle>>;
}

/// An open connection to a reader.
///
/// At most one handle may be open per controller at any instant; the
/// controller destroys any existing handle before opening a new one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReaderHandle: Send + Sync {
    /// Start the RFID module. Returns `false` if the module did not
    /// come up, in which case the handle must be destroyed.
    async fn start(&mut self) -> bool;

    /// Close the connection and release all vendor resources.
    async fn destroy(&mut self);

    /// Subscribe to events from this handle.
    fn events(&self) -> broadcast::Receiver<ReaderEvent>;

    /// Begin a tag inventory round.
    async fn start_inventory(&mut self) -> RfidStatus;

    /// Stop whatever operation is running.
    async fn stop_operation(&mut self) -> RfidStatus;

    /// Read the current RF output power in dBm.
    async fn radio_power(&self) -> Result<i32>;

    /// Set the RF output power in dBm. The caller validates bounds.
    async fn set_radio_power(&mut self, dbm: i32) -> Result<()>;

    /// Push trigger/sound/vibrator settings to the remote device.
    async fn apply_remote_settings(&mut self, settings: &RemoteSettings) -> Result<()>;

    /// Whether this handle talks to a remote (Bluetooth) device
    /// rather than a locally attached module.
    fn is_remote(&self) -> bool;
}
