//! Bluetooth adapter preflight and device resolution.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
#[cfg(test)]
use mockall::automock;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::ble::uuids::is_serial_service;
use crate::device::RemoteDeviceDescriptor;
use crate::error::{Error, Result};
use crate::utils::normalize_mac;

/// Radio preflight consumed by the connection controller.
///
/// Everything the controller needs to know about the local Bluetooth
/// stack before handing off to the vendor port: adapter presence,
/// power state, and address-to-device resolution.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BluetoothRadio: Send + Sync {
    /// Whether the host has a usable Bluetooth adapter.
    async fn is_available(&self) -> bool;

    /// Whether the adapter is switched on.
    async fn is_enabled(&self) -> bool;

    /// Resolve a MAC address to a device descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if nothing answers at the
    /// address within the resolution window, or a Bluetooth error if
    /// the stack refuses the scan.
    async fn resolve(&self, address: &str) -> Result<RemoteDeviceDescriptor>;
}

/// How long [`BtleRadio::resolve`] scans before giving up.
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`BluetoothRadio`] backed by `btleplug`.
pub struct BtleRadio {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Scan window for address resolution.
    resolve_timeout: Duration,
}

impl BtleRadio {
    /// Create a radio on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnsupported`] if no adapter exists,
    /// or [`Error::PermissionDenied`] if the OS refuses access.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(map_btle_error)?;

        let adapters = manager.adapters().await.map_err(map_btle_error)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnsupported)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self {
            adapter,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        })
    }

    /// Create a radio on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    /// Set the scan window used by [`BluetoothRadio::resolve`].
    pub fn set_resolve_timeout(&mut self, timeout: Duration) {
        self.resolve_timeout = timeout;
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Look for an already-discovered peripheral with the target address.
    async fn find_peripheral(&self, target: &str) -> Result<Option<Peripheral>> {
        let peripherals = self.adapter.peripherals().await.map_err(map_btle_error)?;

        for peripheral in peripherals {
            let addr = peripheral.address().to_string();
            if normalize_mac(&addr).as_deref() == Some(target) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Build a descriptor from a matched peripheral.
    async fn describe(&self, target: &str, peripheral: &Peripheral) -> RemoteDeviceDescriptor {
        let properties = peripheral.properties().await.ok().flatten();

        if let Some(props) = &properties {
            // Readers reachable over BLE advertise a serial command
            // channel; classic SPP models advertise nothing useful
            // here, so this only informs, never rejects.
            let serial = props.services.iter().any(is_serial_service);
            debug!(
                "{} advertises {} service(s), serial channel: {}",
                target,
                props.services.len(),
                serial
            );
        }

        let name = properties.and_then(|p| p.local_name).unwrap_or_default();
        RemoteDeviceDescriptor::new(target, name)
    }
}

#[async_trait]
impl BluetoothRadio for BtleRadio {
    async fn is_available(&self) -> bool {
        self.adapter.adapter_info().await.is_ok()
    }

    async fn is_enabled(&self) -> bool {
        // BlueZ (and the other backends) answer peripheral queries
        // only while the adapter is powered.
        self.adapter.peripherals().await.is_ok()
    }

    async fn resolve(&self, address: &str) -> Result<RemoteDeviceDescriptor> {
        let target = normalize_mac(address).ok_or_else(|| Error::InvalidParameter {
            name: "address".to_string(),
            value: address.to_string(),
        })?;

        debug!("Resolving reader at {}", target);

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_btle_error)?;

        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                let _ = self.adapter.stop_scan().await;
                return Err(map_btle_error(e));
            }
        };

        let deadline = tokio::time::Instant::now() + self.resolve_timeout;

        let found = loop {
            match self.find_peripheral(&target).await {
                Ok(Some(peripheral)) => break Some(peripheral),
                Ok(None) => {}
                Err(e) => {
                    let _ = self.adapter.stop_scan().await;
                    return Err(e);
                }
            }

            tokio::select! {
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        trace!("Discovery event for {:?}", id);
                    }
                    Some(_) => {}
                    None => break None,
                },
                _ = tokio::time::sleep_until(deadline) => break None,
            }
        };

        let _ = self.adapter.stop_scan().await;

        match found {
            Some(peripheral) => {
                let descriptor = self.describe(&target, &peripheral).await;
                info!("Resolved reader: {}", descriptor);
                Ok(descriptor)
            }
            None => Err(Error::DeviceNotFound { address: target }),
        }
    }
}

/// Map a btleplug error onto this crate's error kinds.
fn map_btle_error(error: btleplug::Error) -> Error {
    match error {
        btleplug::Error::PermissionDenied => Error::PermissionDenied,
        other => Error::Bluetooth(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_permission_denied() {
        assert!(matches!(
            map_btle_error(btleplug::Error::PermissionDenied),
            Error::PermissionDenied
        ));
    }

    #[test]
    fn test_map_other_errors_pass_through() {
        assert!(matches!(
            map_btle_error(btleplug::Error::NotConnected),
            Error::Bluetooth(btleplug::Error::NotConnected)
        ));
    }
}
