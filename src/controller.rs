//! Connection lifecycle controller.
//!
//! Owns the one reader handle, the auto-reconnect flag, and the retry
//! timer, and drives the connect/reconnect state machine around the
//! vendor port. All transitions happen on a single tokio task; retries
//! are a single owned deadline that the task can cancel, so a stale
//! retry can never fire after teardown or after an explicit
//! disconnect.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::BluetoothRadio;
use crate::config::ControllerConfig;
use crate::device::{DeviceStateEvent, RemoteDeviceDescriptor};
use crate::error::{Error, Result};
use crate::inventory::TagReport;
use crate::reader::{
    ReaderEvent, ReaderHandle, ReaderPort, RemoteSettingChange, RfidStatus, MAX_RADIO_POWER,
    MIN_RADIO_POWER,
};
use crate::utils::format_power_dbm;

/// Lifecycle state of the reader connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    /// No connection has been requested yet.
    #[default]
    Idle,
    /// The Bluetooth adapter is off; waiting for the user to enable it.
    AwaitingBluetoothEnable,
    /// A connection attempt is scheduled or in flight.
    Connecting,
    /// A reader handle is open and started.
    Connected,
    /// No handle is open and no attempt is pending.
    Disconnected,
}

impl LifecycleState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::AwaitingBluetoothEnable => write!(f, "Awaiting Bluetooth enable"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

// User-visible status lines. The open-failure line is pinned by tests:
// it is the only way to tell a powered-off reader apart from other
// connection failures.
/// Status after the vendor open call returned no handle.
pub const STATUS_READER_POWER_CHECK: &str = "reader power check";
/// Status after the module refused to start.
pub const STATUS_MODULE_CONNECT_FAILED: &str = "module connection failed";
/// Status while no reader is connected.
pub const STATUS_NOT_CONNECTED: &str = "device not connected";
/// Status once a reader is open and started.
pub const STATUS_CONNECTED: &str = "connected to reader";
/// Status while waiting for the user to enable Bluetooth.
pub const STATUS_AWAITING_BLUETOOTH: &str = "waiting for bluetooth";
/// Status when the address resolved to nothing.
pub const STATUS_NO_READER_AT_ADDRESS: &str = "no reader at this address";
/// Status when the host has no Bluetooth adapter.
pub const STATUS_BLUETOOTH_UNSUPPORTED: &str = "bluetooth not supported";
/// Status before any connection request.
pub const STATUS_IDLE: &str = "idle";

/// Event emitted by the controller.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The lifecycle state changed.
    StateChanged(LifecycleState),
    /// A transient user-facing notice (the toast analog).
    Notice(String),
    /// A tag was observed during inventory.
    Tag(TagReport),
    /// Inventory started or stopped.
    InventoryChanged {
        /// Whether an inventory round is now running.
        running: bool,
    },
    /// The RF output power changed.
    RadioPowerChanged(i32),
}

/// Commands accepted by the controller task.
#[derive(Debug)]
enum Command {
    Connect { address: Option<String> },
    Reconnect,
    Disconnect,
    SetAutoReconnect(bool),
    BluetoothEnabled(bool),
    ToggleInventory,
    SetRadioPower(i32),
    Shutdown,
}

/// Snapshot shared between the task and the client.
struct Shared {
    state: LifecycleState,
    status: String,
    auto_reconnect: bool,
    radio_power: Option<i32>,
    inventory_running: bool,
}

/// Client side of the connection lifecycle controller.
///
/// Spawns a background task that owns the reader handle and serializes
/// every transition. All methods are cheap; the actual work happens on
/// the task. Dropping the controller closes the command channel, which
/// makes the task release the handle and exit.
///
/// Must be created inside a tokio runtime.
pub struct ConnectionController {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<LifecycleEvent>,
    shared: Arc<RwLock<Shared>>,
    task_handle: RwLock<Option<JoinHandle<()>>>,
}

impl ConnectionController {
    /// Spawn a controller for the reader named in `config`.
    pub fn spawn(
        config: ControllerConfig,
        radio: Arc<dyn BluetoothRadio>,
        port: Arc<dyn ReaderPort>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(64);

        let shared = Arc::new(RwLock::new(Shared {
            state: LifecycleState::Idle,
            status: STATUS_IDLE.to_string(),
            auto_reconnect: config.auto_reconnect,
            radio_power: None,
            inventory_running: false,
        }));

        let task = ControllerTask {
            config,
            radio,
            port,
            shared: shared.clone(),
            event_tx: event_tx.clone(),
            handle: None,
            reader_events: None,
            attempt_at: None,
        };

        let task_handle = tokio::spawn(task.run(cmd_rx));

        Self {
            cmd_tx,
            event_tx,
            shared,
            task_handle: RwLock::new(Some(task_handle)),
        }
    }

    /// Request a connection to the configured address.
    pub async fn connect(&self) -> Result<()> {
        self.send(Command::Connect { address: None }).await
    }

    /// Request a connection to a different address, replacing the
    /// configured target.
    pub async fn connect_to(&self, address: impl Into<String>) -> Result<()> {
        self.send(Command::Connect {
            address: Some(address.into()),
        })
        .await
    }

    /// Drop the current link (if any) and connect again with
    /// auto-reconnect enabled.
    pub async fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect).await
    }

    /// Release the reader handle and cancel any pending retry.
    ///
    /// No automatic reconnect fires after this until a new connect
    /// request is made.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Enable or disable automatic retry after failures and lost links.
    ///
    /// Disabling while a retry is pending cancels that retry before it
    /// fires.
    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetAutoReconnect(enabled)).await
    }

    /// Report the outcome of the user's Bluetooth-enable prompt.
    pub async fn bluetooth_enabled(&self, granted: bool) -> Result<()> {
        self.send(Command::BluetoothEnabled(granted)).await
    }

    /// Start inventory if stopped, stop it if running.
    pub async fn toggle_inventory(&self) -> Result<()> {
        self.send(Command::ToggleInventory).await
    }

    /// Set the RF output power in dBm
    /// ([`MIN_RADIO_POWER`]..=[`MAX_RADIO_POWER`]).
    pub async fn set_radio_power(&self, dbm: i32) -> Result<()> {
        self.send(Command::SetRadioPower(dbm)).await
    }

    /// Release the handle, stop the task, and wait for it to finish.
    pub async fn shutdown(&self) -> Result<()> {
        // The send fails only if the task is already gone.
        let _ = self.send(Command::Shutdown).await;

        let handle = self.task_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.read().state
    }

    /// Current user-visible status line.
    pub fn status(&self) -> String {
        self.shared.read().status.clone()
    }

    /// Check if a reader is connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether auto-reconnect is currently enabled.
    pub fn auto_reconnect(&self) -> bool {
        self.shared.read().auto_reconnect
    }

    /// Last known RF output power, if a reader has reported one.
    pub fn radio_power(&self) -> Option<i32> {
        self.shared.read().radio_power
    }

    /// Whether an inventory round is running.
    pub fn inventory_running(&self) -> bool {
        self.shared.read().inventory_running
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Shutdown)
    }
}

/// What woke the controller loop up.
enum Wake {
    Command(Option<Command>),
    Reader(Option<ReaderEvent>),
    Attempt,
}

/// Task side of the controller. Sole owner of the reader handle and
/// the retry deadline.
struct ControllerTask {
    config: ControllerConfig,
    radio: Arc<dyn BluetoothRadio>,
    port: Arc<dyn ReaderPort>,
    shared: Arc<RwLock<Shared>>,
    event_tx: broadcast::Sender<LifecycleEvent>,
    /// The single open handle. Invariant: never two at once.
    handle: Option<Box<dyn ReaderHandle>>,
    /// Event stream of the open handle.
    reader_events: Option<broadcast::Receiver<ReaderEvent>>,
    /// Deadline of the (at most one) pending connection attempt.
    attempt_at: Option<tokio::time::Instant>,
}

impl ControllerTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!("Controller task started for {}", self.config.address);

        loop {
            let wake = {
                let attempt_at = self.attempt_at;
                let reader_rx = self.reader_events.as_mut();

                tokio::select! {
                    cmd = cmd_rx.recv() => Wake::Command(cmd),
                    event = recv_reader_event(reader_rx) => Wake::Reader(event),
                    _ = wait_until(attempt_at) => Wake::Attempt,
                }
            };

            match wake {
                Wake::Command(None) => {
                    debug!("Command channel closed, tearing down");
                    self.teardown().await;
                    break;
                }
                Wake::Command(Some(cmd)) => {
                    if !self.handle_command(cmd).await {
                        self.teardown().await;
                        break;
                    }
                }
                Wake::Reader(Some(event)) => self.handle_reader_event(event).await,
                Wake::Reader(None) => {
                    // Handle's event channel closed without a
                    // disconnect event; drop the dead stream.
                    self.reader_events = None;
                }
                Wake::Attempt => {
                    self.attempt_at = None;
                    self.attempt_connect().await;
                }
            }
        }

        debug!("Controller task ended");
    }

    /// Returns `false` when the task should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { address } => {
                if let Some(address) = address {
                    self.config.address = address;
                }
                self.begin_connect().await;
            }
            Command::Reconnect => {
                self.set_auto_reconnect(true);
                self.notice("reconnecting to the RFID module");
                self.begin_connect().await;
            }
            Command::Disconnect => self.disconnect().await,
            Command::SetAutoReconnect(enabled) => {
                self.set_auto_reconnect(enabled);
                if !enabled && self.attempt_at.is_some() {
                    debug!("Auto-reconnect off, cancelling pending attempt");
                    self.attempt_at = None;
                    if self.state() == LifecycleState::Connecting {
                        self.set_state(LifecycleState::Disconnected);
                    }
                }
            }
            Command::BluetoothEnabled(granted) => self.on_bluetooth_enabled(granted).await,
            Command::ToggleInventory => self.toggle_inventory().await,
            Command::SetRadioPower(dbm) => self.set_radio_power(dbm).await,
            Command::Shutdown => {
                info!("Controller shutdown requested");
                return false;
            }
        }
        true
    }

    /// Start a fresh connection cycle, superseding any pending retry
    /// and releasing any open handle first.
    async fn begin_connect(&mut self) {
        self.attempt_at = None;
        self.release_handle().await;

        if !self.radio.is_available().await {
            warn!("{}", Error::BluetoothUnsupported);
            self.set_status(STATUS_BLUETOOTH_UNSUPPORTED);
            self.set_state(LifecycleState::Disconnected);
            return;
        }

        if !self.radio.is_enabled().await {
            warn!("{}", Error::BluetoothDisabled);
            self.set_status(STATUS_AWAITING_BLUETOOTH);
            self.notice(Error::BluetoothDisabled.to_string());
            self.set_state(LifecycleState::AwaitingBluetoothEnable);
            return;
        }

        self.set_state(LifecycleState::Connecting);
        self.attempt_at = Some(tokio::time::Instant::now() + self.config.initial_delay);
    }

    async fn on_bluetooth_enabled(&mut self, granted: bool) {
        info!("Bluetooth is {}", if granted { "on" } else { "off" });

        if self.state() != LifecycleState::AwaitingBluetoothEnable {
            return;
        }

        if !granted {
            self.notice("bluetooth is still disabled");
            return;
        }

        if self.auto_reconnect() {
            self.set_state(LifecycleState::Connecting);
            self.attempt_at = Some(tokio::time::Instant::now() + self.config.initial_delay);
        } else {
            self.set_state(LifecycleState::Disconnected);
        }
    }

    /// One connection attempt: resolve, open, start.
    async fn attempt_connect(&mut self) {
        // Never hold two handles, even for a moment.
        self.release_handle().await;

        let address = self.config.address.clone();
        debug!(
            "Connection attempt for {} (open timeout {:?})",
            address, self.config.open_timeout
        );

        let device = match self.radio.resolve(&address).await {
            Ok(device) => device,
            Err(e) => {
                warn!("Device resolution failed: {}", e);
                self.set_status(STATUS_NO_READER_AT_ADDRESS);
                self.notice("no reader answered at this address");
                self.schedule_retry();
                return;
            }
        };

        if device.has_blank_name() {
            warn!(
                "{}",
                Error::DeviceNotFound {
                    address: address.clone()
                }
            );
            self.set_status(STATUS_NO_READER_AT_ADDRESS);
            self.notice("no reader answered at this address");
            self.schedule_retry();
            return;
        }

        let mut handle = match self.port.open(&device, self.config.open_timeout).await {
            Some(handle) => handle,
            None => {
                // The vendor port returns no handle when the reader
                // does not answer, typically because it is powered off.
                warn!("{}", Error::ReaderOpenFailed { address });
                self.set_status(STATUS_READER_POWER_CHECK);
                self.notice("is the reader powered on?");
                self.schedule_retry();
                return;
            }
        };

        if !handle.start().await {
            handle.destroy().await;
            warn!("{}", Error::ReaderStartFailed);
            self.set_status(STATUS_MODULE_CONNECT_FAILED);
            self.notice("RFID module failed to start");
            self.schedule_retry();
            return;
        }

        info!("Reader open success: {}", device);

        self.reader_events = Some(handle.events());
        self.finish_connect(&device, handle).await;
    }

    async fn finish_connect(
        &mut self,
        device: &RemoteDeviceDescriptor,
        mut handle: Box<dyn ReaderHandle>,
    ) {
        if handle.is_remote() {
            if let Err(e) = handle.apply_remote_settings(&self.config.remote_settings).await {
                warn!("Failed to apply remote settings: {}", e);
            }
        }

        match handle.radio_power().await {
            Ok(power) => {
                debug!("Reader radio power: {}", format_power_dbm(power));
                self.shared.write().radio_power = Some(power);
                self.emit(LifecycleEvent::RadioPowerChanged(power));
            }
            Err(e) => warn!("Failed to read radio power: {}", e),
        }

        self.handle = Some(handle);
        self.set_status(STATUS_CONNECTED);
        self.set_state(LifecycleState::Connected);
        self.notice(format!("connected to {device}"));
    }

    /// After a failed attempt: schedule exactly one retry, or give up.
    fn schedule_retry(&mut self) {
        if self.auto_reconnect() {
            debug!("Retrying in {:?}", self.config.retry_delay);
            self.attempt_at = Some(tokio::time::Instant::now() + self.config.retry_delay);
        } else {
            debug!("Auto-reconnect off, giving up");
            self.attempt_at = None;
            self.set_state(LifecycleState::Disconnected);
        }
    }

    async fn disconnect(&mut self) {
        self.attempt_at = None;
        self.release_handle().await;
        self.set_status(STATUS_NOT_CONNECTED);
        self.set_state(LifecycleState::Disconnected);
        self.notice("reader link closed");
    }

    async fn handle_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::DeviceState(DeviceStateEvent::Disconnected) => {
                self.on_unexpected_disconnect().await;
            }
            ReaderEvent::DeviceState(state) => debug!("Device state: {:?}", state),
            ReaderEvent::Inventory { status, data } => {
                if status.is_success() {
                    match TagReport::parse(&data) {
                        Some(report) => self.emit(LifecycleEvent::Tag(report)),
                        None => debug!("Unparseable inventory line: {:?}", data),
                    }
                }
            }
            ReaderEvent::RemoteSettingChanged(RemoteSettingChange::RadioPower(power)) => {
                debug!("Remote power changed to {}", format_power_dbm(power));
                self.shared.write().radio_power = Some(power);
                self.emit(LifecycleEvent::RadioPowerChanged(power));
            }
            ReaderEvent::RemoteSettingChanged(change) => {
                debug!("Remote setting changed: {:?}", change);
            }
        }
    }

    async fn on_unexpected_disconnect(&mut self) {
        warn!("{}", Error::UnexpectedDisconnect);
        self.release_handle().await;
        self.set_status(STATUS_NOT_CONNECTED);
        self.set_state(LifecycleState::Disconnected);

        if self.auto_reconnect() {
            self.notice("reconnecting to the RFID module");
            self.set_state(LifecycleState::Connecting);
            self.attempt_at = Some(tokio::time::Instant::now() + self.config.initial_delay);
        } else {
            self.notice("RFID module disconnected");
        }
    }

    async fn toggle_inventory(&mut self) {
        let running = self.shared.read().inventory_running;

        let Some(handle) = self.handle.as_mut() else {
            warn!("{}", Error::NotConnected);
            self.notice("no reader connected");
            return;
        };

        if running {
            match handle.stop_operation().await {
                RfidStatus::Success => {
                    info!("Inventory stopped");
                    self.shared.write().inventory_running = false;
                    self.emit(LifecycleEvent::InventoryChanged { running: false });
                }
                status => {
                    warn!("Failed to stop inventory: {:?}", status);
                    self.notice("failed to stop inventory");
                }
            }
        } else {
            match handle.start_inventory().await {
                RfidStatus::Success => {
                    info!("Inventory started");
                    self.shared.write().inventory_running = true;
                    self.emit(LifecycleEvent::InventoryChanged { running: true });
                }
                RfidStatus::LowBattery => {
                    warn!("Inventory refused: low battery");
                    self.notice("battery too low for inventory");
                }
                status => {
                    warn!("Failed to start inventory: {:?}", status);
                    self.notice("failed to start inventory");
                }
            }
        }
    }

    async fn set_radio_power(&mut self, dbm: i32) {
        if !(MIN_RADIO_POWER..=MAX_RADIO_POWER).contains(&dbm) {
            warn!(
                "{}",
                Error::InvalidParameter {
                    name: "radio_power".to_string(),
                    value: dbm.to_string(),
                }
            );
            return;
        }

        let Some(handle) = self.handle.as_mut() else {
            warn!("{}", Error::NotConnected);
            return;
        };

        match handle.set_radio_power(dbm).await {
            Ok(()) => {
                debug!("Radio power set to {}", format_power_dbm(dbm));
                self.shared.write().radio_power = Some(dbm);
                self.emit(LifecycleEvent::RadioPowerChanged(dbm));
            }
            Err(e) => warn!("Failed to set radio power: {}", e),
        }
    }

    /// Destroy the open handle, if any, and forget its event stream.
    async fn release_handle(&mut self) {
        self.reader_events = None;

        if let Some(mut handle) = self.handle.take() {
            debug!("Destroying reader handle");
            handle.destroy().await;
        }

        let was_running = {
            let mut shared = self.shared.write();
            std::mem::replace(&mut shared.inventory_running, false)
        };
        if was_running {
            self.emit(LifecycleEvent::InventoryChanged { running: false });
        }
    }

    async fn teardown(&mut self) {
        self.attempt_at = None;
        self.release_handle().await;
    }

    fn state(&self) -> LifecycleState {
        self.shared.read().state
    }

    fn auto_reconnect(&self) -> bool {
        self.shared.read().auto_reconnect
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        info!(
            "Auto-reconnect {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.shared.write().auto_reconnect = enabled;
    }

    fn set_state(&mut self, new_state: LifecycleState) {
        let old_state = {
            let mut shared = self.shared.write();
            std::mem::replace(&mut shared.state, new_state)
        };

        if old_state != new_state {
            debug!("Lifecycle state changed: {} -> {}", old_state, new_state);
            self.emit(LifecycleEvent::StateChanged(new_state));
        }
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.shared.write().status = status.into();
    }

    fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        let _ = self.event_tx.send(LifecycleEvent::Notice(message));
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Receive from the handle's event stream, or park forever when no
/// handle is open.
async fn recv_reader_event(
    rx: Option<&mut broadcast::Receiver<ReaderEvent>>,
) -> Option<ReaderEvent> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} reader events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

/// Sleep until the deadline, or park forever when none is set.
async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use crate::reader::RemoteSettings;

    const TEST_ADDRESS: &str = "00:05:C4:C1:00:13";

    /// Route controller logs to the test harness; honors `RUST_LOG`
    /// when chasing a failing run.
    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig::new(TEST_ADDRESS)
            .with_initial_delay(Duration::from_millis(1))
            .with_retry_delay(Duration::from_millis(20))
    }

    struct FakeRadio {
        available: bool,
        enabled: Arc<AtomicBool>,
        name: String,
    }

    impl FakeRadio {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                available: true,
                enabled: Arc::new(AtomicBool::new(true)),
                name: "ATS100".to_string(),
            })
        }

        fn with_name(name: &str) -> Arc<Self> {
            Arc::new(Self {
                available: true,
                enabled: Arc::new(AtomicBool::new(true)),
                name: name.to_string(),
            })
        }

        fn disabled() -> Arc<Self> {
            Arc::new(Self {
                available: true,
                enabled: Arc::new(AtomicBool::new(false)),
                name: "ATS100".to_string(),
            })
        }
    }

    #[async_trait]
    impl BluetoothRadio for FakeRadio {
        async fn is_available(&self) -> bool {
            self.available
        }

        async fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        async fn resolve(&self, address: &str) -> Result<RemoteDeviceDescriptor> {
            Ok(RemoteDeviceDescriptor::new(address, self.name.clone()))
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum OpenScript {
        /// Vendor open returns no handle.
        NoHandle,
        /// Handle opens but `start()` fails.
        StartFails,
        /// Handle opens and starts.
        Ok,
    }

    struct FakePort {
        script: Mutex<VecDeque<OpenScript>>,
        fallback: OpenScript,
        inventory_status: RfidStatus,
        open_count: AtomicUsize,
        open_handles: Arc<AtomicUsize>,
        max_open: Arc<AtomicUsize>,
        leaked: Arc<AtomicBool>,
        open_times: Mutex<Vec<Instant>>,
        event_tx: broadcast::Sender<ReaderEvent>,
    }

    impl FakePort {
        fn new(fallback: OpenScript) -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(32);
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                inventory_status: RfidStatus::Success,
                open_count: AtomicUsize::new(0),
                open_handles: Arc::new(AtomicUsize::new(0)),
                max_open: Arc::new(AtomicUsize::new(0)),
                leaked: Arc::new(AtomicBool::new(false)),
                open_times: Mutex::new(Vec::new()),
                event_tx,
            })
        }

        fn with_script(fallback: OpenScript, script: &[OpenScript]) -> Arc<Self> {
            let port = Self::new(fallback);
            port.script.lock().extend(script.iter().copied());
            port
        }

        fn low_battery() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(32);
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: OpenScript::Ok,
                inventory_status: RfidStatus::LowBattery,
                open_count: AtomicUsize::new(0),
                open_handles: Arc::new(AtomicUsize::new(0)),
                max_open: Arc::new(AtomicUsize::new(0)),
                leaked: Arc::new(AtomicBool::new(false)),
                open_times: Mutex::new(Vec::new()),
                event_tx,
            })
        }

        fn opens(&self) -> usize {
            self.open_count.load(Ordering::SeqCst)
        }

        fn currently_open(&self) -> usize {
            self.open_handles.load(Ordering::SeqCst)
        }

        fn max_open(&self) -> usize {
            self.max_open.load(Ordering::SeqCst)
        }

        fn leaked(&self) -> bool {
            self.leaked.load(Ordering::SeqCst)
        }

        fn send(&self, event: ReaderEvent) {
            let _ = self.event_tx.send(event);
        }
    }

    #[async_trait]
    impl ReaderPort for FakePort {
        async fn open(
            &self,
            _device: &RemoteDeviceDescriptor,
            _timeout: Duration,
        ) -> Option<Box<dyn ReaderHandle>> {
            self.open_count.fetch_add(1, Ordering::SeqCst);
            self.open_times.lock().push(Instant::now());

            let script = self.script.lock().pop_front().unwrap_or(self.fallback);
            match script {
                OpenScript::NoHandle => None,
                script => {
                    let open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_open.fetch_max(open, Ordering::SeqCst);
                    Some(Box::new(FakeHandle {
                        start_ok: matches!(script, OpenScript::Ok),
                        destroyed: false,
                        inventory_status: self.inventory_status,
                        power: 27,
                        open_handles: self.open_handles.clone(),
                        leaked: self.leaked.clone(),
                        event_tx: self.event_tx.clone(),
                    }))
                }
            }
        }
    }

    struct FakeHandle {
        start_ok: bool,
        destroyed: bool,
        inventory_status: RfidStatus,
        power: i32,
        open_handles: Arc<AtomicUsize>,
        leaked: Arc<AtomicBool>,
        event_tx: broadcast::Sender<ReaderEvent>,
    }

    #[async_trait]
    impl ReaderHandle for FakeHandle {
        async fn start(&mut self) -> bool {
            self.start_ok
        }

        async fn destroy(&mut self) {
            if !self.destroyed {
                self.destroyed = true;
                self.open_handles.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fn events(&self) -> broadcast::Receiver<ReaderEvent> {
            self.event_tx.subscribe()
        }

        async fn start_inventory(&mut self) -> RfidStatus {
            self.inventory_status
        }

        async fn stop_operation(&mut self) -> RfidStatus {
            RfidStatus::Success
        }

        async fn radio_power(&self) -> Result<i32> {
            Ok(self.power)
        }

        async fn set_radio_power(&mut self, dbm: i32) -> Result<()> {
            self.power = dbm;
            Ok(())
        }

        async fn apply_remote_settings(&mut self, _settings: &RemoteSettings) -> Result<()> {
            Ok(())
        }

        fn is_remote(&self) -> bool {
            true
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            if !self.destroyed {
                self.leaked.store(true, Ordering::SeqCst);
                self.open_handles.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    async fn wait_for_state(controller: &ConnectionController, state: LifecycleState) {
        wait_for(|| controller.state() == state).await;
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if condition() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_successful_connect() {
        trace_init();
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        assert!(controller.is_connected());
        assert_eq!(controller.status(), STATUS_CONNECTED);
        assert_eq!(controller.radio_power(), Some(27));
        assert_eq!(port.max_open(), 1);

        controller.shutdown().await.unwrap();
        assert_eq!(port.currently_open(), 0);
        assert!(!port.leaked());
    }

    #[tokio::test]
    async fn test_open_failure_sets_power_check_status_and_retries() {
        trace_init();
        let port = FakePort::new(OpenScript::NoHandle);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for(|| port.opens() >= 1).await;

        assert_eq!(controller.status(), STATUS_READER_POWER_CHECK);
        assert_eq!(controller.state(), LifecycleState::Connecting);
        assert_eq!(port.currently_open(), 0);

        // The retry fires after the configured delay, not before.
        wait_for(|| port.opens() >= 2).await;
        let times = port.open_times.lock().clone();
        assert!(times[1] - times[0] >= Duration::from_millis(20));

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_retry_when_auto_reconnect_false() {
        let port = FakePort::new(OpenScript::NoHandle);
        let config = test_config().with_auto_reconnect(false);
        let controller = ConnectionController::spawn(config, FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(port.opens(), 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabling_auto_reconnect_suppresses_pending_retry() {
        let port = FakePort::new(OpenScript::NoHandle);
        let config = test_config().with_retry_delay(Duration::from_millis(200));
        let controller = ConnectionController::spawn(config, FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for(|| port.opens() == 1).await;

        // Toggle before the 200 ms retry fires.
        controller.set_auto_reconnect(false).await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(port.opens(), 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_disconnect_releases_handle() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        controller.disconnect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        assert_eq!(controller.status(), STATUS_NOT_CONNECTED);
        assert_eq!(port.currently_open(), 0);
        assert!(!port.leaked());

        // Auto-reconnect is still on, but an explicit disconnect must
        // not be followed by any automatic attempt.
        assert!(controller.auto_reconnect());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(port.opens(), 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_disconnect_cancels_pending_retry() {
        let port = FakePort::new(OpenScript::NoHandle);
        let config = test_config().with_retry_delay(Duration::from_millis(200));
        let controller = ConnectionController::spawn(config, FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for(|| port.opens() == 1).await;

        controller.disconnect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(port.opens(), 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_triggers_reconnect() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        port.send(ReaderEvent::DeviceState(DeviceStateEvent::Disconnected));

        // Old handle is destroyed, a new one is opened automatically.
        wait_for(|| port.opens() == 2).await;
        wait_for_state(&controller, LifecycleState::Connected).await;

        assert_eq!(port.max_open(), 1);
        assert!(!port.leaked());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_without_auto_reconnect() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        controller.set_auto_reconnect(false).await.unwrap();
        port.send(ReaderEvent::DeviceState(DeviceStateEvent::Disconnected));
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(port.opens(), 1);
        assert_eq!(port.currently_open(), 0);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_destroys_partial_handle_and_retries() {
        let port = FakePort::with_script(OpenScript::Ok, &[OpenScript::StartFails]);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        assert_eq!(port.opens(), 2);
        assert_eq!(port.max_open(), 1);
        assert!(!port.leaked());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_awaiting_bluetooth_enable_resumes_with_auto_reconnect() {
        let radio = FakeRadio::disabled();
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), radio.clone(), port.clone());

        let mut events = controller.subscribe();

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::AwaitingBluetoothEnable).await;
        assert_eq!(controller.status(), STATUS_AWAITING_BLUETOOTH);
        assert_eq!(port.opens(), 0);

        let notice = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(LifecycleEvent::Notice(message)) = events.recv().await {
                    return message;
                }
            }
        })
        .await
        .expect("no notice event");
        assert_eq!(notice, Error::BluetoothDisabled.to_string());

        radio.enabled.store(true, Ordering::SeqCst);
        controller.bluetooth_enabled(true).await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bluetooth_enable_without_auto_reconnect_stays_disconnected() {
        let radio = FakeRadio::disabled();
        let port = FakePort::new(OpenScript::Ok);
        let config = test_config().with_auto_reconnect(false);
        let controller = ConnectionController::spawn(config, radio.clone(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::AwaitingBluetoothEnable).await;

        radio.enabled.store(true, Ordering::SeqCst);
        controller.bluetooth_enabled(true).await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(port.opens(), 0);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_name_counts_as_device_not_found() {
        let radio = FakeRadio::with_name("  ");
        let port = FakePort::new(OpenScript::Ok);
        let config = test_config().with_auto_reconnect(false);
        let controller = ConnectionController::spawn(config, radio, port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        assert_eq!(controller.status(), STATUS_NO_READER_AT_ADDRESS);
        assert_eq!(port.opens(), 0);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_connect_supersedes_pending_retry() {
        let port = FakePort::with_script(OpenScript::Ok, &[OpenScript::NoHandle]);
        let config = test_config().with_retry_delay(Duration::from_millis(500));
        let controller = ConnectionController::spawn(config, FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for(|| port.opens() == 1).await;

        // Second explicit request must not wait out the 500 ms retry.
        let issued = Instant::now();
        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;
        assert!(issued.elapsed() < Duration::from_millis(400));
        assert_eq!(port.max_open(), 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_toggle_inventory_and_tag_events() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        let mut events = controller.subscribe();

        controller.toggle_inventory().await.unwrap();
        wait_for(|| controller.inventory_running()).await;

        port.send(ReaderEvent::Inventory {
            status: RfidStatus::Success,
            data: "E2000017221101441890A1B2 -54".to_string(),
        });

        let tag = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(LifecycleEvent::Tag(tag)) = events.recv().await {
                    return tag;
                }
            }
        })
        .await
        .expect("no tag event");
        assert_eq!(tag.epc_hex(), "E2000017221101441890A1B2");
        assert_eq!(tag.rssi, Some(-54));

        controller.toggle_inventory().await.unwrap();
        wait_for(|| !controller.inventory_running()).await;

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inventory_refused_on_low_battery() {
        let port = FakePort::low_battery();
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        controller.toggle_inventory().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!controller.inventory_running());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_radio_power_validates_bounds() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;
        assert_eq!(controller.radio_power(), Some(27));

        controller.set_radio_power(MAX_RADIO_POWER + 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.radio_power(), Some(27));

        controller.set_radio_power(20).await.unwrap();
        wait_for(|| controller.radio_power() == Some(20)).await;

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_power_echo_updates_snapshot() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Connected).await;

        port.send(ReaderEvent::RemoteSettingChanged(
            RemoteSettingChange::RadioPower(13),
        ));
        wait_for(|| controller.radio_power() == Some(13)).await;

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_host_goes_disconnected() {
        let mut radio = crate::ble::radio::MockBluetoothRadio::new();
        radio.expect_is_available().returning(|| false);

        let port = FakePort::new(OpenScript::Ok);
        let controller =
            ConnectionController::spawn(test_config(), Arc::new(radio), port.clone());

        controller.connect().await.unwrap();
        wait_for_state(&controller, LifecycleState::Disconnected).await;

        assert_eq!(controller.status(), STATUS_BLUETOOTH_UNSUPPORTED);
        assert_eq!(port.opens(), 0);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let port = FakePort::new(OpenScript::Ok);
        let controller = ConnectionController::spawn(test_config(), FakeRadio::new(), port);

        controller.shutdown().await.unwrap();
        assert!(matches!(
            controller.connect().await,
            Err(Error::Shutdown)
        ));
    }

    #[derive(Debug, Clone, Copy)]
    enum TestCmd {
        Connect,
        Reconnect,
        Disconnect,
        SetAuto(bool),
        ToggleInventory,
        DropLink,
    }

    fn command_strategy() -> impl Strategy<Value = TestCmd> {
        prop_oneof![
            Just(TestCmd::Connect),
            Just(TestCmd::Reconnect),
            Just(TestCmd::Disconnect),
            any::<bool>().prop_map(TestCmd::SetAuto),
            Just(TestCmd::ToggleInventory),
            Just(TestCmd::DropLink),
        ]
    }

    fn outcome_strategy() -> impl Strategy<Value = OpenScript> {
        prop_oneof![
            Just(OpenScript::NoHandle),
            Just(OpenScript::StartFails),
            Just(OpenScript::Ok),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// For every command sequence and open outcome, at most one
        /// handle is ever open and none is leaked.
        #[test]
        fn prop_single_handle_invariant(
            cmds in proptest::collection::vec(command_strategy(), 1..12),
            outcomes in proptest::collection::vec(outcome_strategy(), 0..12),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            let (max_open, leaked) = rt.block_on(async move {
                let port = FakePort::with_script(OpenScript::Ok, &outcomes);
                let config = ControllerConfig::new(TEST_ADDRESS)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_retry_delay(Duration::from_millis(2));
                let controller =
                    ConnectionController::spawn(config, FakeRadio::new(), port.clone());

                for cmd in cmds {
                    match cmd {
                        TestCmd::Connect => controller.connect().await.unwrap(),
                        TestCmd::Reconnect => controller.reconnect().await.unwrap(),
                        TestCmd::Disconnect => controller.disconnect().await.unwrap(),
                        TestCmd::SetAuto(enabled) => {
                            controller.set_auto_reconnect(enabled).await.unwrap()
                        }
                        TestCmd::ToggleInventory => {
                            controller.toggle_inventory().await.unwrap()
                        }
                        TestCmd::DropLink => {
                            port.send(ReaderEvent::DeviceState(DeviceStateEvent::Disconnected))
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(3)).await;
                }

                tokio::time::sleep(Duration::from_millis(10)).await;
                controller.shutdown().await.unwrap();

                (port.max_open(), port.leaked())
            });

            prop_assert!(max_open <= 1, "saw {} handles open at once", max_open);
            prop_assert!(!leaked, "a handle was dropped without destroy");
        }
    }

    #[test]
    fn test_lifecycle_state_display() {
        assert_eq!(LifecycleState::Connected.to_string(), "Connected");
        assert_eq!(LifecycleState::Idle.to_string(), "Idle");
        assert!(LifecycleState::Connected.is_connected());
        assert!(!LifecycleState::Connecting.is_connected());
    }
}
