//! Control-plane event loop
//!
//! Everything that touches the [`RootModel`] runs on one task: connection
//! events from the transport, poll batches from the `shm-poller` thread,
//! worker callbacks and the periodic timers. After every event the loop
//! collects model changes and hands them to each connection's handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::audio::device::Device;
use crate::config::{SessionSettings, SettingsStore, TimingConfig, WebSocketSettings};
use crate::error::WorkerError;
use crate::protocol::{ClientHandler, ConnectionInfo, Deferred, Outbound, RpcError};
use crate::session::{PollBatch, RootModel, SessionId, SessionRegistry};

/// Process-local connection id
pub type ConnectionId = u64;

/// Input to the control-plane loop
pub enum LoopEvent {
    Connected {
        id: ConnectionId,
        info: ConnectionInfo,
        outbound: Outbound,
    },
    /// A decoded frame, or the parse error it produced
    Inbound {
        id: ConnectionId,
        frame: Result<Value, RpcError>,
    },
    Closed {
        id: ConnectionId,
    },
    /// A supervisor is about to launch this session's worker
    WorkerStarting(SessionId),
    DevicesRefreshed(Result<Vec<Device>, WorkerError>),
    /// Device list fetched for an `EnumerateDevices` request
    DevicesEnumerated {
        connection: ConnectionId,
        request: Value,
        result: Result<Vec<Device>, WorkerError>,
    },
    SecurityChanged(WebSocketSettings),
    Shutdown,
}

/// Cloneable sender into the loop
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
    next_connection: Arc<AtomicU64>,
}

impl LoopHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            next_connection: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }

    /// Queue an event; false once the loop has stopped
    pub fn send(&self, event: LoopEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Recreate persisted sessions in order, returning how many were added
pub fn restore_sessions(registry: &mut SessionRegistry, sessions: Vec<SessionSettings>) -> usize {
    let mut restored = 0;
    for settings in sessions {
        let persistent_id = settings.id;
        let session = match registry.create_session(settings) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(%persistent_id, "Failed to create session: {}", e);
                continue;
            }
        };
        match registry.add(session) {
            Ok(id) => {
                tracing::debug!(session = id, %persistent_id, "Session restored");
                restored += 1;
            }
            Err(e) => tracing::error!(%persistent_id, "Failed to restore session: {}", e),
        }
    }
    restored
}

fn ticker(period_ms: u64) -> Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Owner of the root model and every connection's handler
pub struct ControlPlane {
    root: RootModel,
    handlers: HashMap<ConnectionId, ClientHandler>,
    handle: LoopHandle,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    poll_tx: mpsc::UnboundedSender<PollBatch>,
    polls: mpsc::UnboundedReceiver<PollBatch>,
    store: Option<SettingsStore>,
    timing: TimingConfig,
    refreshing: bool,
}

impl ControlPlane {
    pub fn new(
        root: RootModel,
        handle: LoopHandle,
        events: mpsc::UnboundedReceiver<LoopEvent>,
        timing: TimingConfig,
        store: Option<SettingsStore>,
    ) -> Self {
        let (poll_tx, polls) = mpsc::unbounded_channel();
        Self {
            root,
            handlers: HashMap::new(),
            handle,
            events,
            poll_tx,
            polls,
            store,
            timing,
            refreshing: false,
        }
    }

    pub fn root(&self) -> &RootModel {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut RootModel {
        &mut self.root
    }

    /// Where the poll thread delivers its batches
    pub fn poll_sender(&self) -> mpsc::UnboundedSender<PollBatch> {
        self.poll_tx.clone()
    }

    pub fn connections(&self) -> usize {
        self.handlers.len()
    }

    /// Apply one event and publish the resulting changes
    ///
    /// Returns false when the loop should stop.
    pub fn handle_event(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::Connected { id, info, outbound } => {
                tracing::info!(connection = id, local = info.is_local, "Client connected");
                let handler = ClientHandler::new(info, outbound, &mut self.root);
                self.handlers.insert(id, handler);
            }
            LoopEvent::Inbound { id, frame } => {
                let Some(handler) = self.handlers.get_mut(&id) else {
                    return true;
                };
                if let Some(Deferred::EnumerateDevices { id: request }) =
                    handler.handle_message(&mut self.root, frame)
                {
                    self.enumerate_devices(id, request);
                }
            }
            LoopEvent::Closed { id } => {
                if let Some(handler) = self.handlers.remove(&id) {
                    handler.close(&mut self.root);
                    tracing::info!(connection = id, "Client disconnected");
                }
            }
            LoopEvent::WorkerStarting(session) => {
                self.root.registry_mut().on_worker_starting(session);
            }
            LoopEvent::DevicesRefreshed(result) => {
                self.refreshing = false;
                match result {
                    Ok(devices) => self.root.registry_mut().set_devices(devices),
                    Err(e) => tracing::warn!("Device refresh failed: {}", e),
                }
            }
            LoopEvent::DevicesEnumerated {
                connection,
                request,
                result,
            } => {
                let response = match result {
                    Ok(devices) => {
                        let encoded = serde_json::to_value(&devices).map_err(|e| {
                            tracing::error!("Failed to encode device list: {}", e);
                            RpcError::internal_error()
                        });
                        self.root.registry_mut().set_devices(devices);
                        encoded
                    }
                    Err(e) => {
                        tracing::error!("Device enumeration failed: {}", e);
                        Err(RpcError::internal_error())
                    }
                };
                if let Some(handler) = self.handlers.get(&connection) {
                    handler.complete(request, response);
                }
            }
            LoopEvent::SecurityChanged(websocket) => {
                let change = self.root.set_websocket(websocket);
                if !change.is_empty() {
                    tracing::info!(
                        secret_changed = change.secret_changed,
                        permissions_changed = change.permissions_changed,
                        "Security settings changed"
                    );
                    for handler in self.handlers.values_mut() {
                        handler.on_security_changed(&mut self.root, change);
                    }
                }
            }
            LoopEvent::Shutdown => return false,
        }
        self.publish_changes();
        true
    }

    /// Feed one poll pass into the sessions and tap subscribers
    pub fn apply_poll(&mut self, batch: PollBatch) {
        for (id, snapshot) in &batch.samples {
            if let Some(session) = self.root.session_mut(*id) {
                session.apply_snapshot(snapshot);
            }
        }
        for (id, data) in &batch.taps {
            for handler in self.handlers.values() {
                handler.on_tap_data(*id, data);
            }
        }
        self.publish_changes();
    }

    pub fn publish_changes(&mut self) {
        let changes = self.root.collect_changes();
        if !changes.is_empty() {
            for handler in self.handlers.values_mut() {
                handler.on_changes(&mut self.root, &changes);
            }
        }
        self.drop_closed();
    }

    /// Dispose handlers whose writer stopped, e.g. after a failed send
    fn drop_closed(&mut self) {
        let closed: Vec<ConnectionId> = self
            .handlers
            .iter()
            .filter(|(_, handler)| handler.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            if let Some(handler) = self.handlers.remove(&id) {
                handler.close(&mut self.root);
                tracing::info!(connection = id, "Client writer gone, connection dropped");
            }
        }
    }

    pub fn update_cursors(&mut self) {
        for session in self.root.registry_mut().sessions_mut() {
            session.update_cursor();
        }
        self.publish_changes();
    }

    /// Persist the settings document if anything changed since the last save
    pub fn save_if_dirty(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        if !self.root.registry_mut().take_dirty() {
            return;
        }
        match store.save(&self.root.to_settings()) {
            Ok(()) => tracing::debug!(path = %store.path().display(), "Settings saved"),
            Err(e) => {
                tracing::error!("Failed to save settings: {}", e);
                self.root.registry_mut().mark_dirty();
            }
        }
    }

    fn refresh_devices(&mut self) {
        if self.refreshing {
            return;
        }
        self.refreshing = true;
        let devices = self.root.registry().driver().list_devices();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            handle.send(LoopEvent::DevicesRefreshed(devices.await));
        });
    }

    fn enumerate_devices(&self, connection: ConnectionId, request: Value) {
        let devices = self.root.registry().driver().list_devices();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            handle.send(LoopEvent::DevicesEnumerated {
                connection,
                request,
                result: devices.await,
            });
        });
    }

    /// Run until [`LoopEvent::Shutdown`] or until every [`LoopHandle`] is gone
    pub async fn run(mut self) {
        let mut cursor = ticker(self.timing.cursor_interval_ms);
        let mut save = ticker(self.timing.save_interval_ms);
        let mut refresh = (self.timing.device_refresh_interval_ms > 0)
            .then(|| ticker(self.timing.device_refresh_interval_ms));

        tracing::info!(sessions = self.root.registry().len(), "Control plane running");
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if !self.handle_event(event) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(batch) = self.polls.recv() => self.apply_poll(batch),
                _ = cursor.tick() => self.update_cursors(),
                _ = save.tick() => self.save_if_dirty(),
                _ = tick_optional(&mut refresh) => self.refresh_devices(),
            }
        }

        self.shutdown().await;
    }

    /// Drop connections, save, and wait for every worker to stop
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down control plane");
        for (_, handler) in self.handlers.drain() {
            handler.close(&mut self.root);
        }
        self.save_if_dirty();

        for worker in self.root.registry_mut().shutdown() {
            if let Err(e) = worker.await {
                tracing::warn!("Worker shutdown task failed: {}", e);
            }
        }
    }
}
