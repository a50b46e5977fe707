//! Session Registry
//!
//! Keeps sessions in display order together with their supervised workers,
//! and binds each session's source and sink settings to the last known
//! device list. A session whose source (or configured local sink) does not
//! resolve is kept but marked invalid and runs no worker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::model::Session;
use super::poller::PollSet;
use super::SessionId;
use crate::audio::device::{default_device, resolve, DataFlow, Device, Role};
use crate::config::{NetworkSinkSettings, SessionSettings};
use crate::error::{RegistryError, ShmError};
use crate::shm::layout::DEFAULT_TAP_CAPACITY;
use crate::shm::ControlBlock;
use crate::worker::{
    CaptureParameters, Console, LaunchRequest, LocalSinkSpec, NetworkSinkSpec, SourceSpec,
    StopMode, SupervisorState, WorkerDriver, WorkerHandle,
};

/// How the registry creates blocks and fills worker parameters
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Prefix for shared memory names; `None` maps blocks anonymously
    pub shm_prefix: Option<String>,
    pub tap_capacity: usize,
    pub console_capacity: usize,
    pub network_sink_defaults: NetworkSinkSettings,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            shm_prefix: Some("capture-control".to_string()),
            tap_capacity: DEFAULT_TAP_CAPACITY,
            console_capacity: 20,
            network_sink_defaults: NetworkSinkSettings::default(),
        }
    }
}

struct Entry {
    session: Session,
    worker: Option<Box<dyn WorkerHandle>>,
}

/// Result of matching one session's settings against the device list
struct Binding {
    /// Worker parameters, `None` when the session is invalid
    params: Option<CaptureParameters>,
    name: Option<String>,
    can_swap: bool,
    settings_changed: bool,
}

fn bind(
    settings: &mut SessionSettings,
    devices: &[Device],
    defaults: &NetworkSinkSettings,
    shm_name: &str,
) -> Binding {
    let mut settings_changed = false;
    let source = &mut settings.source;

    let (source_spec, name, can_swap) = match source.id.clone() {
        Some(id) => match resolve(devices, &id, source.friendly_name.as_deref(), source.flow) {
            Some(device) => {
                if device.id != id
                    || source.friendly_name.as_deref() != Some(device.friendly_name.as_str())
                    || device.flow != source.flow
                {
                    source.id = Some(device.id.clone());
                    source.friendly_name = Some(device.friendly_name.clone());
                    source.flow = device.flow;
                    settings_changed = true;
                }
                (
                    Some(SourceSpec::Device {
                        id: device.id.clone(),
                    }),
                    Some(device.friendly_name.clone()),
                    device.flow == DataFlow::Render && device.is_default_for(Role::Console),
                )
            }
            None => (None, source.friendly_name.clone(), false),
        },
        None => match default_device(devices, source.flow, source.role) {
            Some(device) => (
                Some(SourceSpec::Default {
                    flow: source.flow,
                    role: source.role,
                }),
                Some(device.friendly_name.clone()),
                source.flow == DataFlow::Render && source.role == Role::Console,
            ),
            None => (None, None, false),
        },
    };

    let local_sink = match settings.local_sink.as_mut() {
        None => Some(None),
        Some(sink) => match sink.id.clone() {
            None => Some(Some(LocalSinkSpec::Default { role: sink.role })),
            Some(id) => resolve(devices, &id, sink.friendly_name.as_deref(), DataFlow::Render).map(
                |device| {
                    if device.id != id
                        || sink.friendly_name.as_deref() != Some(device.friendly_name.as_str())
                    {
                        sink.id = Some(device.id.clone());
                        sink.friendly_name = Some(device.friendly_name.clone());
                        settings_changed = true;
                    }
                    Some(LocalSinkSpec::Device {
                        id: device.id.clone(),
                    })
                },
            ),
        },
    };

    let params = match (source_spec, local_sink) {
        (Some(source), Some(local_sink)) => {
            let network_sink = settings.network_sink.as_ref().map(|sink| {
                let merged = sink.merged_with(defaults);
                NetworkSinkSpec {
                    bind_address: merged.bind_address,
                    peer_address: merged.peer_address,
                    peer_service: merged.peer_service,
                }
            });
            Some(CaptureParameters {
                shm_name: (!shm_name.is_empty()).then(|| shm_name.to_string()),
                sample_rate: settings.sample_rate,
                channel_mask: settings.channels,
                network_sink,
                local_sink,
                ..CaptureParameters::new(source)
            })
        }
        _ => None,
    };

    Binding {
        params,
        name,
        can_swap,
        settings_changed,
    }
}

/// Sessions in display order, each with its supervised worker
pub struct SessionRegistry {
    driver: Arc<dyn WorkerDriver>,
    options: RegistryOptions,
    entries: Vec<Entry>,
    devices: Vec<Device>,
    poll: PollSet,
    taps: HashMap<SessionId, usize>,
    next_id: SessionId,
    dirty: bool,
}

impl SessionRegistry {
    pub fn new(driver: Arc<dyn WorkerDriver>, options: RegistryOptions, poll: PollSet) -> Self {
        Self {
            driver,
            options,
            entries: Vec::new(),
            devices: Vec::new(),
            poll,
            taps: HashMap::new(),
            next_id: 1,
            dirty: false,
        }
    }

    pub fn driver(&self) -> &Arc<dyn WorkerDriver> {
        &self.driver
    }

    pub fn network_sink_defaults(&self) -> &NetworkSinkSettings {
        &self.options.network_sink_defaults
    }

    pub fn poll_set(&self) -> &PollSet {
        &self.poll
    }

    /// Whether settings changed since the last save
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the dirty marker, returning whether it was set
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Install a fresh device list and restart sessions whose bindings moved
    pub fn set_devices(&mut self, devices: Vec<Device>) {
        self.devices = devices;
        let mut pending = false;
        for index in 0..self.entries.len() {
            pending |= self.rebind(index);
        }
        if pending {
            self.restart_pending();
        }
    }

    /// Allocate an id and a Shared Control Block for new settings
    pub fn create_session(&mut self, settings: SessionSettings) -> Result<Session, ShmError> {
        let id = self.next_id;
        let control = match &self.options.shm_prefix {
            Some(prefix) => {
                let name = format!("{prefix}-{}-{id}", std::process::id());
                ControlBlock::create_with_capacity(&name, self.options.tap_capacity)?
            }
            None => ControlBlock::anonymous(self.options.tap_capacity)?,
        };
        self.next_id += 1;

        Ok(Session::new(
            id,
            settings,
            Arc::new(control),
            Console::new(self.options.console_capacity),
        ))
    }

    /// Append a session and start its worker if its devices resolve
    pub fn add(&mut self, session: Session) -> Result<SessionId, RegistryError> {
        let id = session.id();
        if self.index_of(id).is_some() {
            return Err(RegistryError::DuplicateSession(id));
        }

        self.poll.insert(id, Arc::clone(session.control()));
        self.entries.push(Entry {
            session,
            worker: None,
        });
        self.restart_at(self.entries.len() - 1);
        tracing::info!(session = id, "Session added");
        Ok(id)
    }

    /// Remove a session, stopping its worker in the background
    pub fn remove(&mut self, id: SessionId) -> Result<Session, RegistryError> {
        let index = self.index_of(id).ok_or(RegistryError::UnknownSession(id))?;
        let entry = self.entries.remove(index);
        self.poll.remove(id);
        self.taps.remove(&id);
        if let Some(worker) = entry.worker {
            worker.shutdown(StopMode::Graceful);
        }
        tracing::info!(session = id, "Session removed");
        Ok(entry.session)
    }

    fn index_of(&self, id: SessionId) -> Option<usize> {
        self.entries.iter().position(|e| e.session.id() == id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.entries.iter().find(|e| e.session.id() == id).map(|e| &e.session)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.entries
            .iter_mut()
            .find(|e| e.session.id() == id)
            .map(|e| &mut e.session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.entries.iter().map(|e| &e.session)
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.entries.iter_mut().map(|e| &mut e.session)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn worker_state(&self, id: SessionId) -> Option<SupervisorState> {
        let index = self.index_of(id)?;
        self.entries[index].worker.as_ref().map(|w| w.state())
    }

    /// Move a session to `position`, relative to its current index if asked
    pub fn set_position(
        &mut self,
        id: SessionId,
        position: i64,
        relative: bool,
    ) -> Result<(), RegistryError> {
        let index = self.index_of(id).ok_or(RegistryError::UnknownSession(id))?;
        let len = self.entries.len();
        let out_of_range = |position| RegistryError::PositionOutOfRange { position, len };
        let target = if relative {
            position
                .checked_add(index as i64)
                .ok_or_else(|| out_of_range(position))?
        } else {
            position
        };
        if target < 0 || target >= len as i64 {
            return Err(out_of_range(target));
        }

        let target = target as usize;
        if target != index {
            let entry = self.entries.remove(index);
            self.entries.insert(target, entry);
        }
        Ok(())
    }

    /// Flag a session for the next `restart_pending` pass
    pub fn mark_restart_pending(&mut self, id: SessionId) -> Result<(), RegistryError> {
        let session = self.get_mut(id).ok_or(RegistryError::UnknownSession(id))?;
        session.settings_mut().restart_pending = true;
        Ok(())
    }

    pub fn restart_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions().map(Session::id).collect();
        for id in ids {
            if let Some(index) = self.index_of(id) {
                self.restart_at(index);
            }
        }
    }

    /// Restart only the sessions flagged restart-pending
    pub fn restart_pending(&mut self) {
        let ids: Vec<SessionId> = self
            .sessions()
            .filter(|s| s.settings().restart_pending)
            .map(Session::id)
            .collect();
        for id in ids {
            if let Some(index) = self.index_of(id) {
                self.restart_at(index);
            }
        }
    }

    /// A worker is about to start; pick up device changes since it was configured
    pub fn on_worker_starting(&mut self, id: SessionId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        if self.rebind(index) {
            tracing::info!(session = id, "Device binding changed, restarting");
            self.restart_pending();
        }
    }

    /// Re-resolve without restarting; returns whether a restart is needed
    fn rebind(&mut self, index: usize) -> bool {
        let entry = &mut self.entries[index];
        let mut settings = entry.session.settings().clone();
        let binding = bind(
            &mut settings,
            &self.devices,
            &self.options.network_sink_defaults,
            entry.session.control().name(),
        );

        let valid = binding.params.is_some();
        let restart = binding.settings_changed || valid != entry.session.valid();
        if binding.settings_changed {
            *entry.session.settings_mut() = settings;
            self.dirty = true;
        }
        if restart {
            entry.session.settings_mut().restart_pending = true;
        } else {
            entry
                .session
                .set_resolution(valid, binding.name, binding.can_swap);
        }
        restart
    }

    fn restart_at(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        let id = entry.session.id();
        let shm_name = entry.session.control().name().to_string();
        let binding = bind(
            entry.session.settings_mut(),
            &self.devices,
            &self.options.network_sink_defaults,
            &shm_name,
        );
        if binding.settings_changed {
            self.dirty = true;
        }

        entry.session.settings_mut().restart_pending = false;
        entry
            .session
            .set_resolution(binding.params.is_some(), binding.name, binding.can_swap);

        let Some(params) = binding.params else {
            tracing::warn!(session = id, "Session devices did not resolve");
            if let Some(worker) = entry.worker.take() {
                worker.shutdown(StopMode::Kill);
            }
            return;
        };

        tracing::debug!(session = id, command = %params.command_line(), "Starting worker");
        if let Some(worker) = entry.worker.as_mut() {
            worker.restart(params);
        } else {
            entry.worker = Some(self.driver.launch(LaunchRequest {
                session: id,
                params,
                control: Arc::clone(entry.session.control()),
                console: entry.session.console().clone(),
            }));
        }
    }

    /// Count a tap subscriber; the first one activates the session's reader
    pub fn open_tap(&mut self, id: SessionId) {
        let count = self.taps.entry(id).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.poll.set_tap(id, true);
        }
    }

    /// Drop a tap subscriber; the last one deactivates the reader
    pub fn close_tap(&mut self, id: SessionId) {
        let Some(count) = self.taps.get_mut(&id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.taps.remove(&id);
            self.poll.set_tap(id, false);
        }
    }

    pub fn tap_subscribers(&self, id: SessionId) -> usize {
        self.taps.get(&id).copied().unwrap_or(0)
    }

    /// Stop every worker gracefully, returning the tasks to await
    pub fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.worker.take())
            .filter_map(|worker| worker.shutdown(StopMode::Graceful))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::device::DeviceState;
    use crate::config::{LocalSinkSettings, SourceSettings};
    use crate::worker::driver::fake::{FakeDriver, WorkerEvent};

    pub(crate) fn device(id: &str, name: &str, flow: DataFlow, default_for: Vec<Role>) -> Device {
        Device {
            id: id.to_string(),
            friendly_name: name.to_string(),
            flow,
            state: vec![DeviceState::Active],
            sample_rate: 48000,
            channels: 3,
            default_for,
        }
    }

    pub(crate) fn speakers() -> Device {
        device(
            "spk",
            "Speakers (Realtek Audio)",
            DataFlow::Render,
            vec![Role::Console, Role::Multimedia],
        )
    }

    pub(crate) fn test_options() -> RegistryOptions {
        RegistryOptions {
            shm_prefix: None,
            tap_capacity: 4096,
            ..Default::default()
        }
    }

    pub(crate) fn fake_registry(devices: Vec<Device>) -> (SessionRegistry, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::with_devices(devices.clone()));
        let mut registry = SessionRegistry::new(driver.clone(), test_options(), PollSet::default());
        registry.set_devices(devices);
        (registry, driver)
    }

    pub(crate) fn registry_with_devices(devices: Vec<Device>) -> SessionRegistry {
        fake_registry(devices).0
    }

    fn add_new(registry: &mut SessionRegistry, settings: SessionSettings) -> SessionId {
        let session = registry.create_session(settings).unwrap();
        registry.add(session).unwrap()
    }

    #[test]
    fn test_add_starts_valid_session() {
        let (mut registry, driver) = fake_registry(vec![speakers()]);
        let id = add_new(&mut registry, SessionSettings::create_new());

        let session = registry.get(id).unwrap();
        assert!(session.valid());
        assert!(session.can_swap());
        assert_eq!(session.name(), Some("Speakers (Realtek Audio)"));
        assert!(registry.poll_set().contains(id));
        match &driver.events()[..] {
            [WorkerEvent::Launch(launched, params)] => {
                assert_eq!(*launched, id);
                assert_eq!(
                    params.source,
                    SourceSpec::Default {
                        flow: DataFlow::Render,
                        role: Role::Console
                    }
                );
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_add_fails_without_second_worker() {
        let (mut registry, driver) = fake_registry(vec![speakers()]);
        let id = add_new(&mut registry, SessionSettings::create_new());

        let control = Arc::new(ControlBlock::anonymous(64).unwrap());
        let twin = Session::new(id, SessionSettings::create_new(), control, Console::new(1));
        assert!(matches!(registry.add(twin), Err(RegistryError::DuplicateSession(d)) if d == id));
        assert_eq!(driver.launches(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_absent_has_no_side_effects() {
        let (mut registry, driver) = fake_registry(vec![speakers()]);
        let id = add_new(&mut registry, SessionSettings::create_new());
        driver.clear();

        assert!(matches!(registry.remove(id + 100), Err(RegistryError::UnknownSession(_))));
        assert!(driver.events().is_empty());
        assert_eq!(registry.len(), 1);

        registry.remove(id).unwrap();
        assert_eq!(
            driver.events(),
            vec![WorkerEvent::Shutdown(id, StopMode::Graceful)]
        );
        assert!(!registry.poll_set().contains(id));
    }

    #[test]
    fn test_invalid_session_runs_no_worker() {
        let (mut registry, driver) = fake_registry(Vec::new());
        let id = add_new(&mut registry, SessionSettings::create_new());
        assert!(!registry.get(id).unwrap().valid());
        assert_eq!(driver.launches(), 0);

        registry.set_devices(vec![speakers()]);
        assert!(registry.get(id).unwrap().valid());
        assert_eq!(driver.launches(), 1);
    }

    #[test]
    fn test_restart_pending_only_touches_flagged_sessions() {
        let (mut registry, driver) = fake_registry(vec![speakers()]);
        let first = add_new(&mut registry, SessionSettings::create_new());
        let second = add_new(&mut registry, SessionSettings::create_new());
        driver.clear();

        registry.mark_restart_pending(second).unwrap();
        registry.restart_pending();
        let events = driver.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Restart(id, _) if *id == second));
        assert!(!registry.get(second).unwrap().settings().restart_pending);

        driver.clear();
        registry.restart_pending();
        assert!(driver.events().is_empty());

        registry.restart_all();
        let restarted: Vec<_> = driver
            .events()
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Restart(id, _) => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(restarted, vec![first, second]);
    }

    #[test]
    fn test_lost_device_kills_worker() {
        let mic = device("mic", "Microphone (USB)", DataFlow::Capture, vec![]);
        let (mut registry, driver) = fake_registry(vec![speakers(), mic]);
        let mut settings = SessionSettings::create_new();
        settings.source = SourceSettings {
            id: Some("mic".to_string()),
            friendly_name: Some("Microphone (USB)".to_string()),
            flow: DataFlow::Capture,
            role: Role::Console,
        };
        let id = add_new(&mut registry, settings);
        assert!(registry.get(id).unwrap().valid());
        driver.clear();

        registry.set_devices(vec![speakers()]);
        assert!(!registry.get(id).unwrap().valid());
        assert_eq!(driver.events(), vec![WorkerEvent::Shutdown(id, StopMode::Kill)]);
    }

    #[test]
    fn test_renamed_device_rewrites_settings() {
        let (mut registry, _driver) = fake_registry(vec![speakers()]);
        let mut settings = SessionSettings::create_new();
        settings.source.id = Some("old-id".to_string());
        settings.source.friendly_name = Some("Speakers (Realtek Audio)".to_string());
        let id = add_new(&mut registry, settings);
        assert!(registry.take_dirty());

        let source = &registry.get(id).unwrap().settings().source;
        assert_eq!(source.id.as_deref(), Some("spk"));

        let mut renamed = speakers();
        renamed.friendly_name = "Speakers (2- Realtek Audio)".to_string();
        registry.set_devices(vec![renamed]);
        let session = registry.get(id).unwrap();
        assert_eq!(
            session.settings().source.friendly_name.as_deref(),
            Some("Speakers (2- Realtek Audio)")
        );
        assert!(!session.settings().restart_pending);
        assert!(registry.is_dirty());
    }

    #[test]
    fn test_worker_starting_picks_up_changes() {
        let (mut registry, driver) = fake_registry(vec![speakers()]);
        let mut settings = SessionSettings::create_new();
        settings.local_sink = Some(LocalSinkSettings {
            id: Some("spk".to_string()),
            friendly_name: None,
            role: Role::Console,
        });
        let id = add_new(&mut registry, settings);
        driver.clear();

        registry.on_worker_starting(id);
        assert!(driver.events().is_empty());

        let mut moved = speakers();
        moved.id = "spk-2".to_string();
        registry.devices = vec![moved];
        registry.on_worker_starting(id);
        match &driver.events()[..] {
            [WorkerEvent::Restart(restarted, params)] => {
                assert_eq!(*restarted, id);
                assert_eq!(
                    params.local_sink,
                    Some(LocalSinkSpec::Device {
                        id: "spk-2".to_string()
                    })
                );
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_set_position() {
        let (mut registry, _) = fake_registry(vec![speakers()]);
        let ids: Vec<_> = (0..3)
            .map(|_| add_new(&mut registry, SessionSettings::create_new()))
            .collect();
        let order = |r: &SessionRegistry| r.sessions().map(Session::id).collect::<Vec<_>>();

        registry.set_position(ids[0], 2, false).unwrap();
        assert_eq!(order(&registry), vec![ids[1], ids[2], ids[0]]);

        registry.set_position(ids[0], -1, true).unwrap();
        assert_eq!(order(&registry), vec![ids[1], ids[0], ids[2]]);

        assert!(matches!(
            registry.set_position(ids[0], 5, true),
            Err(RegistryError::PositionOutOfRange { position: 6, len: 3 })
        ));
        assert_eq!(order(&registry), vec![ids[1], ids[0], ids[2]]);
    }

    #[test]
    fn test_set_position_extremes_are_out_of_range() {
        let (mut registry, _) = fake_registry(vec![speakers()]);
        let ids: Vec<_> = (0..2)
            .map(|_| add_new(&mut registry, SessionSettings::create_new()))
            .collect();

        assert!(matches!(
            registry.set_position(ids[1], i64::MAX, true),
            Err(RegistryError::PositionOutOfRange { position: i64::MAX, len: 2 })
        ));
        assert!(matches!(
            registry.set_position(ids[1], i64::MIN, true),
            Err(RegistryError::PositionOutOfRange { position, len: 2 }) if position == i64::MIN + 1
        ));
        assert!(matches!(
            registry.set_position(ids[0], i64::MAX, false),
            Err(RegistryError::PositionOutOfRange { position: i64::MAX, len: 2 })
        ));
        assert_eq!(
            registry.sessions().map(Session::id).collect::<Vec<_>>(),
            ids
        );
    }

    #[test]
    fn test_network_sink_merges_defaults() {
        let driver = Arc::new(FakeDriver::default());
        let options = RegistryOptions {
            network_sink_defaults: NetworkSinkSettings {
                bind_address: Some("0.0.0.0".to_string()),
                peer_address: Some("10.0.0.2".to_string()),
                peer_service: Some("4010".to_string()),
            },
            ..test_options()
        };
        let mut registry = SessionRegistry::new(driver.clone(), options, PollSet::default());
        registry.set_devices(vec![speakers()]);

        let mut settings = SessionSettings::create_new();
        settings.network_sink = Some(NetworkSinkSettings {
            peer_address: Some("10.0.0.9".to_string()),
            ..Default::default()
        });
        add_new(&mut registry, settings);

        match &driver.events()[..] {
            [WorkerEvent::Launch(_, params)] => {
                let sink = params.network_sink.as_ref().unwrap();
                assert_eq!(sink.bind_address.as_deref(), Some("0.0.0.0"));
                assert_eq!(sink.peer_address.as_deref(), Some("10.0.0.9"));
                assert_eq!(sink.peer_service.as_deref(), Some("4010"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_tap_subscribers_toggle_reader() {
        let (mut registry, _) = fake_registry(vec![speakers()]);
        let id = add_new(&mut registry, SessionSettings::create_new());

        registry.open_tap(id);
        registry.open_tap(id);
        assert!(registry.poll_set().tap_active(id));
        registry.close_tap(id);
        assert!(registry.poll_set().tap_active(id));
        registry.close_tap(id);
        assert!(!registry.poll_set().tap_active(id));
        assert_eq!(registry.tap_subscribers(id), 0);
    }
}
