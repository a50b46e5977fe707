//! Root model: every session plus the computed root properties
//!
//! Mutations happen in batches on the control-plane loop. After each batch
//! the loop calls [`RootModel::collect_changes`], which re-evaluates every
//! property getter and reports the ones whose value differs from the last
//! collection.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::model::Session;
use super::properties::{CHANNEL_PROPERTIES, ROOT_PROPERTIES, SESSION_PROPERTIES};
use super::registry::SessionRegistry;
use super::SessionId;
use crate::config::{RootSettings, WebSocketSettings};
use crate::constants::MONITOR_VOLUME_STEP;
use crate::shm::Channel;

/// Something a subscriber may need to hear about
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChange {
    /// Session order, membership or validity changed
    SessionsChanged,
    Root(&'static str),
    Session(SessionId, &'static str),
    /// The worker reported channels that were not there before
    ChannelsAdded(SessionId, Vec<Channel>),
    Channel(SessionId, Channel, &'static str),
}

/// How a change to the protocol security settings affects connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityChange {
    pub secret_changed: bool,
    pub permissions_changed: bool,
}

impl SecurityChange {
    pub fn is_empty(&self) -> bool {
        !self.secret_changed && !self.permissions_changed
    }
}

/// Meter movement below one step, except falls to silence
fn is_meter_jitter(property: &str, old: &Value, new: &Value) -> bool {
    if property != "MonitorVolume" {
        return false;
    }
    match (old.as_f64(), new.as_f64()) {
        (Some(old), Some(new)) => new != 0.0 && (old - new).abs() < MONITOR_VOLUME_STEP,
        _ => false,
    }
}

#[derive(Default)]
struct ObservedSession {
    values: Vec<Value>,
    channels: BTreeMap<Channel, Vec<Value>>,
}

/// Values seen by the last `collect_changes`
#[derive(Default)]
struct Observed {
    layout: Vec<(SessionId, bool)>,
    root: Vec<Value>,
    sessions: HashMap<SessionId, ObservedSession>,
}

/// Owner of all sessions and root-level state
pub struct RootModel {
    registry: SessionRegistry,
    websocket: WebSocketSettings,
    observed: Observed,
}

impl RootModel {
    pub fn new(registry: SessionRegistry, websocket: WebSocketSettings) -> Self {
        let mut model = Self {
            registry,
            websocket,
            observed: Observed::default(),
        };
        model.collect_changes();
        model
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.registry.get(id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.registry.get_mut(id)
    }

    /// Loudest master volume among valid, unmuted sessions
    pub fn master_volume(&self) -> f64 {
        self.registry
            .sessions()
            .filter(|s| s.valid() && !s.muted())
            .map(Session::master_volume)
            .fold(0.0, f64::max)
    }

    /// True when every valid session is muted
    pub fn muted(&self) -> bool {
        self.registry
            .sessions()
            .filter(|s| s.valid())
            .all(Session::muted)
    }

    /// Mute every valid session, or restore the states saved when muting
    pub fn set_muted(&mut self, muted: bool) {
        for session in self.registry.sessions_mut().filter(|s| s.valid()) {
            if muted {
                let previous = session.muted();
                session.settings_mut().saved_muted = Some(previous);
                session.set_muted(true);
            } else {
                let restored = session.settings_mut().saved_muted.take().unwrap_or(false);
                session.set_muted(restored);
            }
        }
        self.registry.mark_dirty();
    }

    pub fn version(&self) -> String {
        format!("v{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn websocket(&self) -> &WebSocketSettings {
        &self.websocket
    }

    /// Replace the security settings, reporting what changed
    pub fn set_websocket(&mut self, websocket: WebSocketSettings) -> SecurityChange {
        let change = SecurityChange {
            secret_changed: websocket.secret != self.websocket.secret,
            permissions_changed: websocket.global_permissions != self.websocket.global_permissions
                || websocket.network_permissions != self.websocket.network_permissions
                || websocket.unauthenticated_permissions
                    != self.websocket.unauthenticated_permissions,
        };
        self.websocket = websocket;
        change
    }

    /// Sessions a connection may see, in display order
    pub fn visible_sessions(&self, include_invalid: bool) -> Vec<SessionId> {
        self.registry
            .sessions()
            .filter(|s| include_invalid || s.valid())
            .map(Session::id)
            .collect()
    }

    /// Document to persist
    pub fn to_settings(&self) -> RootSettings {
        RootSettings {
            network_sink_defaults: self.registry.network_sink_defaults().clone(),
            websocket: self.websocket.clone(),
            sessions: self.registry.sessions().map(|s| s.settings().clone()).collect(),
        }
    }

    /// Diff every exposed value against the last call
    ///
    /// Sessions and channels seen for the first time are recorded without
    /// per-property events; subscribers learn about them through
    /// `SessionsChanged` and `ChannelsAdded`.
    pub fn collect_changes(&mut self) -> Vec<ModelChange> {
        let mut changes = Vec::new();

        let layout: Vec<(SessionId, bool)> =
            self.registry.sessions().map(|s| (s.id(), s.valid())).collect();
        if layout != self.observed.layout {
            changes.push(ModelChange::SessionsChanged);
            self.observed.layout = layout;
        }

        let root: Vec<Value> = ROOT_PROPERTIES.iter().map(|p| (p.get)(self)).collect();
        if !self.observed.root.is_empty() {
            for (property, (old, new)) in ROOT_PROPERTIES
                .iter()
                .zip(self.observed.root.iter().zip(&root))
            {
                if old != new {
                    changes.push(ModelChange::Root(property.name));
                }
            }
        }
        self.observed.root = root;

        let observed = &mut self.observed.sessions;
        observed.retain(|id, _| self.registry.get(*id).is_some());

        for session in self.registry.sessions() {
            let id = session.id();
            let mut values: Vec<Value> =
                SESSION_PROPERTIES.iter().map(|p| (p.get)(session)).collect();
            let channels: BTreeMap<Channel, Vec<Value>> = session
                .channels()
                .map(|channel| {
                    let values = CHANNEL_PROPERTIES
                        .iter()
                        .map(|p| (p.get)(session, channel))
                        .collect();
                    (channel, values)
                })
                .collect();

            let Some(seen) = observed.get_mut(&id) else {
                observed.insert(id, ObservedSession { values, channels });
                continue;
            };

            for (index, property) in SESSION_PROPERTIES.iter().enumerate() {
                let old = &seen.values[index];
                if *old == values[index] {
                    continue;
                }
                if is_meter_jitter(property.name, old, &values[index]) {
                    // Keep the reported value so slow drift still adds up
                    values[index] = old.clone();
                } else {
                    changes.push(ModelChange::Session(id, property.name));
                }
            }

            let added: Vec<Channel> = channels
                .keys()
                .filter(|channel| !seen.channels.contains_key(channel))
                .copied()
                .collect();
            for (channel, new) in &channels {
                let Some(old) = seen.channels.get(channel) else {
                    continue;
                };
                for (property, (old, new)) in CHANNEL_PROPERTIES.iter().zip(old.iter().zip(new)) {
                    if old != new {
                        changes.push(ModelChange::Channel(id, *channel, property.name));
                    }
                }
            }
            if !added.is_empty() {
                changes.push(ModelChange::ChannelsAdded(id, added));
            }

            *seen = ObservedSession { values, channels };
        }

        changes
    }
}
