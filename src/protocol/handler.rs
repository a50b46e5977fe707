//! Per-connection protocol handler
//!
//! One [`ClientHandler`] exists per WebSocket connection. It lives on the
//! control-plane loop, so every method gets the [`RootModel`] directly and
//! never locks. Replies and notifications go out through the connection's
//! [`Outbound`] queue, which a single writer task drains in order.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::codec::WireValue;
use super::message::{self, notification, Outbound, Outgoing, Request, RpcError};
use super::permissions::{evaluate, EffectivePermissions, Permissions};
use crate::config::{LocalSinkSettings, NetworkSinkSettings, SessionSettings, SourceSettings};
use crate::error::RegistryError;
use crate::session::properties::{
    self, ChannelProperty, RootProperty, SessionProperty, CHANNEL_PROPERTIES, ROOT_PROPERTIES,
    SESSION_PROPERTIES,
};
use crate::session::root::SecurityChange;
use crate::session::{ModelChange, RootModel, Session, SessionId};
use crate::shm::{layout, Channel};

/// Where a connection comes from and what it asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Peer is on the loopback interface
    pub is_local: bool,
    /// Permissions the client declared it wants; the effective set never exceeds these
    pub intents: Permissions,
}

/// A request whose answer needs work off the loop
#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
    /// Refresh the device list, then answer `id` with it
    EnumerateDevices { id: Value },
}

enum Outcome {
    Done(Value),
    Deferred(Deferred),
}

type MethodResult = Result<Value, RpcError>;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticateParams {
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WatchParams {
    property: String,
    #[serde(default)]
    session: Option<SessionId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SetRootParams {
    property: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SetSessionParams {
    session: SessionId,
    property: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SetChannelParams {
    session: SessionId,
    channel: u32,
    property: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SessionParams {
    session: SessionId,
}

/// Configuration fields accepted by `AddSession` and `ConfigureSession`
#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct SessionConfig {
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    source: Option<SourceSettings>,
    #[serde(default, rename = "WASSink", alias = "LocalSink")]
    local_sink: Option<LocalSinkSettings>,
    #[serde(default)]
    network_sink: Option<NetworkSinkSettings>,
}

impl SessionConfig {
    /// Overwrite only the fields that were given
    fn apply(self, settings: &mut SessionSettings) {
        if let Some(rate) = self.sample_rate {
            settings.sample_rate = Some(rate).filter(|r| *r != 0);
        }
        if let Some(channels) = self.channels {
            settings.channels = channels;
        }
        if let Some(source) = self.source {
            settings.source = source;
        }
        if let Some(sink) = self.local_sink {
            settings.local_sink = Some(sink);
        }
        if let Some(sink) = self.network_sink {
            settings.network_sink = Some(sink);
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigureParams {
    session: SessionId,
    #[serde(flatten)]
    config: SessionConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PositionParams {
    session: SessionId,
    position: i64,
    #[serde(default)]
    relative: bool,
}

/// Decode params, treating a missing params member as an empty object
fn parse<T: DeserializeOwned>(params: &Value) -> Result<T, RpcError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|_| RpcError::invalid_params())
}

fn encode<T: Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| {
        tracing::error!("Failed to encode configuration: {}", e);
        RpcError::internal_error()
    })
}

fn remove_everywhere(local: &mut HashMap<SessionId, HashSet<&'static str>>, name: &str) {
    local.retain(|_, names| {
        names.remove(name);
        !names.is_empty()
    });
}

/// State of one control connection
pub struct ClientHandler {
    outbound: Outbound,
    info: ConnectionInfo,
    authenticated: bool,
    effective: EffectivePermissions,
    root_watch: HashSet<&'static str>,
    /// Session properties watched on every visible session
    session_watch: HashSet<&'static str>,
    channel_watch: HashSet<&'static str>,
    session_local: HashMap<SessionId, HashSet<&'static str>>,
    channel_local: HashMap<SessionId, HashSet<&'static str>>,
    taps: HashSet<SessionId>,
    visible: Vec<SessionId>,
}

impl ClientHandler {
    /// Set up a connection and send its initial `PermissionsChanged` and `SessionsChanged`
    pub fn new(info: ConnectionInfo, outbound: Outbound, root: &mut RootModel) -> Self {
        let mut handler = Self {
            outbound,
            info,
            authenticated: false,
            effective: EffectivePermissions {
                permissions: Permissions::NONE,
                can_authenticate: false,
            },
            root_watch: HashSet::new(),
            session_watch: HashSet::new(),
            channel_watch: HashSet::new(),
            session_local: HashMap::new(),
            channel_local: HashMap::new(),
            taps: HashSet::new(),
            visible: Vec::new(),
        };
        handler.apply_permissions(root, true);
        handler.refresh_visibility(root, true);
        handler
    }

    pub fn permissions(&self) -> Permissions {
        self.effective.permissions
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub fn visible_sessions(&self) -> &[SessionId] {
        &self.visible
    }

    pub fn is_tapping(&self, session: SessionId) -> bool {
        self.taps.contains(&session)
    }

    /// Whether the connection's writer has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Handle one decoded frame
    ///
    /// Returns work the caller must finish and then report through
    /// [`complete`](Self::complete).
    pub fn handle_message(
        &mut self,
        root: &mut RootModel,
        frame: Result<Value, RpcError>,
    ) -> Option<Deferred> {
        let message = match frame {
            Ok(message) => message,
            Err(error) => {
                self.send_text(message::error_without_id(error));
                return None;
            }
        };

        let request = match Request::from_message(message) {
            Ok(request) => request,
            Err((Some(id), error)) => {
                self.send_text(message::response(id, Err(error)));
                return None;
            }
            Err((None, error)) => {
                self.send_text(message::error_without_id(error));
                return None;
            }
        };

        tracing::trace!(method = %request.method, "Request");
        match self.dispatch(root, &request) {
            Ok(Outcome::Done(result)) => self.send_text(message::response(request.id, Ok(result))),
            Ok(Outcome::Deferred(deferred)) => return Some(deferred),
            Err(error) => {
                tracing::debug!(method = %request.method, %error, "Request failed");
                self.send_text(message::response(request.id, Err(error)));
            }
        }
        None
    }

    /// Answer a request returned as [`Deferred`]
    pub fn complete(&self, id: Value, result: MethodResult) {
        self.send_text(message::response(id, result));
    }

    fn dispatch(&mut self, root: &mut RootModel, request: &Request) -> Result<Outcome, RpcError> {
        let params = &request.params;
        let result = match request.method.as_str() {
            "Authenticate" => self.authenticate(root, params),
            "WatchRootProperty" => self.watch_root(root, params),
            "UnwatchRootProperty" => self.unwatch_root(params),
            "WatchSessionProperty" => self.watch_session(root, params),
            "UnwatchSessionProperty" => self.unwatch_session(params),
            "WatchChannelProperty" => self.watch_channel(root, params),
            "UnwatchChannelProperty" => self.unwatch_channel(params),
            "SetRootProperty" => self.set_root(root, params),
            "SetSessionProperty" => self.set_session(root, params),
            "SetChannelProperty" => self.set_channel(root, params),
            "AddSession" => self.add_session(root, params),
            "RemoveSession" => self.remove_session(root, params),
            "QuerySessionConfiguration" => self.query_configuration(root, params),
            "ConfigureSession" => self.configure_session(root, params),
            "SetSessionPosition" => self.set_position(root, params),
            "RestartSession" => self.restart_session(root, params),
            "RestartAllSessions" => self.restart_all(root),
            "OpenTapStream" => self.open_tap(root, params),
            "CloseTapStream" => self.close_tap(root, params),
            "QueryDirectTapInfo" => self.direct_tap_info(root, params),
            "EnumerateDevices" => {
                self.require(Permissions::CONFIGURE_SESSIONS)?;
                return Ok(Outcome::Deferred(Deferred::EnumerateDevices {
                    id: request.id.clone(),
                }));
            }
            _ => Err(RpcError::method_not_found()),
        };
        result.map(Outcome::Done)
    }

    fn require(&self, needed: Permissions) -> Result<(), RpcError> {
        if self.effective.permissions.contains(needed) {
            Ok(())
        } else {
            Err(RpcError::permission_denied())
        }
    }

    fn authenticate(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        let params: AuthenticateParams = parse(params)?;
        if !self.effective.can_authenticate {
            return Ok(Value::Bool(false));
        }
        let expected = root.websocket().secret.as_deref().filter(|s| !s.is_empty());
        if expected.is_none() || params.secret.as_deref() != expected {
            tracing::info!("Authentication failed");
            return Ok(Value::Bool(false));
        }

        self.authenticated = true;
        self.update_permissions(root);
        Ok(Value::Bool(true))
    }

    fn watch_root(&mut self, root: &RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::READ)?;
        let params: WatchParams = parse(params)?;
        let property =
            properties::find(ROOT_PROPERTIES, &params.property).ok_or(RpcError::unknown_property())?;
        self.notify_root(root, property);
        self.root_watch.insert(property.name);
        Ok(Value::Null)
    }

    fn unwatch_root(&mut self, params: &Value) -> MethodResult {
        let params: WatchParams = parse(params)?;
        self.root_watch.remove(params.property.as_str());
        Ok(Value::Null)
    }

    /// Resolve a session a request names, hiding invalid ones from connections that cannot configure
    fn watched_session<'a>(
        &self,
        root: &'a RootModel,
        id: SessionId,
    ) -> Result<&'a Session, RpcError> {
        let session = root.session(id).ok_or(RpcError::unknown_session())?;
        if !session.valid() {
            self.require(Permissions::CONFIGURE_SESSIONS)?;
        }
        Ok(session)
    }

    fn watch_session(&mut self, root: &RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::READ)?;
        let params: WatchParams = parse(params)?;
        let property = properties::find(SESSION_PROPERTIES, &params.property)
            .ok_or(RpcError::unknown_property())?;

        match params.session {
            Some(id) => {
                let session = self.watched_session(root, id)?;
                self.notify_session(session, property);
                if !self.session_watch.contains(property.name) {
                    self.session_local.entry(id).or_default().insert(property.name);
                }
            }
            None => {
                for session in self.visible.iter().filter_map(|id| root.session(*id)) {
                    self.notify_session(session, property);
                }
                self.session_watch.insert(property.name);
                remove_everywhere(&mut self.session_local, property.name);
            }
        }
        Ok(Value::Null)
    }

    fn unwatch_session(&mut self, params: &Value) -> MethodResult {
        let params: WatchParams = parse(params)?;
        match params.session {
            Some(id) => {
                if let Some(names) = self.session_local.get_mut(&id) {
                    names.remove(params.property.as_str());
                    if names.is_empty() {
                        self.session_local.remove(&id);
                    }
                }
            }
            None => {
                self.session_watch.remove(params.property.as_str());
                remove_everywhere(&mut self.session_local, &params.property);
            }
        }
        Ok(Value::Null)
    }

    fn watch_channel(&mut self, root: &RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::READ)?;
        let params: WatchParams = parse(params)?;
        let property = properties::find(CHANNEL_PROPERTIES, &params.property)
            .ok_or(RpcError::unknown_property())?;

        match params.session {
            Some(id) => {
                let session = self.watched_session(root, id)?;
                for channel in session.channels() {
                    self.notify_channel(session, channel, property);
                }
                if !self.channel_watch.contains(property.name) {
                    self.channel_local.entry(id).or_default().insert(property.name);
                }
            }
            None => {
                for session in self.visible.iter().filter_map(|id| root.session(*id)) {
                    for channel in session.channels() {
                        self.notify_channel(session, channel, property);
                    }
                }
                self.channel_watch.insert(property.name);
                remove_everywhere(&mut self.channel_local, property.name);
            }
        }
        Ok(Value::Null)
    }

    fn unwatch_channel(&mut self, params: &Value) -> MethodResult {
        let params: WatchParams = parse(params)?;
        match params.session {
            Some(id) => {
                if let Some(names) = self.channel_local.get_mut(&id) {
                    names.remove(params.property.as_str());
                    if names.is_empty() {
                        self.channel_local.remove(&id);
                    }
                }
            }
            None => {
                self.channel_watch.remove(params.property.as_str());
                remove_everywhere(&mut self.channel_local, &params.property);
            }
        }
        Ok(Value::Null)
    }

    fn set_root(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::WRITE_PROPERTIES)?;
        let params: SetRootParams = parse(params)?;
        let property =
            properties::find(ROOT_PROPERTIES, &params.property).ok_or(RpcError::unknown_property())?;
        let set = property.set.ok_or(RpcError::not_writable())?;
        set(root, &params.value).map_err(|_| RpcError::invalid_params())?;
        Ok(Value::Null)
    }

    fn set_session(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::WRITE_PROPERTIES)?;
        let params: SetSessionParams = parse(params)?;
        let session = root
            .session_mut(params.session)
            .ok_or(RpcError::unknown_session())?;
        let property = properties::find(SESSION_PROPERTIES, &params.property)
            .ok_or(RpcError::unknown_property())?;
        let set = property.set.ok_or(RpcError::not_writable())?;
        set(session, &params.value).map_err(|_| RpcError::invalid_params())?;
        root.registry_mut().mark_dirty();
        Ok(Value::Null)
    }

    fn set_channel(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::WRITE_PROPERTIES)?;
        let params: SetChannelParams = parse(params)?;
        let session = root
            .session_mut(params.session)
            .ok_or(RpcError::unknown_session())?;
        let channel = Channel::from_bits(params.channel)
            .filter(|channel| session.has_channel(*channel))
            .ok_or(RpcError::unknown_channel())?;
        let property = properties::find(CHANNEL_PROPERTIES, &params.property)
            .ok_or(RpcError::unknown_property())?;
        let set = property.set.ok_or(RpcError::not_writable())?;
        set(session, channel, &params.value).map_err(|_| RpcError::invalid_params())?;
        root.registry_mut().mark_dirty();
        Ok(Value::Null)
    }

    fn add_session(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        let config: SessionConfig = parse(params)?;
        let mut settings = SessionSettings::create_new();
        config.apply(&mut settings);

        let registry = root.registry_mut();
        let session = registry.create_session(settings).map_err(|e| {
            tracing::error!("Failed to create session: {}", e);
            RpcError::internal_error()
        })?;
        let id = registry.add(session).map_err(|e| {
            tracing::error!("Failed to add session: {}", e);
            RpcError::internal_error()
        })?;
        registry.mark_dirty();
        tracing::info!(session = id, "Session added");
        Ok(Value::from(id))
    }

    fn remove_session(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        let params: SessionParams = parse(params)?;
        let registry = root.registry_mut();
        registry
            .remove(params.session)
            .map_err(|_| RpcError::unknown_session())?;
        registry.mark_dirty();
        tracing::info!(session = params.session, "Session removed");
        Ok(Value::Null)
    }

    fn query_configuration(&mut self, root: &RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        let params: SessionParams = parse(params)?;
        let settings = root
            .session(params.session)
            .ok_or(RpcError::unknown_session())?
            .settings();

        let mut result = Map::new();
        if let Some(rate) = settings.sample_rate {
            result.insert("SampleRate".into(), Value::from(rate));
        }
        if settings.channels != 0 {
            result.insert("Channels".into(), Value::from(settings.channels));
        }
        if settings.source != SourceSettings::default() {
            result.insert("Source".into(), encode(&settings.source)?);
        }
        if let Some(sink) = &settings.local_sink {
            result.insert("WASSink".into(), encode(sink)?);
        }
        if let Some(sink) = &settings.network_sink {
            result.insert("NetworkSink".into(), encode(sink)?);
        }
        Ok(Value::Object(result))
    }

    fn configure_session(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        let params: ConfigureParams = parse(params)?;
        let session = root
            .session_mut(params.session)
            .ok_or(RpcError::unknown_session())?;
        let settings = session.settings_mut();
        params.config.apply(settings);
        settings.restart_pending = true;

        let registry = root.registry_mut();
        registry.mark_dirty();
        registry.restart_pending();
        Ok(Value::Null)
    }

    fn set_position(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        let params: PositionParams = parse(params)?;
        let registry = root.registry_mut();
        registry
            .set_position(params.session, params.position, params.relative)
            .map_err(|e| match e {
                RegistryError::UnknownSession(_) => RpcError::unknown_session(),
                _ => RpcError::invalid_params(),
            })?;
        registry.mark_dirty();
        Ok(Value::Null)
    }

    fn restart_session(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        let params: SessionParams = parse(params)?;
        let registry = root.registry_mut();
        registry
            .mark_restart_pending(params.session)
            .map_err(|_| RpcError::unknown_session())?;
        registry.restart_pending();
        Ok(Value::Null)
    }

    fn restart_all(&mut self, root: &mut RootModel) -> MethodResult {
        self.require(Permissions::CONFIGURE_SESSIONS)?;
        root.registry_mut().restart_all();
        Ok(Value::Null)
    }

    fn open_tap(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        self.require(Permissions::TAP_STREAM)?;
        let params: SessionParams = parse(params)?;
        self.watched_session(root, params.session)?;
        if self.taps.insert(params.session) {
            root.registry_mut().open_tap(params.session);
        }
        Ok(Value::Null)
    }

    fn close_tap(&mut self, root: &mut RootModel, params: &Value) -> MethodResult {
        let params: SessionParams = parse(params)?;
        if root.session(params.session).is_none() {
            return Err(RpcError::unknown_session());
        }
        if self.taps.remove(&params.session) {
            root.registry_mut().close_tap(params.session);
        }
        Ok(Value::Null)
    }

    fn direct_tap_info(&mut self, root: &RootModel, params: &Value) -> MethodResult {
        self.require(
            Permissions::READ | Permissions::WRITE_PROPERTIES | Permissions::TAP_STREAM,
        )?;
        if !self.info.is_local {
            return Err(RpcError::permission_denied());
        }
        let params: SessionParams = parse(params)?;
        let control = self.watched_session(root, params.session)?.control();
        Ok(json!({
            "SharedMemoryName": control.name(),
            "TapOffset": control.tap_offset(),
            "TapWriteCursorOffset": layout::TAP_WRITE_CURSOR_OFFSET,
            "TapCapacityOffset": layout::TAP_CAPACITY_OFFSET,
            "SampleRateOffset": layout::SAMPLE_RATE_OFFSET,
            "ChannelMaskOffset": layout::CHANNEL_MASK_OFFSET,
        }))
    }

    /// Forward tap bytes if this connection has the session's tap open
    pub fn on_tap_data(&self, session: SessionId, data: &Bytes) {
        if !self.taps.contains(&session) {
            return;
        }
        let frame = WireValue::object([
            ("method", WireValue::Text("TapData".to_string())),
            (
                "params",
                WireValue::object([
                    ("Session", WireValue::UInt(u64::from(session))),
                    ("Data", WireValue::Bytes(data.clone())),
                ]),
            ),
        ]);
        self.outbound.send(Outgoing::Binary(frame));
    }

    /// Notify watchers about one batch of model changes
    pub fn on_changes(&mut self, root: &mut RootModel, changes: &[ModelChange]) {
        // Sessions that became visible in this batch were just sent in full
        let mut fresh: HashSet<SessionId> = HashSet::new();

        for change in changes {
            match change {
                ModelChange::SessionsChanged => {
                    fresh.extend(self.refresh_visibility(root, false));
                }
                ModelChange::Root(name) => {
                    if self.root_watch.contains(name) {
                        if let Some(property) = properties::find(ROOT_PROPERTIES, name) {
                            self.notify_root(root, property);
                        }
                    }
                }
                ModelChange::Session(id, name) => {
                    if fresh.contains(id) || !self.watches_session(*id, name) {
                        continue;
                    }
                    if let (Some(session), Some(property)) =
                        (root.session(*id), properties::find(SESSION_PROPERTIES, name))
                    {
                        self.notify_session(session, property);
                    }
                }
                ModelChange::ChannelsAdded(id, channels) => {
                    if fresh.contains(id) || !self.visible.contains(id) {
                        continue;
                    }
                    let Some(session) = root.session(*id) else {
                        continue;
                    };
                    for name in self.channel_names(*id) {
                        if let Some(property) = properties::find(CHANNEL_PROPERTIES, name) {
                            for channel in channels {
                                self.notify_channel(session, *channel, property);
                            }
                        }
                    }
                }
                ModelChange::Channel(id, channel, name) => {
                    if fresh.contains(id) || !self.watches_channel(*id, name) {
                        continue;
                    }
                    if let (Some(session), Some(property)) =
                        (root.session(*id), properties::find(CHANNEL_PROPERTIES, name))
                    {
                        self.notify_channel(session, *channel, property);
                    }
                }
            }
        }
    }

    /// React to new security settings
    pub fn on_security_changed(&mut self, root: &mut RootModel, change: SecurityChange) {
        if change.secret_changed && self.authenticated {
            tracing::info!("Secret changed, dropping authentication");
            self.authenticated = false;
        }
        if !change.is_empty() {
            self.update_permissions(root);
        }
    }

    /// Release everything the connection holds
    pub fn close(self, root: &mut RootModel) {
        for id in self.taps {
            root.registry_mut().close_tap(id);
        }
    }

    fn watches_session(&self, id: SessionId, name: &str) -> bool {
        self.visible.contains(&id)
            && (self.session_watch.contains(name)
                || self
                    .session_local
                    .get(&id)
                    .is_some_and(|names| names.contains(name)))
    }

    fn watches_channel(&self, id: SessionId, name: &str) -> bool {
        self.visible.contains(&id)
            && (self.channel_watch.contains(name)
                || self
                    .channel_local
                    .get(&id)
                    .is_some_and(|names| names.contains(name)))
    }

    fn channel_names(&self, id: SessionId) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.channel_watch.iter().copied().collect();
        if let Some(local) = self.channel_local.get(&id) {
            names.extend(local.iter().copied());
        }
        names
    }

    fn update_permissions(&mut self, root: &mut RootModel) {
        self.apply_permissions(root, false);
        self.refresh_visibility(root, false);
    }

    /// Recompute the effective set and drop what it no longer allows
    fn apply_permissions(&mut self, root: &mut RootModel, force_notify: bool) {
        let effective = evaluate(
            root.websocket(),
            self.info.intents,
            self.info.is_local,
            self.authenticated,
        );
        if force_notify || effective != self.effective {
            self.effective = effective;
            tracing::debug!(permissions = ?effective.permissions, "Connection permissions changed");
            self.send_text(notification(
                "PermissionsChanged",
                json!({
                    "Permissions": effective.permissions.bits(),
                    "CanAuthenticate": effective.can_authenticate,
                }),
            ));
        }

        let permissions = self.effective.permissions;
        if !permissions.contains(Permissions::READ) {
            self.root_watch.clear();
            self.session_watch.clear();
            self.channel_watch.clear();
            self.session_local.clear();
            self.channel_local.clear();
        }
        if !permissions.contains(Permissions::TAP_STREAM) {
            for id in self.taps.drain() {
                root.registry_mut().close_tap(id);
            }
        }
    }

    /// Recompute which sessions this connection sees
    ///
    /// Sends `SessionsChanged` when the list differs (or `force` is set) and
    /// pushes globally watched values for newly visible sessions. Returns the
    /// newly visible ids.
    fn refresh_visibility(&mut self, root: &mut RootModel, force: bool) -> HashSet<SessionId> {
        let include_invalid = self
            .effective
            .permissions
            .contains(Permissions::CONFIGURE_SESSIONS);
        let visible = root.visible_sessions(include_invalid);
        if visible == self.visible && !force {
            return HashSet::new();
        }

        let removed: Vec<SessionId> = self
            .visible
            .iter()
            .filter(|id| !visible.contains(id))
            .copied()
            .collect();
        for id in removed {
            self.session_local.remove(&id);
            self.channel_local.remove(&id);
            if self.taps.remove(&id) {
                root.registry_mut().close_tap(id);
            }
        }

        let added: HashSet<SessionId> = visible
            .iter()
            .filter(|id| !self.visible.contains(id))
            .copied()
            .collect();
        self.visible = visible;
        self.send_text(notification(
            "SessionsChanged",
            json!({ "Ids": self.visible }),
        ));

        for session in self
            .visible
            .iter()
            .filter(|id| added.contains(id))
            .filter_map(|id| root.session(*id))
        {
            for property in SESSION_PROPERTIES
                .iter()
                .filter(|p| self.session_watch.contains(p.name))
            {
                self.notify_session(session, property);
            }
            for property in CHANNEL_PROPERTIES
                .iter()
                .filter(|p| self.channel_watch.contains(p.name))
            {
                for channel in session.channels() {
                    self.notify_channel(session, channel, property);
                }
            }
        }
        added
    }

    fn notify_root(&self, root: &RootModel, property: &RootProperty) {
        self.send_text(notification(
            "RootPropertyChanged",
            json!({ "Property": property.name, "Value": (property.get)(root) }),
        ));
    }

    fn notify_session(&self, session: &Session, property: &SessionProperty) {
        self.send_text(notification(
            "SessionPropertyChanged",
            json!({
                "Session": session.id(),
                "Property": property.name,
                "Value": (property.get)(session),
            }),
        ));
    }

    fn notify_channel(&self, session: &Session, channel: Channel, property: &ChannelProperty) {
        self.send_text(notification(
            "ChannelPropertyChanged",
            json!({
                "Session": session.id(),
                "Channel": channel.bits(),
                "Property": property.name,
                "Value": (property.get)(session, channel),
            }),
        ));
    }

    fn send_text(&self, value: Value) {
        self.outbound.send(Outgoing::Text(value));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::config::WebSocketSettings;
    use crate::session::registry::tests::{registry_with_devices, speakers};

    fn open_settings() -> WebSocketSettings {
        WebSocketSettings {
            unauthenticated_permissions: Permissions::ALL,
            ..Default::default()
        }
    }

    fn root_with_sessions(
        count: usize,
        with_devices: bool,
        websocket: WebSocketSettings,
    ) -> (RootModel, Vec<SessionId>) {
        let devices = if with_devices { vec![speakers()] } else { Vec::new() };
        let mut registry = registry_with_devices(devices);
        let ids = (0..count)
            .map(|_| {
                let session = registry.create_session(SessionSettings::create_new()).unwrap();
                registry.add(session).unwrap()
            })
            .collect();
        (RootModel::new(registry, websocket), ids)
    }

    struct Client {
        handler: ClientHandler,
        rx: UnboundedReceiver<Outgoing>,
    }

    impl Client {
        fn connect(root: &mut RootModel, is_local: bool) -> Self {
            let (outbound, rx) = Outbound::channel();
            let info = ConnectionInfo {
                is_local,
                intents: Permissions::ALL,
            };
            Self {
                handler: ClientHandler::new(info, outbound, root),
                rx,
            }
        }

        fn frames(&mut self) -> Vec<Outgoing> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn texts(&mut self) -> Vec<Value> {
            self.frames()
                .into_iter()
                .filter_map(|frame| match frame {
                    Outgoing::Text(value) => Some(value),
                    Outgoing::Binary(_) => None,
                })
                .collect()
        }

        /// Drops anything queued earlier, then returns the response and the notifications it caused
        fn call(&mut self, root: &mut RootModel, method: &str, params: Value) -> (Value, Vec<Value>) {
            self.frames();
            let request = json!({ "id": 1, "method": method, "params": params });
            assert!(self.handler.handle_message(root, Ok(request)).is_none());
            let mut texts = self.texts();
            let index = texts
                .iter()
                .position(|m| m.get("id").is_some())
                .expect("no response");
            let response = texts.remove(index);
            (response, texts)
        }

        fn changes(&mut self, root: &mut RootModel) -> Vec<Value> {
            self.frames();
            let changes = root.collect_changes();
            self.handler.on_changes(root, &changes);
            self.texts()
        }
    }

    fn error_code(response: &Value) -> i64 {
        response["error"]["code"].as_i64().unwrap_or(0)
    }

    fn of_method<'a>(messages: &'a [Value], method: &str) -> Vec<&'a Value> {
        messages.iter().filter(|m| m["method"] == method).collect()
    }

    #[test]
    fn test_connect_sends_permissions_then_sessions() {
        let (mut root, ids) = root_with_sessions(2, true, WebSocketSettings::default());
        let mut client = Client::connect(&mut root, true);
        let texts = client.texts();

        assert_eq!(
            texts[0],
            json!({
                "method": "PermissionsChanged",
                "params": { "Permissions": 9, "CanAuthenticate": false }
            })
        );
        assert_eq!(
            texts[1],
            json!({ "method": "SessionsChanged", "params": { "Ids": ids } })
        );
        assert_eq!(texts.len(), 2);
    }

    #[test]
    fn test_global_watch_notifies_each_visible_session_once() {
        let (mut root, ids) = root_with_sessions(2, true, open_settings());
        let mut client = Client::connect(&mut root, true);

        let (response, notes) = client.call(
            &mut root,
            "WatchSessionProperty",
            json!({ "Property": "MasterVolume" }),
        );
        assert_eq!(response["result"], Value::Null);
        assert_eq!(of_method(&notes, "SessionPropertyChanged").len(), 2);

        // a local watch on top of a global one adds nothing
        client.call(
            &mut root,
            "WatchSessionProperty",
            json!({ "Property": "MasterVolume", "Session": ids[0] }),
        );

        root.session_mut(ids[0]).unwrap().set_master_volume(0.5);
        let notes = client.changes(&mut root);
        let changed = of_method(&notes, "SessionPropertyChanged");
        assert_eq!(changed.len(), 1);
        assert_eq!(
            changed[0]["params"],
            json!({ "Session": ids[0], "Property": "MasterVolume", "Value": 0.5 })
        );

        client.call(
            &mut root,
            "UnwatchSessionProperty",
            json!({ "Property": "MasterVolume" }),
        );
        root.session_mut(ids[1]).unwrap().set_master_volume(0.25);
        assert!(client.changes(&mut root).is_empty());
    }

    #[test]
    fn test_channel_watch_follows_new_channels() {
        let (mut root, ids) = root_with_sessions(1, true, open_settings());
        let mut client = Client::connect(&mut root, true);
        client.call(
            &mut root,
            "WatchChannelProperty",
            json!({ "Property": "Volume" }),
        );

        let session = root.session_mut(ids[0]).unwrap();
        let mut snapshot = session.control().snapshot();
        snapshot.channel_mask = 0b11;
        session.apply_snapshot(&snapshot);

        let notes = client.changes(&mut root);
        let channels: Vec<&Value> = of_method(&notes, "ChannelPropertyChanged")
            .into_iter()
            .map(|m| &m["params"]["Channel"])
            .collect();
        assert_eq!(channels, vec![&json!(1), &json!(2)]);

        let (response, _) = client.call(
            &mut root,
            "SetChannelProperty",
            json!({ "Session": ids[0], "Channel": 4, "Property": "Volume", "Value": 0.5 }),
        );
        assert_eq!(error_code(&response), -32002);
        assert_eq!(response["error"]["message"], "Unknown channel");
    }

    #[test]
    fn test_invalid_sessions_need_configure_permission() {
        let (mut root, ids) = root_with_sessions(1, false, WebSocketSettings::default());
        let mut reader = Client::connect(&mut root, true);
        assert!(reader.handler.visible_sessions().is_empty());

        let (response, notes) = reader.call(
            &mut root,
            "WatchSessionProperty",
            json!({ "Property": "Valid", "Session": ids[0] }),
        );
        assert_eq!(error_code(&response), RpcError::PERMISSION_DENIED as i64);
        assert!(notes.is_empty());

        root.set_websocket(open_settings());
        let admin = Client::connect(&mut root, true);
        assert_eq!(admin.handler.visible_sessions(), &ids[..]);
    }

    #[test]
    fn test_tap_of_hidden_session_is_denied() {
        let (mut root, ids) = root_with_sessions(1, false, WebSocketSettings::default());
        let mut reader = Client::connect(&mut root, true);

        let (response, _) = reader.call(&mut root, "OpenTapStream", json!({ "Session": ids[0] }));
        assert_eq!(error_code(&response), RpcError::PERMISSION_DENIED as i64);
        assert!(!reader.handler.is_tapping(ids[0]));
        assert_eq!(root.registry().tap_subscribers(ids[0]), 0);
    }

    #[test]
    fn test_read_only_connection_must_authenticate() {
        let settings = WebSocketSettings {
            secret: Some("hunter2".to_string()),
            unauthenticated_permissions: Permissions::READ,
            ..Default::default()
        };
        let (mut root, ids) = root_with_sessions(1, true, settings);
        let mut client = Client::connect(&mut root, true);
        assert_eq!(client.handler.permissions(), Permissions::READ);

        let set = json!({ "Session": ids[0], "Property": "Muted", "Value": true });
        let (response, _) = client.call(&mut root, "SetSessionProperty", set.clone());
        assert_eq!(error_code(&response), -32003);

        let (response, _) = client.call(&mut root, "Authenticate", json!({ "Secret": "nope" }));
        assert_eq!(response["result"], false);

        let (response, notes) =
            client.call(&mut root, "Authenticate", json!({ "Secret": "hunter2" }));
        assert_eq!(response["result"], true);
        assert_eq!(
            of_method(&notes, "PermissionsChanged")[0]["params"],
            json!({ "Permissions": 15, "CanAuthenticate": false })
        );

        let (response, _) = client.call(&mut root, "SetSessionProperty", set);
        assert_eq!(response["result"], Value::Null);
        assert!(root.session(ids[0]).unwrap().muted());
        assert!(root.registry().is_dirty());
    }

    #[test]
    fn test_secret_change_drops_authentication() {
        let settings = WebSocketSettings {
            secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let (mut root, _) = root_with_sessions(0, true, settings.clone());
        let mut client = Client::connect(&mut root, true);
        client.call(&mut root, "Authenticate", json!({ "Secret": "hunter2" }));
        assert_eq!(client.handler.permissions(), Permissions::ALL);

        let change = root.set_websocket(WebSocketSettings {
            secret: Some("swordfish".to_string()),
            ..settings
        });
        client.handler.on_security_changed(&mut root, change);
        assert_eq!(
            client.handler.permissions(),
            Permissions::READ | Permissions::TAP_STREAM
        );
    }

    #[test]
    fn test_protocol_errors() {
        let (mut root, ids) = root_with_sessions(1, true, open_settings());
        let mut client = Client::connect(&mut root, true);
        client.frames();

        client
            .handler
            .handle_message(&mut root, Err(RpcError::parse_error()));
        client.handler.handle_message(&mut root, Ok(json!("hello")));
        assert_eq!(
            client.texts(),
            vec![
                json!({ "error": { "code": -32700, "message": "Parse Error" } }),
                json!({ "error": { "code": -32600, "message": "Invalid Request" } }),
            ]
        );

        client
            .handler
            .handle_message(&mut root, Ok(json!({ "id": "x", "params": {} })));
        assert_eq!(client.texts()[0]["id"], "x");

        let (response, _) = client.call(&mut root, "Frobnicate", Value::Null);
        assert_eq!(error_code(&response), -32601);

        let (response, _) = client.call(
            &mut root,
            "WatchRootProperty",
            json!({ "Property": "Loudness" }),
        );
        assert_eq!(error_code(&response), -32004);

        let (response, _) = client.call(
            &mut root,
            "SetSessionProperty",
            json!({ "Session": ids[0], "Property": "Valid", "Value": false }),
        );
        assert_eq!(error_code(&response), -32005);

        let (response, _) = client.call(
            &mut root,
            "SetSessionProperty",
            json!({ "Session": ids[0], "Property": "MasterVolume", "Value": "loud" }),
        );
        assert_eq!(error_code(&response), -32602);

        let (response, _) = client.call(&mut root, "RemoveSession", json!({ "Session": 99 }));
        assert_eq!(error_code(&response), -32002);
    }

    #[test]
    fn test_root_property_watch_and_set() {
        let (mut root, _) = root_with_sessions(2, true, open_settings());
        let mut client = Client::connect(&mut root, true);

        let (_, notes) = client.call(
            &mut root,
            "WatchRootProperty",
            json!({ "Property": "Muted" }),
        );
        assert_eq!(notes[0]["params"], json!({ "Property": "Muted", "Value": false }));

        client.call(
            &mut root,
            "SetRootProperty",
            json!({ "Property": "Muted", "Value": true }),
        );
        let notes = client.changes(&mut root);
        assert_eq!(
            of_method(&notes, "RootPropertyChanged")[0]["params"],
            json!({ "Property": "Muted", "Value": true })
        );

        let (response, _) = client.call(
            &mut root,
            "SetRootProperty",
            json!({ "Property": "Version", "Value": "v9" }),
        );
        assert_eq!(error_code(&response), -32005);
    }

    #[test]
    fn test_tap_stream_lifecycle() {
        let (mut root, ids) = root_with_sessions(1, true, open_settings());
        let mut client = Client::connect(&mut root, true);
        let data = Bytes::from_static(&[1, 2, 3]);

        client.handler.on_tap_data(ids[0], &data);
        client.call(&mut root, "OpenTapStream", json!({ "Session": ids[0] }));
        assert_eq!(root.registry().tap_subscribers(ids[0]), 1);

        client.handler.on_tap_data(ids[0], &data);
        match &client.frames()[..] {
            [Outgoing::Binary(frame)] => {
                let frame = Value::from(frame.clone());
                assert_eq!(frame["method"], "TapData");
                assert_eq!(
                    frame["params"],
                    json!({ "Session": ids[0], "Data": [1, 2, 3] })
                );
            }
            other => panic!("unexpected frames {other:?}"),
        }

        client.call(&mut root, "CloseTapStream", json!({ "Session": ids[0] }));
        assert_eq!(root.registry().tap_subscribers(ids[0]), 0);
        client.handler.on_tap_data(ids[0], &data);
        assert!(client.frames().is_empty());
    }

    #[test]
    fn test_losing_tap_permission_closes_taps() {
        let (mut root, ids) = root_with_sessions(1, true, open_settings());
        let mut client = Client::connect(&mut root, true);
        client.call(&mut root, "OpenTapStream", json!({ "Session": ids[0] }));

        let change = root.set_websocket(WebSocketSettings {
            unauthenticated_permissions: Permissions::READ,
            ..open_settings()
        });
        client.handler.on_security_changed(&mut root, change);
        assert!(!client.handler.is_tapping(ids[0]));
        assert_eq!(root.registry().tap_subscribers(ids[0]), 0);
    }

    #[test]
    fn test_direct_tap_info_is_local_only() {
        let settings = WebSocketSettings {
            network_permissions: Permissions::ALL,
            ..open_settings()
        };
        let (mut root, ids) = root_with_sessions(1, true, settings);
        let params = json!({ "Session": ids[0] });

        let mut remote = Client::connect(&mut root, false);
        let (response, _) = remote.call(&mut root, "QueryDirectTapInfo", params.clone());
        assert_eq!(error_code(&response), -32003);

        let mut local = Client::connect(&mut root, true);
        let (response, _) = local.call(&mut root, "QueryDirectTapInfo", params);
        let info = &response["result"];
        assert_eq!(info["TapWriteCursorOffset"], layout::TAP_WRITE_CURSOR_OFFSET);
        assert_eq!(info["ChannelMaskOffset"], layout::CHANNEL_MASK_OFFSET);
        assert_eq!(
            info["SharedMemoryName"],
            root.session(ids[0]).unwrap().control().name()
        );
    }

    #[test]
    fn test_session_configuration_methods() {
        let (mut root, ids) = root_with_sessions(1, true, open_settings());
        let mut client = Client::connect(&mut root, true);

        let (response, _) = client.call(&mut root, "AddSession", json!({ "SampleRate": 44100 }));
        let added = response["result"].as_u64().unwrap() as SessionId;
        let notes = client.changes(&mut root);
        assert_eq!(
            of_method(&notes, "SessionsChanged")[0]["params"]["Ids"],
            json!([ids[0], added])
        );

        let query = json!({ "Session": added });
        let (response, _) = client.call(&mut root, "QuerySessionConfiguration", query.clone());
        assert_eq!(response["result"], json!({ "SampleRate": 44100 }));

        client.call(
            &mut root,
            "ConfigureSession",
            json!({ "Session": added, "Channels": 3 }),
        );
        let (response, _) = client.call(&mut root, "QuerySessionConfiguration", query.clone());
        assert_eq!(response["result"], json!({ "SampleRate": 44100, "Channels": 3 }));

        client.call(
            &mut root,
            "ConfigureSession",
            json!({ "Session": added, "WASSink": { "Id": "spk-1" } }),
        );
        let (response, _) = client.call(&mut root, "QuerySessionConfiguration", query);
        assert_eq!(response["result"]["WASSink"]["Id"], "spk-1");
        assert!(response["result"].get("LocalSink").is_none());

        let (response, _) = client.call(
            &mut root,
            "SetSessionPosition",
            json!({ "Session": added, "Position": 0 }),
        );
        assert_eq!(response["result"], Value::Null);
        let (response, _) = client.call(
            &mut root,
            "SetSessionPosition",
            json!({ "Session": added, "Position": 5, "Relative": true }),
        );
        assert_eq!(error_code(&response), -32602);
        let notes = client.changes(&mut root);
        assert_eq!(
            of_method(&notes, "SessionsChanged")[0]["params"]["Ids"],
            json!([added, ids[0]])
        );

        let (response, _) = client.call(&mut root, "RemoveSession", json!({ "Session": added }));
        assert_eq!(response["result"], Value::Null);
        assert!(root.session(added).is_none());
    }

    #[test]
    fn test_enumerate_devices_is_deferred() {
        let (mut root, _) = root_with_sessions(0, true, open_settings());
        let mut client = Client::connect(&mut root, true);
        client.frames();

        let deferred = client.handler.handle_message(
            &mut root,
            Ok(json!({ "id": 7, "method": "EnumerateDevices" })),
        );
        assert_eq!(deferred, Some(Deferred::EnumerateDevices { id: json!(7) }));
        assert!(client.frames().is_empty());

        client.handler.complete(json!(7), Ok(json!([])));
        assert_eq!(client.texts(), vec![json!({ "id": 7, "result": [] })]);
    }

    #[test]
    fn test_losing_visibility_drops_local_watches() {
        let (mut root, ids) = root_with_sessions(1, true, WebSocketSettings::default());
        let mut local = Client::connect(&mut root, true);
        let mut global = Client::connect(&mut root, true);
        local.call(
            &mut root,
            "WatchSessionProperty",
            json!({ "Property": "Muted", "Session": ids[0] }),
        );
        global.call(&mut root, "WatchSessionProperty", json!({ "Property": "Muted" }));

        root.registry_mut().set_devices(Vec::new());
        local.frames();
        let changes = root.collect_changes();
        local.handler.on_changes(&mut root, &changes);
        global.handler.on_changes(&mut root, &changes);
        assert_eq!(
            of_method(&local.texts(), "SessionsChanged")[0]["params"]["Ids"],
            json!([])
        );
        global.frames();

        root.registry_mut().set_devices(vec![speakers()]);
        let changes = root.collect_changes();
        local.handler.on_changes(&mut root, &changes);
        global.handler.on_changes(&mut root, &changes);

        let local_notes = local.texts();
        assert!(of_method(&local_notes, "SessionPropertyChanged").is_empty());
        let global_notes = global.texts();
        let muted = of_method(&global_notes, "SessionPropertyChanged");
        assert_eq!(muted.len(), 1);
        assert_eq!(muted[0]["params"]["Property"], "Muted");
    }

    #[test]
    fn test_close_releases_taps() {
        let (mut root, ids) = root_with_sessions(1, true, open_settings());
        let mut client = Client::connect(&mut root, true);
        client.call(&mut root, "OpenTapStream", json!({ "Session": ids[0] }));
        client.handler.close(&mut root);
        assert_eq!(root.registry().tap_subscribers(ids[0]), 0);
    }
}
