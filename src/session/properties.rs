//! Property tables exposed over the protocol
//!
//! Each exposed entity has one static table mapping a wire name to a getter
//! and an optional setter. The protocol handler looks names up here; the
//! root model diffs getter output to find what changed.

use serde_json::Value;

use super::model::Session;
use super::root::RootModel;
use crate::shm::Channel;

/// JSON shape of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Bool,
    Integer,
    /// Finite numbers, `null` standing for +infinity
    Number,
    Text,
}

/// A setter received a value of the wrong shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidValue {
    pub expected: WireType,
}

/// One named property of an entity
pub struct Property<G, S> {
    pub name: &'static str,
    pub wire: WireType,
    pub get: G,
    pub set: Option<S>,
}

impl<G, S> Property<G, S> {
    pub fn writable(&self) -> bool {
        self.set.is_some()
    }
}

pub type RootProperty = Property<
    fn(&RootModel) -> Value,
    fn(&mut RootModel, &Value) -> Result<(), InvalidValue>,
>;

pub type SessionProperty =
    Property<fn(&Session) -> Value, fn(&mut Session, &Value) -> Result<(), InvalidValue>>;

pub type ChannelProperty = Property<
    fn(&Session, Channel) -> Value,
    fn(&mut Session, Channel, &Value) -> Result<(), InvalidValue>,
>;

/// Look a property up by wire name
pub fn find<G, S>(table: &'static [Property<G, S>], name: &str) -> Option<&'static Property<G, S>> {
    table.iter().find(|property| property.name == name)
}

/// Encode a float, mapping non-finite values to `null`
pub fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn parse_bool(value: &Value) -> Result<bool, InvalidValue> {
    value.as_bool().ok_or(InvalidValue {
        expected: WireType::Bool,
    })
}

fn parse_number(value: &Value) -> Result<f64, InvalidValue> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or(InvalidValue {
            expected: WireType::Number,
        })
}

fn parse_unbounded(value: &Value) -> Result<f64, InvalidValue> {
    if value.is_null() {
        Ok(f64::INFINITY)
    } else {
        parse_number(value)
    }
}

fn parse_color(value: &Value) -> Result<u32, InvalidValue> {
    value
        .as_u64()
        .filter(|v| *v <= 0xFF_FF_FF)
        .map(|v| v as u32)
        .ok_or(InvalidValue {
            expected: WireType::Integer,
        })
}

pub static ROOT_PROPERTIES: &[RootProperty] = &[
    Property {
        name: "MasterVolume",
        wire: WireType::Number,
        get: |root| number(root.master_volume()),
        set: None,
    },
    Property {
        name: "Muted",
        wire: WireType::Bool,
        get: |root| Value::Bool(root.muted()),
        set: Some(|root, value| {
            root.set_muted(parse_bool(value)?);
            Ok(())
        }),
    },
    Property {
        name: "Version",
        wire: WireType::Text,
        get: |root| Value::from(root.version()),
        set: None,
    },
];

pub static SESSION_PROPERTIES: &[SessionProperty] = &[
    Property {
        name: "PersistentId",
        wire: WireType::Text,
        get: |session| Value::from(session.persistent_id().to_string()),
        set: None,
    },
    Property {
        name: "Name",
        wire: WireType::Text,
        get: |session| session.name().map_or(Value::Null, Value::from),
        set: None,
    },
    Property {
        name: "Valid",
        wire: WireType::Bool,
        get: |session| Value::Bool(session.valid()),
        set: None,
    },
    Property {
        name: "CanSwap",
        wire: WireType::Bool,
        get: |session| Value::Bool(session.can_swap()),
        set: None,
    },
    Property {
        name: "SampleRate",
        wire: WireType::Integer,
        get: |session| Value::from(session.sample_rate()),
        set: None,
    },
    Property {
        name: "ChannelMask",
        wire: WireType::Integer,
        get: |session| Value::from(session.channel_mask()),
        set: None,
    },
    Property {
        name: "MonitorVolume",
        wire: WireType::Number,
        get: |session| number(session.monitor_volume()),
        set: None,
    },
    Property {
        name: "TapWriteCursorDelta",
        wire: WireType::Integer,
        get: |session| Value::from(session.tap_write_cursor_delta()),
        set: None,
    },
    Property {
        name: "Color",
        wire: WireType::Integer,
        get: |session| Value::from(session.color()),
        set: Some(|session, value| {
            session.set_color(parse_color(value)?);
            Ok(())
        }),
    },
    Property {
        name: "MasterVolume",
        wire: WireType::Number,
        get: |session| number(session.master_volume()),
        set: Some(|session, value| {
            session.set_master_volume(parse_number(value)?);
            Ok(())
        }),
    },
    Property {
        name: "Muted",
        wire: WireType::Bool,
        get: |session| Value::Bool(session.muted()),
        set: Some(|session, value| {
            session.set_muted(parse_bool(value)?);
            Ok(())
        }),
    },
    Property {
        name: "MaxMasterVolume",
        wire: WireType::Number,
        get: |session| number(session.max_master_volume()),
        set: Some(|session, value| {
            session.set_max_master_volume(parse_number(value)?);
            Ok(())
        }),
    },
    Property {
        name: "SilenceThreshold",
        wire: WireType::Number,
        get: |session| number(session.silence_threshold()),
        set: Some(|session, value| {
            session.set_silence_threshold(parse_number(value)?);
            Ok(())
        }),
    },
    Property {
        name: "AveragingWeight",
        wire: WireType::Number,
        get: |session| number(session.averaging_weight()),
        set: Some(|session, value| {
            session.set_averaging_weight(parse_number(value)?);
            Ok(())
        }),
    },
    Property {
        name: "SaturationThreshold",
        wire: WireType::Number,
        get: |session| number(session.saturation_threshold()),
        set: Some(|session, value| {
            session.set_saturation_threshold(parse_unbounded(value)?);
            Ok(())
        }),
    },
    Property {
        name: "SaturationDebounceFactor",
        wire: WireType::Number,
        get: |session| number(session.saturation_debounce_factor()),
        set: Some(|session, value| {
            session.set_saturation_debounce_factor(parse_number(value)?);
            Ok(())
        }),
    },
    Property {
        name: "SaturationRecoveryFactor",
        wire: WireType::Number,
        get: |session| number(session.saturation_recovery_factor()),
        set: Some(|session, value| {
            session.set_saturation_recovery_factor(parse_unbounded(value)?);
            Ok(())
        }),
    },
];

pub static CHANNEL_PROPERTIES: &[ChannelProperty] = &[Property {
    name: "Volume",
    wire: WireType::Number,
    get: |session, channel| number(session.channel_volume(channel)),
    set: Some(|session, channel, value| {
        session.set_channel_volume(channel, parse_number(value)?);
        Ok(())
    }),
}];
