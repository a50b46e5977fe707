//! Audio endpoint enumeration and resolution
//!
//! Devices are listed by the worker executable's `list` command and matched
//! against persisted settings by id, then by friendly name. Endpoint names
//! look like `Speakers (2- USB Audio)`, so renumbered or renamed interfaces
//! are still found through the parsed name parts.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Direction of an audio endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFlow {
    #[default]
    Render,
    Capture,
    All,
}

impl DataFlow {
    pub fn bits(self) -> u32 {
        match self {
            DataFlow::Render => 1,
            DataFlow::Capture => 2,
            DataFlow::All => 3,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(DataFlow::Render),
            2 => Some(DataFlow::Capture),
            3 => Some(DataFlow::All),
            _ => None,
        }
    }

    /// True when both flows share a direction
    pub fn intersects(self, other: DataFlow) -> bool {
        self.bits() & other.bits() != 0
    }

    pub fn as_word(self) -> &'static str {
        match self {
            DataFlow::Render => "render",
            DataFlow::Capture => "capture",
            DataFlow::All => "all",
        }
    }

    fn parse_word(word: &str) -> Option<Self> {
        match word {
            "render" => Some(DataFlow::Render),
            "capture" => Some(DataFlow::Capture),
            "all" => Some(DataFlow::All),
            _ => None,
        }
    }
}

/// Endpoint availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    Active,
    Disabled,
    NotPresent,
    Unplugged,
}

impl DeviceState {
    pub fn as_word(self) -> &'static str {
        match self {
            DeviceState::Active => "active",
            DeviceState::Disabled => "disabled",
            DeviceState::NotPresent => "not-present",
            DeviceState::Unplugged => "unplugged",
        }
    }

    fn parse_word(word: &str) -> Option<Self> {
        match word {
            "active" => Some(DeviceState::Active),
            "disabled" => Some(DeviceState::Disabled),
            "not-present" => Some(DeviceState::NotPresent),
            "unplugged" => Some(DeviceState::Unplugged),
            _ => None,
        }
    }
}

/// Default-device role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Console,
    Multimedia,
    Communications,
}

impl Role {
    pub fn as_word(self) -> &'static str {
        match self {
            Role::Console => "console",
            Role::Multimedia => "multimedia",
            Role::Communications => "communications",
        }
    }

    fn parse_word(word: &str) -> Option<Self> {
        match word {
            "console" => Some(Role::Console),
            "multimedia" => Some(Role::Multimedia),
            "communications" => Some(Role::Communications),
            _ => None,
        }
    }
}

/// One audio endpoint as reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    pub id: String,
    pub friendly_name: String,
    pub flow: DataFlow,
    pub state: Vec<DeviceState>,
    pub sample_rate: u32,
    pub channels: u32,
    pub default_for: Vec<Role>,
}

impl Device {
    pub fn is_default_for(&self, role: Role) -> bool {
        self.default_for.contains(&role)
    }
}

/// Number of lines describing one device in `list` output
const LINES_PER_DEVICE: usize = 7;

/// Arguments for the worker's `list` command
pub fn list_arguments(flow: DataFlow, states: &[DeviceState]) -> Vec<String> {
    let mut args = vec!["list".to_string(), flow.as_word().to_string()];
    args.extend(states.iter().map(|state| state.as_word().to_string()));
    args
}

fn words<'a, T>(
    line: &'a str,
    parse: fn(&str) -> Option<T>,
) -> impl Iterator<Item = Result<T, WorkerError>> + 'a
where
    T: 'a,
{
    line.split_whitespace().map(move |word| {
        parse(word).ok_or_else(|| WorkerError::MalformedDeviceList(format!("unknown word {word:?}")))
    })
}

fn parse_number(line: &str) -> Result<u32, WorkerError> {
    line.trim()
        .parse()
        .map_err(|_| WorkerError::MalformedDeviceList(format!("expected a number, got {line:?}")))
}

fn parse_device(lines: &[&str]) -> Result<Device, WorkerError> {
    let flow_bits = words(lines[2], DataFlow::parse_word)
        .try_fold(0u32, |acc, flow| flow.map(|flow| acc | flow.bits()))?;
    let flow = DataFlow::from_bits(flow_bits)
        .ok_or_else(|| WorkerError::MalformedDeviceList(format!("no flow for {}", lines[0])))?;

    Ok(Device {
        id: lines[0].to_string(),
        friendly_name: lines[1].to_string(),
        flow,
        state: words(lines[3], DeviceState::parse_word).collect::<Result<_, _>>()?,
        sample_rate: parse_number(lines[4])?,
        channels: parse_number(lines[5])?,
        default_for: words(lines[6], Role::parse_word).collect::<Result<_, _>>()?,
    })
}

/// Parse `list` output: a line count per device, then one group per device
pub fn parse_device_list(output: &str) -> Result<Vec<Device>, WorkerError> {
    let lines: Vec<&str> = output.lines().map(|line| line.trim_end_matches('\r')).collect();
    let Some((header, body)) = lines.split_first() else {
        return Ok(Vec::new());
    };

    let per_device = parse_number(header)? as usize;
    if per_device < LINES_PER_DEVICE {
        return Err(WorkerError::MalformedDeviceList(format!(
            "{per_device} lines per device, need {LINES_PER_DEVICE}"
        )));
    }

    let groups = body.chunks_exact(per_device);
    let trailing = groups.remainder();
    if trailing.iter().any(|line| !line.is_empty()) {
        tracing::debug!(lines = trailing.len(), "Ignoring incomplete trailing device record");
    }
    groups.map(parse_device).collect()
}

/// Parts of an endpoint name: description, interface number, interface name
type NameParts = (String, u32, String);

fn parse_name(name: &str) -> Option<NameParts> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(.*) \((?:(\d+)-)?\s*(.*)\)$").ok())
        .as_ref()?;
    let captures = pattern.captures(name)?;
    Some((
        captures.get(1)?.as_str().to_string(),
        captures
            .get(2)
            .and_then(|number| number.as_str().parse().ok())
            .unwrap_or(0),
        captures.get(3)?.as_str().to_string(),
    ))
}

/// Find the device a setting refers to, tolerating renames and renumbering
pub fn resolve<'a>(
    devices: &'a [Device],
    id: &str,
    friendly_name: Option<&str>,
    flow: DataFlow,
) -> Option<&'a Device> {
    let candidates: Vec<&Device> = devices.iter().filter(|d| d.flow.intersects(flow)).collect();

    if let Some(device) = candidates.iter().copied().find(|d| d.id == id) {
        return Some(device);
    }

    let friendly_name = friendly_name?;
    if let Some(device) = candidates.iter().copied().find(|d| d.friendly_name == friendly_name) {
        return Some(device);
    }

    let (desc, number, interface) = parse_name(friendly_name)?;
    let parsed: Vec<(&Device, NameParts)> = candidates
        .iter()
        .filter_map(|device| parse_name(&device.friendly_name).map(|parts| (*device, parts)))
        .collect();

    parsed
        .iter()
        .find(|(_, (d, _, i))| *d == desc && *i == interface)
        .or_else(|| parsed.iter().find(|(_, (_, n, i))| *n == number && *i == interface))
        .or_else(|| parsed.iter().find(|(_, (_, _, i))| *i == interface))
        .map(|(device, _)| *device)
}

/// The device currently default for `role` in direction `flow`
pub fn default_device(devices: &[Device], flow: DataFlow, role: Role) -> Option<&Device> {
    devices
        .iter()
        .find(|d| d.flow == flow && d.is_default_for(role))
}
