//! Capture worker command line

use std::time::Duration;

use crate::audio::device::{DataFlow, Role};

/// Where the worker captures from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// A specific endpoint
    Device { id: String },
    /// Whatever endpoint is default for the flow and role
    Default { flow: DataFlow, role: Role },
}

/// Local playback sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSinkSpec {
    Device { id: String },
    Default { role: Role },
}

/// Network sink addresses after merging root defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSinkSpec {
    pub bind_address: Option<String>,
    pub peer_address: Option<String>,
    pub peer_service: Option<String>,
}

/// Everything the worker needs to run one capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParameters {
    /// Controller handle the worker watches so it exits with us
    pub lifetime: Option<u32>,
    pub source: SourceSpec,
    /// Shared Control Block name
    pub shm_name: Option<String>,
    pub shm_tap: bool,
    pub shm_averaging: bool,
    pub sample_rate: Option<u32>,
    pub channel_mask: u32,
    pub network_sink: Option<NetworkSinkSpec>,
    pub local_sink: Option<LocalSinkSpec>,
    pub duration: Option<Duration>,
}

impl CaptureParameters {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            lifetime: None,
            source,
            shm_name: None,
            shm_tap: true,
            shm_averaging: true,
            sample_rate: None,
            channel_mask: 0,
            network_sink: None,
            local_sink: None,
            duration: None,
        }
    }

    /// Argument vector, starting with the `capture` verb
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["capture".to_string()];
        let mut push = |words: &[&str]| args.extend(words.iter().map(|w| w.to_string()));

        if let Some(handle) = self.lifetime {
            push(&["lifetime", &handle.to_string()]);
        }

        match &self.source {
            SourceSpec::Device { id } => push(&["from-was-dev", id]),
            SourceSpec::Default { flow, role }
                if *flow != DataFlow::Render || *role != Role::Console =>
            {
                push(&["from-was", flow.as_word(), role.as_word()])
            }
            SourceSpec::Default { .. } => {}
        }

        if let Some(name) = &self.shm_name {
            push(&["shm", name]);
            if !self.shm_tap {
                push(&["no-shm-tap"]);
            }
            if !self.shm_averaging {
                push(&["no-shm-averaging"]);
            }
        }

        if let Some(rate) = self.sample_rate {
            push(&["samplerate", &rate.to_string()]);
        }
        if self.channel_mask != 0 {
            push(&["channel-mask", &self.channel_mask.to_string()]);
        }

        if let Some(sink) = &self.network_sink {
            let non_empty = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
            if let Some(bind) = sink.bind_address.as_deref().filter(|b| !b.is_empty()) {
                push(&["bind", bind]);
            }
            if non_empty(&sink.peer_address) || non_empty(&sink.peer_service) {
                push(&[
                    "to-network-peer",
                    sink.peer_address.as_deref().unwrap_or(""),
                    sink.peer_service.as_deref().unwrap_or(""),
                ]);
            } else {
                push(&["to-network"]);
            }
        }

        match &self.local_sink {
            Some(LocalSinkSpec::Device { id }) => push(&["to-was-dev", id]),
            Some(LocalSinkSpec::Default { role }) => push(&["to-was", role.as_word()]),
            None => {}
        }

        if let Some(duration) = self.duration {
            push(&["duration", &duration.as_secs_f64().to_string()]);
        }

        args
    }

    /// Shell-quoted rendering, for logs and diagnostics
    pub fn command_line(&self) -> String {
        shell_words::join(self.to_args())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_source_is_implicit() {
        let mut params = CaptureParameters::new(SourceSpec::Default {
            flow: DataFlow::Render,
            role: Role::Console,
        });
        params.shm_name = Some("capture-control-1".to_string());
        assert_eq!(params.to_args(), vec!["capture", "shm", "capture-control-1"]);
    }

    #[test]
    fn test_full_command_line() {
        let mut params = CaptureParameters::new(SourceSpec::Device {
            id: "{0.0.1}.{a b}".to_string(),
        });
        params.lifetime = Some(42);
        params.shm_name = Some("shm-1".to_string());
        params.shm_averaging = false;
        params.sample_rate = Some(48000);
        params.channel_mask = 3;
        params.network_sink = Some(NetworkSinkSpec {
            bind_address: Some("0.0.0.0".to_string()),
            peer_address: Some("10.0.0.2".to_string()),
            peer_service: None,
        });
        params.local_sink = Some(LocalSinkSpec::Default { role: Role::Multimedia });
        params.duration = Some(Duration::from_secs(90));

        assert_eq!(
            params.command_line(),
            "capture lifetime 42 from-was-dev '{0.0.1}.{a b}' shm shm-1 no-shm-averaging \
             samplerate 48000 channel-mask 3 bind 0.0.0.0 to-network-peer 10.0.0.2 '' \
             to-was multimedia duration 90"
        );
    }

    #[test]
    fn test_network_sink_without_peer() {
        let mut params = CaptureParameters::new(SourceSpec::Default {
            flow: DataFlow::Capture,
            role: Role::Communications,
        });
        params.network_sink = Some(NetworkSinkSpec::default());
        assert_eq!(
            params.to_args(),
            vec!["capture", "from-was", "capture", "communications", "to-network"]
        );
    }
}
