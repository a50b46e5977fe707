//! Seam between the registry and real worker processes
//!
//! The registry only talks to a [`WorkerDriver`]: it asks for a supervised
//! worker per valid session and for the current device list. Tests swap in
//! a driver that records launches instead of spawning processes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::args::CaptureParameters;
use super::console::Console;
use super::supervisor::{StartingHook, StopMode, Supervisor, SupervisorConfig, SupervisorState};
use crate::audio::device::{list_arguments, parse_device_list, DataFlow, Device, DeviceState};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::session::SessionId;
use crate::shm::ControlBlock;

/// Everything needed to launch one session's worker
pub struct LaunchRequest {
    pub session: SessionId,
    pub params: CaptureParameters,
    pub control: Arc<ControlBlock>,
    pub console: Console,
}

/// A launched, supervised worker
pub trait WorkerHandle: Send {
    /// Kill and start again immediately with new parameters
    fn restart(&mut self, params: CaptureParameters);

    /// Stop in the background; the returned task ends once the worker is gone
    fn shutdown(self: Box<Self>, mode: StopMode) -> Option<JoinHandle<()>>;

    fn state(&self) -> SupervisorState;
}

/// Launches workers and enumerates devices
pub trait WorkerDriver: Send + Sync {
    fn launch(&self, request: LaunchRequest) -> Box<dyn WorkerHandle>;

    fn list_devices(&self) -> BoxFuture<'static, Result<Vec<Device>, WorkerError>>;
}

impl WorkerHandle for Supervisor {
    fn restart(&mut self, params: CaptureParameters) {
        Supervisor::restart(self, Some(params));
    }

    fn shutdown(self: Box<Self>, mode: StopMode) -> Option<JoinHandle<()>> {
        Supervisor::shutdown(*self, mode)
    }

    fn state(&self) -> SupervisorState {
        Supervisor::state(self)
    }
}

/// Driver that runs the configured worker executable
pub struct ProcessDriver {
    config: WorkerConfig,
    on_starting: Option<StartingHook>,
}

impl ProcessDriver {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            on_starting: None,
        }
    }

    /// Called with the session id before every worker start attempt
    pub fn with_starting_hook(mut self, hook: StartingHook) -> Self {
        self.on_starting = Some(hook);
        self
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            program: self.config.executable.clone(),
            leading_args: self.config.arguments.clone(),
            restart_delay: Duration::from_millis(self.config.restart_delay_ms),
            graceful_timeout: Duration::from_millis(self.config.graceful_stop_timeout_ms),
        }
    }
}

impl WorkerDriver for ProcessDriver {
    fn launch(&self, mut request: LaunchRequest) -> Box<dyn WorkerHandle> {
        if request.params.lifetime.is_none() {
            request.params.lifetime = self.config.lifetime_handle;
        }
        Box::new(Supervisor::start(
            request.session,
            self.supervisor_config(),
            request.params,
            request.control,
            request.console,
            self.on_starting.clone(),
        ))
    }

    fn list_devices(&self) -> BoxFuture<'static, Result<Vec<Device>, WorkerError>> {
        let program = self.config.executable.clone();
        let leading_args = self.config.arguments.clone();
        let attempts = self.config.device_list_retries.max(1);
        Box::pin(async move {
            let args = list_arguments(DataFlow::All, &[DeviceState::Active]);
            for attempt in 1..=attempts {
                let output = Command::new(&program)
                    .args(&leading_args)
                    .args(&args)
                    .output()
                    .await
                    .map_err(|source| WorkerError::Spawn {
                        program: program.display().to_string(),
                        source,
                    })?;

                let stdout = String::from_utf8_lossy(&output.stdout);
                if !stdout.trim().is_empty() {
                    return parse_device_list(&stdout);
                }
                tracing::debug!(attempt, "Device list came back empty");
            }
            Err(WorkerError::EmptyDeviceList(attempts))
        })
    }
}

/// Driver that records what the registry asks of it
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// One call observed by the fake driver
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum WorkerEvent {
        Launch(SessionId, CaptureParameters),
        Restart(SessionId, CaptureParameters),
        Shutdown(SessionId, StopMode),
    }

    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub events: Arc<Mutex<Vec<WorkerEvent>>>,
        pub devices: Mutex<Vec<Device>>,
    }

    impl FakeDriver {
        pub fn with_devices(devices: Vec<Device>) -> Self {
            Self {
                events: Arc::default(),
                devices: Mutex::new(devices),
            }
        }

        pub fn events(&self) -> Vec<WorkerEvent> {
            self.events.lock().clone()
        }

        pub fn launches(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, WorkerEvent::Launch(..)))
                .count()
        }

        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    struct FakeHandle {
        session: SessionId,
        events: Arc<Mutex<Vec<WorkerEvent>>>,
    }

    impl WorkerHandle for FakeHandle {
        fn restart(&mut self, params: CaptureParameters) {
            self.events.lock().push(WorkerEvent::Restart(self.session, params));
        }

        fn shutdown(self: Box<Self>, mode: StopMode) -> Option<JoinHandle<()>> {
            self.events.lock().push(WorkerEvent::Shutdown(self.session, mode));
            None
        }

        fn state(&self) -> SupervisorState {
            SupervisorState::Running { pid: None }
        }
    }

    impl WorkerDriver for FakeDriver {
        fn launch(&self, request: LaunchRequest) -> Box<dyn WorkerHandle> {
            self.events
                .lock()
                .push(WorkerEvent::Launch(request.session, request.params));
            Box::new(FakeHandle {
                session: request.session,
                events: Arc::clone(&self.events),
            })
        }

        fn list_devices(&self) -> BoxFuture<'static, Result<Vec<Device>, WorkerError>> {
            let devices = self.devices.lock().clone();
            Box::pin(async move { Ok(devices) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell_driver(script: &str) -> ProcessDriver {
        ProcessDriver::new(WorkerConfig {
            executable: PathBuf::from("sh"),
            arguments: vec!["-c".to_string(), script.to_string()],
            device_list_retries: 2,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_list_devices_parses_helper_output() {
        let driver = shell_driver(
            "printf '7\\nid-1\\nSpeakers (USB)\\nrender\\nactive\\n48000\\n3\\nconsole\\n'",
        );
        let devices = driver.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "id-1");
        assert!(devices[0].is_default_for(crate::audio::device::Role::Console));
    }

    #[tokio::test]
    async fn test_list_devices_gives_up_on_silence() {
        let driver = shell_driver("true");
        let err = driver.list_devices().await.unwrap_err();
        assert!(matches!(err, WorkerError::EmptyDeviceList(2)));
    }
}
