//! Shared Control Block poller
//!
//! Worker processes write metering and tap data whenever they like, so the
//! controller samples every block on a short fixed period from a dedicated
//! thread. Only samples that differ from the previous one are forwarded,
//! together with any tap bytes read for sessions that have subscribers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::SessionId;
use crate::shm::{ControlBlock, ControlSnapshot, TapReader};

struct PollEntry {
    control: Arc<ControlBlock>,
    tap: Option<TapReader>,
    last: Option<ControlSnapshot>,
}

/// What one poll pass found
#[derive(Debug, Default)]
pub struct PollBatch {
    pub samples: Vec<(SessionId, ControlSnapshot)>,
    pub taps: Vec<(SessionId, Bytes)>,
}

impl PollBatch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.taps.is_empty()
    }
}

/// Blocks to poll, shared between the control-plane loop and the poll thread
#[derive(Clone, Default)]
pub struct PollSet {
    entries: Arc<DashMap<SessionId, PollEntry>>,
}

impl PollSet {
    pub fn insert(&self, id: SessionId, control: Arc<ControlBlock>) {
        self.entries.insert(
            id,
            PollEntry {
                control,
                tap: None,
                last: None,
            },
        );
    }

    pub fn remove(&self, id: SessionId) {
        self.entries.remove(&id);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Start or stop reading a session's tap; a new reader starts caught up
    pub fn set_tap(&self, id: SessionId, active: bool) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            match (active, entry.tap.is_some()) {
                (true, false) => entry.tap = Some(entry.control.open_tap_stream()),
                (false, true) => entry.tap = None,
                _ => {}
            }
        }
    }

    pub fn tap_active(&self, id: SessionId) -> bool {
        self.entries.get(&id).is_some_and(|entry| entry.tap.is_some())
    }

    /// Sample every block once
    pub fn poll(&self) -> PollBatch {
        let mut batch = PollBatch::default();
        for mut entry in self.entries.iter_mut() {
            let id = *entry.key();
            let entry = entry.value_mut();

            let snapshot = entry.control.snapshot();
            if entry.last != Some(snapshot) {
                entry.last = Some(snapshot);
                batch.samples.push((id, snapshot));
            }

            if let Some(data) = entry.tap.as_mut().and_then(TapReader::read_available) {
                batch.taps.push((id, data));
            }
        }
        batch
    }
}

/// Handle to the poll thread; dropping it stops the thread
pub struct Poller {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    /// Poll `set` every `period`, sending non-empty batches to `out`
    pub fn spawn(
        set: PollSet,
        period: Duration,
        out: mpsc::UnboundedSender<PollBatch>,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("shm-poller".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let batch = set.poll();
                if !batch.is_empty() && out.send(batch).is_err() {
                    break;
                }
            })?;

        tracing::debug!(?period, "Shared memory poller started");
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
