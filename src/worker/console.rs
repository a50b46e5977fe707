//! Bounded per-session log of worker output

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;

/// Recent worker stderr lines and lifecycle messages, newest last
#[derive(Clone)]
pub struct Console {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Append a line verbatim, evicting the oldest when full
    pub fn log(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Append `[HH:MM:SS] message`; blank messages are dropped
    pub fn log_timestamped(&self, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        self.log(format!("[{}] {}", Local::now().format("%H:%M:%S"), message));
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("lines", &self.lines.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let console = Console::new(2);
        console.log("a");
        console.log("b");
        console.log("c");
        assert_eq!(console.lines(), vec!["b", "c"]);
    }

    #[test]
    fn test_timestamped_skips_blank() {
        let console = Console::new(4);
        console.log_timestamped("   ");
        console.log_timestamped(" device lost \r");
        let lines = console.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] device lost"));
        assert_eq!(lines[0].len(), "[00:00:00] device lost".len());
    }
}
