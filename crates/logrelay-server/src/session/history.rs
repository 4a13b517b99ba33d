//! Bounded line history for late-joining inspectors.
//!
//! Stores the last N raw device lines so that an inspector attaching after the
//! handshake can be sent a snapshot without the relay keeping unbounded history.

use std::collections::VecDeque;

/// A fixed-capacity FIFO of log lines.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create a new history holding at most `capacity` lines. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest one if full.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// All buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
