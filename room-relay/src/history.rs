//! Chat history collaborator.
//!
//! The relay only appends and reads through [`HistoryStore`]; how lines are
//! stored or paginated is up to the implementation. [`MemoryHistory`] keeps a
//! bounded ring per room and is what the server uses by default.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

/// Storage for per-room chat lines.
///
/// Indices are absolute: the first line ever appended to a room is index 0,
/// and indices keep growing even after old lines are evicted.
pub trait HistoryStore: Send + Sync + 'static {
    fn append(&self, room: &str, line: &str);

    /// The last `count` lines of `room`, oldest first.
    fn read_tail(&self, room: &str, count: usize) -> Vec<String>;

    /// Up to `count` lines strictly before `before_index`, oldest first.
    fn read_before(&self, room: &str, before_index: usize, count: usize) -> Vec<String>;
}

#[derive(Debug, Default)]
struct RoomLog {
    /// Absolute index of `lines[0]`.
    first_index: usize,
    lines: VecDeque<String>,
}

#[derive(Debug)]
pub struct MemoryHistory {
    capacity: usize,
    rooms: Mutex<HashMap<String, RoomLog>>,
}

impl MemoryHistory {
    /// A capacity of zero disables recording entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Total number of lines ever appended to `room`.
    pub fn next_index(&self, room: &str) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .get(room)
            .map(|log| log.first_index + log.lines.len())
            .unwrap_or(0)
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, room: &str, line: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let log = rooms.entry(room.to_string()).or_default();
        if log.lines.len() == self.capacity {
            log.lines.pop_front();
            log.first_index += 1;
        }
        log.lines.push_back(line.to_string());
    }

    fn read_tail(&self, room: &str, count: usize) -> Vec<String> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(log) = rooms.get(room) else {
            return Vec::new();
        };
        let skip = log.lines.len().saturating_sub(count);
        log.lines.iter().skip(skip).cloned().collect()
    }

    fn read_before(&self, room: &str, before_index: usize, count: usize) -> Vec<String> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(log) = rooms.get(room) else {
            return Vec::new();
        };
        let end = before_index
            .saturating_sub(log.first_index)
            .min(log.lines.len());
        let start = end.saturating_sub(count);
        log.lines.range(start..end).cloned().collect()
    }
}
