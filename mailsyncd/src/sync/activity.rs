use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::session::now_unix;

pub const DEFAULT_LOOKBACK_SECS: i64 = 30;
pub const DEFAULT_WINDOW_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEntry {
    pub timestamp: i64,
    pub total_count: i64,
    pub delta: i64,
    pub interval_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub recent_change_count: i64,
    pub entries_in_window: usize,
    pub changes_per_minute: f64,
}

#[derive(Debug, Default)]
struct Window {
    baseline: Option<(i64, i64)>,
    entries: VecDeque<ActivityEntry>,
}

/// Sliding-window detector over total record counts.
///
/// Only positive increases are kept. The very first observation sets the
/// baseline and never counts as activity.
#[derive(Debug)]
pub struct ActivityTracker {
    lookback_secs: i64,
    capacity: usize,
    window: Mutex<Window>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK_SECS, DEFAULT_WINDOW_LEN)
    }
}

impl ActivityTracker {
    pub fn new(lookback_secs: i64, capacity: usize) -> Self {
        Self {
            lookback_secs,
            capacity: capacity.max(1),
            window: Mutex::new(Window::default()),
        }
    }

    pub fn observe(&self, total_count: i64) {
        self.observe_at(total_count, now_unix());
    }

    pub fn observe_at(&self, total_count: i64, at: i64) {
        let mut window = self.lock();
        let Some((prev_at, prev_count)) = window.baseline.replace((at, total_count)) else {
            return;
        };
        let delta = total_count - prev_count;
        if delta <= 0 {
            return;
        }
        if window.entries.len() == self.capacity {
            window.entries.pop_front();
        }
        window.entries.push_back(ActivityEntry {
            timestamp: at,
            total_count,
            delta,
            interval_secs: at.saturating_sub(prev_at).max(0),
        });
    }

    pub fn is_active(&self, now: i64) -> bool {
        let window = self.lock();
        window
            .entries
            .iter()
            .any(|entry| self.in_lookback(entry, now))
    }

    pub fn summarize(&self, now: i64) -> ActivitySummary {
        let window = self.lock();
        let (count, entries) = window
            .entries
            .iter()
            .filter(|entry| self.in_lookback(entry, now))
            .fold((0i64, 0usize), |(sum, n), entry| (sum + entry.delta, n + 1));
        let changes_per_minute = if self.lookback_secs > 0 {
            count as f64 * 60.0 / self.lookback_secs as f64
        } else {
            0.0
        };
        ActivitySummary {
            recent_change_count: count,
            entries_in_window: entries,
            changes_per_minute,
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.lock().entries.iter().copied().collect()
    }

    fn in_lookback(&self, entry: &ActivityEntry, now: i64) -> bool {
        now.saturating_sub(entry.timestamp) <= self.lookback_secs
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
