//! Backpressure controller (C12) — per-level sliding-window failure rate
//! that pauses a level when failures exceed a threshold (§4.5.9).
//!
//! Adapted from `resilience.rs`'s consecutive-failure tracking for tools,
//! but structurally different: this is a bounded sliding window of outcome
//! booleans rather than a consecutive-run counter, matching the spec's law
//! that the *last N* outcomes determine the verdict, not a running streak.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct LevelWindow {
    window_size: usize,
    outcomes: VecDeque<bool>,
    paused: bool,
}

impl LevelWindow {
    fn new(window_size: usize) -> Self {
        Self {
            window_size,
            outcomes: VecDeque::with_capacity(window_size),
            paused: false,
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.window_size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|o| !**o).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// Per-level bounded sliding window of task outcomes, pausing dispatch once
/// the observed failure rate crosses a threshold. When `enabled=false` every
/// operation is a no-op and no per-level state is ever allocated.
pub struct BackpressureController {
    enabled: bool,
    window_size: usize,
    failure_rate_threshold: f64,
    min_samples: usize,
    levels: HashMap<u32, LevelWindow>,
}

impl BackpressureController {
    pub fn new(enabled: bool, window_size: usize, failure_rate_threshold: f64, min_samples: usize) -> Self {
        Self {
            enabled,
            window_size,
            failure_rate_threshold,
            min_samples,
            levels: HashMap::new(),
        }
    }

    /// Register a level with an expected task count (currently informational
    /// only — the window size is fixed by configuration, not per-level).
    pub fn register_level(&mut self, level: u32, _expected_task_count: usize) {
        if !self.enabled {
            return;
        }
        self.levels.entry(level).or_insert_with(|| LevelWindow::new(self.window_size));
    }

    pub fn record_outcome(&mut self, level: u32, success: bool) {
        if !self.enabled {
            return;
        }
        let window_size = self.window_size;
        let threshold = self.failure_rate_threshold;
        let min_samples = self.min_samples;
        let window = self.levels.entry(level).or_insert_with(|| LevelWindow::new(window_size));
        window.record(success);
        // The verdict is recomputed from the *current* window on every
        // outcome, not latched — once enough of the window's failures slide
        // out, the level un-pauses on its own without needing `resume()`.
        if window.outcomes.len() >= min_samples {
            window.paused = window.failure_rate() >= threshold;
        }
    }

    pub fn is_paused(&self, level: u32) -> bool {
        if !self.enabled {
            return false;
        }
        self.levels.get(&level).map(|w| w.paused).unwrap_or(false)
    }

    /// Clear the window and paused flag for `level` (called on resume).
    pub fn resume(&mut self, level: u32) {
        if let Some(window) = self.levels.get_mut(&level) {
            window.outcomes.clear();
            window.paused = false;
        }
    }
}
