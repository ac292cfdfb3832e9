//! Port allocator (C2) — hand out non-overlapping TCP port ranges to workers
//! from a configured interval.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port range [{start}, {end}] exhausted: {in_use} workers already allocated")]
    RangeExhausted { start: u16, end: u16, in_use: usize },
}

/// Allocates one port per worker out of `[range_start, range_end]`, in order,
/// and releases them back to the free list on worker termination.
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    allocated: HashMap<u32, u16>,
    in_use: std::collections::HashSet<u16>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start,
            range_end,
            allocated: HashMap::new(),
            in_use: std::collections::HashSet::new(),
        }
    }

    /// Allocate the next free port in range for `worker_id`. Idempotent: a
    /// worker that already holds a port gets the same one back.
    pub fn allocate_one(&mut self, worker_id: u32) -> Result<u16, PortError> {
        if let Some(&port) = self.allocated.get(&worker_id) {
            return Ok(port);
        }
        for port in self.range_start..=self.range_end {
            if !self.in_use.contains(&port) {
                self.in_use.insert(port);
                self.allocated.insert(worker_id, port);
                return Ok(port);
            }
        }
        Err(PortError::RangeExhausted {
            start: self.range_start,
            end: self.range_end,
            in_use: self.in_use.len(),
        })
    }

    /// Reserve a specific port for `worker_id` directly, bypassing the
    /// free-list scan. Used when resuming a worker whose port was recorded
    /// in a prior run's state document.
    pub fn reserve(&mut self, worker_id: u32, port: u16) {
        self.in_use.insert(port);
        self.allocated.insert(worker_id, port);
    }

    pub fn release(&mut self, worker_id: u32) {
        if let Some(port) = self.allocated.remove(&worker_id) {
            self.in_use.remove(&port);
        }
    }

    pub fn release_all(&mut self) {
        self.allocated.clear();
        self.in_use.clear();
    }

    pub fn port_for(&self, worker_id: u32) -> Option<u16> {
        self.allocated.get(&worker_id).copied()
    }
}
