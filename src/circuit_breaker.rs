//! Circuit breaker (C11) — per-worker CLOSED/OPEN/HALF_OPEN gate suppressing
//! task assignment after repeated failures (§4.5.8).
//!
//! Structurally the same consecutive-failure/cooldown shape as a model
//! router's circuit breaker (keyed there by model id, here by worker id),
//! extended with single-probe-in-flight gating: the first `can_accept_task`
//! call after cooldown flips the circuit to `HalfOpen` and hands out exactly
//! one probe task id, and no further task is accepted until that probe
//! resolves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct WorkerCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
    /// The in-flight probe task id while `HalfOpen`; `None` once resolved.
    probe_task_id: Option<String>,
}

impl Default for WorkerCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            tripped_at: None,
            probe_task_id: None,
        }
    }
}

/// One breaker per worker; resetting a worker's circuit never affects
/// another worker's.
pub struct CircuitBreakerRegistry {
    circuits: HashMap<u32, WorkerCircuit>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown_seconds: u64) -> Self {
        Self {
            circuits: HashMap::new(),
            failure_threshold,
            cooldown: Duration::from_secs(cooldown_seconds),
        }
    }

    fn entry(&mut self, worker_id: u32) -> &mut WorkerCircuit {
        self.circuits.entry(worker_id).or_default()
    }

    /// Whether `worker_id` may be dispatched `task_id`. Transitions
    /// `Open → HalfOpen` when the cooldown has elapsed, granting exactly one
    /// probe; repeated calls while a probe is outstanding return `false`.
    pub fn can_accept_task(&mut self, worker_id: u32, task_id: &str) -> bool {
        let cooldown = self.cooldown;
        let circuit = self.entry(worker_id);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false, // probe already outstanding
            CircuitState::Open => {
                let elapsed = circuit.tripped_at.map(|t| t.elapsed() >= cooldown).unwrap_or(false);
                if elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_task_id = Some(task_id.to_string());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a task success for `worker_id`: resets the consecutive-failure
    /// counter; if this was the outstanding probe, closes the circuit.
    pub fn record_success(&mut self, worker_id: u32, task_id: &str) {
        let circuit = self.entry(worker_id);
        circuit.consecutive_failures = 0;
        if circuit.state == CircuitState::HalfOpen && circuit.probe_task_id.as_deref() == Some(task_id) {
            circuit.state = CircuitState::Closed;
            circuit.tripped_at = None;
        }
        circuit.probe_task_id = None;
    }

    /// Record a task failure for `worker_id`. In `HalfOpen`, a probe failure
    /// re-opens the circuit and restarts the cooldown. In `Closed`, trips to
    /// `Open` once `failure_threshold` consecutive failures accumulate.
    pub fn record_failure(&mut self, worker_id: u32, task_id: &str) {
        let threshold = self.failure_threshold;
        let circuit = self.entry(worker_id);
        match circuit.state {
            CircuitState::HalfOpen if circuit.probe_task_id.as_deref() == Some(task_id) => {
                circuit.state = CircuitState::Open;
                circuit.tripped_at = Some(Instant::now());
                circuit.probe_task_id = None;
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed | CircuitState::Open => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= threshold {
                    circuit.state = CircuitState::Open;
                    circuit.tripped_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn state(&self, worker_id: u32) -> CircuitState {
        self.circuits.get(&worker_id).map(|c| c.state).unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&mut self, worker_id: u32) {
        self.circuits.remove(&worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_exact_consecutive_threshold() {
        let mut reg = CircuitBreakerRegistry::new(3, 60);
        reg.record_failure(1, "t1");
        reg.record_failure(1, "t2");
        assert_eq!(reg.state(1), CircuitState::Closed);
        reg.record_failure(1, "t3");
        assert_eq!(reg.state(1), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_counter() {
        let mut reg = CircuitBreakerRegistry::new(3, 60);
        reg.record_failure(1, "t1");
        reg.record_failure(1, "t2");
        reg.record_success(1, "t2");
        reg.record_failure(1, "t3");
        assert_eq!(reg.state(1), CircuitState::Closed);
    }

    #[test]
    fn open_blocks_until_cooldown_elapses() {
        let mut reg = CircuitBreakerRegistry::new(1, 0);
        reg.record_failure(1, "t1");
        assert_eq!(reg.state(1), CircuitState::Open);
        // cooldown of 0 elapses immediately
        assert!(reg.can_accept_task(1, "t2"));
        assert_eq!(reg.state(1), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_grants_exactly_one_probe() {
        let mut reg = CircuitBreakerRegistry::new(1, 0);
        reg.record_failure(1, "t1");
        assert!(reg.can_accept_task(1, "probe"));
        assert!(!reg.can_accept_task(1, "another"));
    }

    #[test]
    fn probe_success_closes_circuit() {
        let mut reg = CircuitBreakerRegistry::new(1, 0);
        reg.record_failure(1, "t1");
        reg.can_accept_task(1, "probe");
        reg.record_success(1, "probe");
        assert_eq!(reg.state(1), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_reopens_circuit() {
        let mut reg = CircuitBreakerRegistry::new(1, 0);
        reg.record_failure(1, "t1");
        reg.can_accept_task(1, "probe");
        reg.record_failure(1, "probe");
        assert_eq!(reg.state(1), CircuitState::Open);
    }

    #[test]
    fn independent_workers_have_independent_circuits() {
        let mut reg = CircuitBreakerRegistry::new(1, 9999);
        reg.record_failure(1, "t1");
        assert_eq!(reg.state(1), CircuitState::Open);
        assert_eq!(reg.state(2), CircuitState::Closed);
        reg.reset(1);
        assert_eq!(reg.state(1), CircuitState::Closed);
    }
}
