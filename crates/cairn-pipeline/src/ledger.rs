//! Resource ledger: run-wide step, depth, duration, and memory budgets.
//!
//! Exactly one ledger exists per supervised run. Every nesting level and every
//! concurrent branch holds the same `Arc<ResourceLedger>`, so the ceilings apply
//! to the whole call tree. Once any ceiling is crossed the ledger latches into
//! an exceeded state for the rest of the run.
//!
//! Depth is the depth of the call tree, not the number of live frames: sibling
//! fan-out branches running side by side all sit at the same depth.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use cairn_types::{Budget, CairnError, Result};

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,
    #[serde(default = "default_max_duration", with = "cairn_types::duration_serde")]
    pub max_duration: Duration,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
}

fn default_max_steps() -> u64 {
    200
}

fn default_max_depth() -> u64 {
    8
}

fn default_max_duration() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_depth: default_max_depth(),
            max_duration: default_max_duration(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

impl Budgets {
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u64) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_max_memory_bytes(mut self, max_memory_bytes: u64) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }
}

// ---------------------------------------------------------------------------
// ResourceLedger
// ---------------------------------------------------------------------------

const OPEN: u8 = 0;

fn encode(budget: Budget) -> u8 {
    match budget {
        Budget::Steps => 1,
        Budget::Depth => 2,
        Budget::Duration => 3,
        Budget::Memory => 4,
    }
}

fn decode(code: u8) -> Option<Budget> {
    match code {
        1 => Some(Budget::Steps),
        2 => Some(Budget::Depth),
        3 => Some(Budget::Duration),
        4 => Some(Budget::Memory),
        _ => None,
    }
}

#[derive(Debug)]
pub struct ResourceLedger {
    budgets: Budgets,
    steps_executed: AtomicU64,
    /// Live frames per depth; slot `d - 1` counts frames at depth `d`.
    /// Trailing empty slots are trimmed, so the length is the current depth.
    active_frames: Mutex<Vec<u64>>,
    current_depth: AtomicU64,
    peak_depth: AtomicU64,
    memory_estimate_bytes: AtomicU64,
    /// `OPEN`, or the encoded budget that tripped first.
    exceeded: AtomicU8,
    started_at: chrono::DateTime<chrono::Utc>,
    clock: Instant,
}

impl ResourceLedger {
    /// Only the supervisor creates ledgers, one per run.
    pub(crate) fn new(budgets: Budgets) -> Self {
        Self {
            budgets,
            steps_executed: AtomicU64::new(0),
            active_frames: Mutex::new(Vec::new()),
            current_depth: AtomicU64::new(0),
            peak_depth: AtomicU64::new(0),
            memory_estimate_bytes: AtomicU64::new(0),
            exceeded: AtomicU8::new(OPEN),
            started_at: chrono::Utc::now(),
            clock: Instant::now(),
        }
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    /// Count one more executed step.
    pub fn try_enter_step(&self) -> Result<()> {
        self.ensure_open()?;
        let max = self.budgets.max_steps;
        self.steps_executed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| self.trip(Budget::Steps))
    }

    /// Enter a frame one level below the deepest live frame and return its depth.
    ///
    /// Suits a single chain of levels. Concurrent branches know their own depth
    /// and use [`try_enter_nesting_at`](Self::try_enter_nesting_at).
    pub fn try_enter_nesting(&self) -> Result<u64> {
        self.ensure_open()?;
        let mut active = self.active_frames();
        let depth = active.len() as u64 + 1;
        self.enter_locked(&mut active, depth)?;
        Ok(depth)
    }

    /// Enter a frame at call-tree depth `depth` (the root level is depth 0).
    /// Fails if `depth` is past `max_depth`, however many frames are live.
    pub fn try_enter_nesting_at(&self, depth: u64) -> Result<()> {
        self.ensure_open()?;
        let mut active = self.active_frames();
        self.enter_locked(&mut active, depth)
    }

    /// Exit the deepest live frame.
    pub fn exit_nesting(&self) {
        let mut active = self.active_frames();
        let depth = active.len() as u64;
        self.exit_locked(&mut active, depth);
    }

    /// Exit one frame at `depth`. Exiting a depth with no live frame is a no-op.
    pub fn exit_nesting_at(&self, depth: u64) {
        let mut active = self.active_frames();
        self.exit_locked(&mut active, depth);
    }

    /// Enter a nesting level and get a guard that exits it on drop, on every path.
    pub fn enter_nesting(self: &Arc<Self>) -> Result<NestingGuard> {
        let depth = self.try_enter_nesting()?;
        Ok(NestingGuard {
            ledger: Arc::clone(self),
            depth,
        })
    }

    /// [`enter_nesting`](Self::enter_nesting) at a known depth.
    pub fn enter_nesting_at(self: &Arc<Self>, depth: u64) -> Result<NestingGuard> {
        self.try_enter_nesting_at(depth)?;
        Ok(NestingGuard {
            ledger: Arc::clone(self),
            depth,
        })
    }

    fn active_frames(&self) -> MutexGuard<'_, Vec<u64>> {
        self.active_frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter_locked(&self, active: &mut Vec<u64>, depth: u64) -> Result<()> {
        if depth > self.budgets.max_depth {
            return Err(self.trip(Budget::Depth));
        }
        let depth = depth.max(1);
        let slot = (depth - 1) as usize;
        if active.len() <= slot {
            active.resize(slot + 1, 0);
        }
        active[slot] += 1;
        self.current_depth.store(active.len() as u64, Ordering::Release);
        self.peak_depth.fetch_max(depth, Ordering::AcqRel);
        Ok(())
    }

    fn exit_locked(&self, active: &mut Vec<u64>, depth: u64) {
        if let Some(count) = depth
            .checked_sub(1)
            .and_then(|slot| active.get_mut(slot as usize))
        {
            *count = count.saturating_sub(1);
        }
        while active.last() == Some(&0) {
            active.pop();
        }
        self.current_depth.store(active.len() as u64, Ordering::Release);
    }

    /// Adjust the memory estimate by `delta_bytes` (negative to release).
    pub fn record_memory(&self, delta_bytes: i64) {
        let _ = self
            .memory_estimate_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                Some(if delta_bytes >= 0 {
                    m.saturating_add(delta_bytes as u64)
                } else {
                    m.saturating_sub(delta_bytes.unsigned_abs())
                })
            });
    }

    /// Advisory duration and memory check, run before and after every step.
    pub fn check_limits(&self) -> Result<()> {
        self.ensure_open()?;
        if self.elapsed() > self.budgets.max_duration {
            return Err(self.trip(Budget::Duration));
        }
        if self.memory_estimate_bytes.load(Ordering::Acquire) > self.budgets.max_memory_bytes {
            return Err(self.trip(Budget::Memory));
        }
        Ok(())
    }

    /// Fails if any ceiling has been crossed earlier in the run.
    pub fn ensure_open(&self) -> Result<()> {
        match self.exceeded_budget() {
            Some(which) => Err(CairnError::BudgetExceeded { which }),
            None => Ok(()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire) != OPEN
    }

    /// The budget that tripped first, if any.
    pub fn exceeded_budget(&self) -> Option<Budget> {
        decode(self.exceeded.load(Ordering::Acquire))
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Acquire)
    }

    pub fn current_depth(&self) -> u64 {
        self.current_depth.load(Ordering::Acquire)
    }

    pub fn peak_depth(&self) -> u64 {
        self.peak_depth.load(Ordering::Acquire)
    }

    pub fn memory_estimate_bytes(&self) -> u64 {
        self.memory_estimate_bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            steps_executed: self.steps_executed(),
            current_depth: self.current_depth(),
            peak_depth: self.peak_depth(),
            memory_estimate_bytes: self.memory_estimate_bytes(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            started_at: self.started_at,
            exceeded: self.exceeded_budget(),
            budgets: self.budgets,
        }
    }

    /// Latch the exceeded state. The first budget to trip is the one reported.
    fn trip(&self, which: Budget) -> CairnError {
        let _ = self
            .exceeded
            .compare_exchange(OPEN, encode(which), Ordering::AcqRel, Ordering::Acquire);
        let which = self.exceeded_budget().unwrap_or(which);
        tracing::warn!(budget = %which, "Run budget exceeded");
        CairnError::BudgetExceeded { which }
    }
}

/// Exits one nesting level when dropped.
#[derive(Debug)]
pub struct NestingGuard {
    ledger: Arc<ResourceLedger>,
    depth: u64,
}

impl NestingGuard {
    pub fn depth(&self) -> u64 {
        self.depth
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        self.ledger.exit_nesting_at(self.depth);
    }
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub steps_executed: u64,
    pub current_depth: u64,
    pub peak_depth: u64,
    pub memory_estimate_bytes: u64,
    pub elapsed_ms: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub exceeded: Option<Budget>,
    pub budgets: Budgets,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(budgets: Budgets) -> Arc<ResourceLedger> {
        Arc::new(ResourceLedger::new(budgets))
    }

    #[test]
    fn steps_fail_past_ceiling() {
        let l = ledger(Budgets::default().with_max_steps(2));
        assert!(l.try_enter_step().is_ok());
        assert!(l.try_enter_step().is_ok());
        let err = l.try_enter_step().unwrap_err();
        assert_eq!(err.budget(), Some(Budget::Steps));
        assert_eq!(l.steps_executed(), 2);
        assert!(l.is_exceeded());
    }

    #[test]
    fn depth_fails_past_ceiling_and_exits_restore() {
        let l = ledger(Budgets::default().with_max_depth(2));
        l.try_enter_nesting().unwrap();
        l.try_enter_nesting().unwrap();
        assert_eq!(l.current_depth(), 2);
        let err = l.try_enter_nesting().unwrap_err();
        assert_eq!(err.budget(), Some(Budget::Depth));
        assert_eq!(l.current_depth(), 2);
        l.exit_nesting();
        l.exit_nesting();
        assert_eq!(l.current_depth(), 0);
        assert_eq!(l.peak_depth(), 2);
    }

    #[test]
    fn exit_nesting_never_underflows() {
        let l = ledger(Budgets::default());
        l.exit_nesting();
        assert_eq!(l.current_depth(), 0);
    }

    #[test]
    fn exceeded_state_is_permanent_and_blocks_everything() {
        let l = ledger(Budgets::default().with_max_depth(0));
        assert!(l.try_enter_nesting().is_err());
        // Steps budget is untouched, yet every entry now fails with the original budget.
        let err = l.try_enter_step().unwrap_err();
        assert_eq!(err.budget(), Some(Budget::Depth));
        assert_eq!(l.check_limits().unwrap_err().budget(), Some(Budget::Depth));
        assert_eq!(l.exceeded_budget(), Some(Budget::Depth));
        assert_eq!(l.steps_executed(), 0);
    }

    #[test]
    fn first_tripped_budget_wins() {
        let l = ledger(Budgets::default().with_max_steps(0).with_max_depth(0));
        assert!(l.try_enter_step().is_err());
        assert_eq!(l.try_enter_nesting().unwrap_err().budget(), Some(Budget::Steps));
    }

    #[test]
    fn nesting_guard_exits_on_drop() {
        let l = ledger(Budgets::default().with_max_depth(1));
        {
            let _guard = l.enter_nesting().unwrap();
            assert_eq!(l.current_depth(), 1);
        }
        assert_eq!(l.current_depth(), 0);
        let guard = l.enter_nesting().unwrap();
        drop(guard);
        assert!(l.enter_nesting().is_ok());
    }

    #[test]
    fn sibling_frames_share_one_depth() {
        let l = ledger(Budgets::default().with_max_depth(1));
        let branches: Vec<_> = (0..3).map(|_| l.enter_nesting_at(1).unwrap()).collect();
        assert_eq!(l.current_depth(), 1);
        assert_eq!(l.peak_depth(), 1);
        assert!(!l.is_exceeded());

        let err = l.try_enter_nesting_at(2).unwrap_err();
        assert_eq!(err.budget(), Some(Budget::Depth));
        drop(branches);
        assert_eq!(l.current_depth(), 0);
    }

    #[test]
    fn current_depth_tracks_deepest_live_frame() {
        let l = ledger(Budgets::default());
        let shallow = l.enter_nesting_at(1).unwrap();
        let deep = l.enter_nesting_at(2).unwrap();
        let sibling = l.enter_nesting_at(1).unwrap();
        assert_eq!(l.current_depth(), 2);
        drop(deep);
        assert_eq!(l.current_depth(), 1);
        drop(shallow);
        assert_eq!(l.current_depth(), 1, "a sibling at depth 1 is still live");
        assert_eq!(sibling.depth(), 1);
        drop(sibling);
        assert_eq!(l.current_depth(), 0);
        assert_eq!(l.peak_depth(), 2);
    }

    #[test]
    fn memory_over_ceiling_trips_on_check() {
        let l = ledger(Budgets::default().with_max_memory_bytes(100));
        l.record_memory(60);
        assert!(l.check_limits().is_ok());
        l.record_memory(60);
        assert_eq!(l.check_limits().unwrap_err().budget(), Some(Budget::Memory));
        // Releasing memory does not reopen the ledger.
        l.record_memory(-120);
        assert_eq!(l.memory_estimate_bytes(), 0);
        assert!(l.check_limits().is_err());
    }

    #[test]
    fn memory_release_saturates_at_zero() {
        let l = ledger(Budgets::default());
        l.record_memory(10);
        l.record_memory(-50);
        assert_eq!(l.memory_estimate_bytes(), 0);
    }

    #[test]
    fn duration_over_ceiling_trips_on_check() {
        let l = ledger(Budgets::default().with_max_duration(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(l.check_limits().unwrap_err().budget(), Some(Budget::Duration));
        assert!(l.try_enter_step().is_err());
    }

    #[test]
    fn concurrent_steps_admit_exactly_the_ceiling() {
        let l = ledger(Budgets::default().with_max_steps(100));
        let admitted = std::sync::atomic::AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if l.try_enter_step().is_ok() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::SeqCst), 100);
        assert_eq!(l.steps_executed(), 100);
        assert_eq!(l.exceeded_budget(), Some(Budget::Steps));
    }

    #[test]
    fn budgets_deserialize_with_defaults() {
        let b: Budgets = serde_json::from_str(r#"{"max_steps": 5, "max_duration": "2m"}"#).unwrap();
        assert_eq!(b.max_steps, 5);
        assert_eq!(b.max_depth, 8);
        assert_eq!(b.max_duration, Duration::from_secs(120));
        assert_eq!(b.max_memory_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn snapshot_reports_counters() {
        let l = ledger(Budgets::default());
        l.try_enter_step().unwrap();
        let _g = l.enter_nesting().unwrap();
        l.record_memory(42);
        let snap = l.snapshot();
        assert_eq!(snap.steps_executed, 1);
        assert_eq!(snap.current_depth, 1);
        assert_eq!(snap.peak_depth, 1);
        assert_eq!(snap.memory_estimate_bytes, 42);
        assert_eq!(snap.exceeded, None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn depth_never_exceeds_ceiling(
                max_depth in 0u64..6,
                ops in proptest::collection::vec(any::<bool>(), 0..64),
            ) {
                let l = ledger(Budgets::default().with_max_depth(max_depth));
                let mut guards = Vec::new();
                for enter in ops {
                    if enter {
                        if let Ok(g) = l.enter_nesting() {
                            guards.push(g);
                        }
                    } else {
                        guards.pop();
                    }
                    prop_assert!(l.current_depth() <= max_depth);
                    prop_assert_eq!(l.current_depth(), guards.len() as u64);
                }
                drop(guards);
                prop_assert_eq!(l.current_depth(), 0);
            }
        }
    }
}
