use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
    CreateRecord = 0,
    ReadRecord = 1,
    UpdateRecord = 2,
    DeleteRecord = 3,
}

const OP_COUNT: usize = 4;

/// Per-session counters and wall-clock timers for the CRUD paths. The
/// timer guard records on drop, so the bracketing holds on every exit
/// path including errors.
#[derive(Default)]
pub struct SessionStats {
    counts: [AtomicU64; OP_COUNT],
    nanos: [AtomicU64; OP_COUNT],
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_timer(&self, op: ClusterOp) -> OpTimer<'_> {
        OpTimer {
            stats: self,
            op,
            start: Instant::now(),
        }
    }

    pub fn count(&self, op: ClusterOp) -> u64 {
        self.counts[op as usize].load(Ordering::Relaxed)
    }

    pub fn total_nanos(&self, op: ClusterOp) -> u64 {
        self.nanos[op as usize].load(Ordering::Relaxed)
    }

    fn record(&self, op: ClusterOp, elapsed_nanos: u64) {
        self.counts[op as usize].fetch_add(1, Ordering::Relaxed);
        self.nanos[op as usize].fetch_add(elapsed_nanos, Ordering::Relaxed);
    }
}

pub struct OpTimer<'a> {
    stats: &'a SessionStats,
    op: ClusterOp,
    start: Instant,
}

impl Drop for OpTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_nanos() as u64;
        self.stats.record(self.op, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_on_drop() {
        let stats = SessionStats::new();
        {
            let _timer = stats.start_timer(ClusterOp::CreateRecord);
        }
        assert_eq!(stats.count(ClusterOp::CreateRecord), 1);
        assert_eq!(stats.count(ClusterOp::ReadRecord), 0);
    }

    #[test]
    fn test_timer_records_on_early_exit() {
        let stats = SessionStats::new();
        let failing = || -> Result<(), ()> {
            let _timer = stats.start_timer(ClusterOp::DeleteRecord);
            Err(())
        };
        assert!(failing().is_err());
        assert_eq!(stats.count(ClusterOp::DeleteRecord), 1);
    }
}
