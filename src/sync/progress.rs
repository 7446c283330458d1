use tokio::sync::watch;

/// Task counters for the current run. `remaining == 0` once the run is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub remaining: usize,
}

impl Progress {
    pub fn completed(&self) -> usize {
        self.total.saturating_sub(self.remaining)
    }
}

/// Single progress sink for a run, observed through [`watch::Receiver`].
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<Progress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Progress {
        *self.tx.borrow()
    }

    pub(crate) fn start(&self, total: usize) {
        self.tx.send_replace(Progress {
            total,
            remaining: total,
        });
    }

    /// Mark `n` tasks finished (completed, failed or canceled).
    pub(crate) fn finish_tasks(&self, n: usize) {
        self.tx.send_modify(|p| p.remaining = p.remaining.saturating_sub(n));
    }

    pub(crate) fn finish_all(&self) {
        self.tx.send_modify(|p| p.remaining = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let tracker = ProgressTracker::new();
        let rx = tracker.subscribe();
        tracker.start(4);
        tracker.finish_tasks(1);
        assert_eq!(*rx.borrow(), Progress { total: 4, remaining: 3 });
        assert_eq!(tracker.current().completed(), 1);

        tracker.finish_tasks(10);
        assert_eq!(tracker.current().remaining, 0);
    }

    #[test]
    fn test_finish_all() {
        let tracker = ProgressTracker::new();
        tracker.start(3);
        tracker.finish_all();
        assert_eq!(tracker.current(), Progress { total: 3, remaining: 0 });
    }
}
