use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Delivered on the timer channel when an armed deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub generation: u64,
}

/// Single-shot deadline with at most one live arming.
///
/// Re-arming or cancelling bumps the generation, so a `TimerFired` that was
/// already queued when the timer was cancelled is recognisably stale.
#[derive(Debug, Default)]
pub struct ConnectionTimer {
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after: Duration, fired: mpsc::UnboundedSender<TimerFired>) -> u64 {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        // `None` when the deadline lies beyond what `Instant` can represent.
        self.deadline = Instant::now().checked_add(after);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = fired.send(TimerFired { generation });
        }));
        debug!(
            generation,
            timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            "connection timer armed"
        );
        generation
    }

    /// Returns `false` when nothing was armed.
    pub fn cancel(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        self.deadline = None;
        self.generation += 1;
        debug!(generation = self.generation, "connection timer cancelled");
        true
    }

    /// Accepts a firing if it belongs to the live arming, disarming the timer.
    pub fn take_fired(&mut self, fired: TimerFired) -> bool {
        if self.task.is_none() || fired.generation != self.generation {
            return false;
        }
        self.task = None;
        self.deadline = None;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Drop for ConnectionTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
