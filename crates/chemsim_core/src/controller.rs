use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Cancellation, pause and progress shared between a running simulation and
/// the code that started it.
///
/// The driver polls it once per accepted step. Share it through an `Arc`.
#[derive(Debug, Default)]
pub struct SimulationController {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
    // f64 bits of the fraction of output points recorded so far.
    progress: AtomicU64,
}

impl SimulationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears cancellation, pause and progress so the next run starts fresh.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.resume();
        self.set_progress(0.0);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake a driver blocked in `checkpoint`.
        let _guard = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        self.resumed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while paused and not cancelled; returns whether the run was cancelled.
    pub fn checkpoint(&self) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused && !self.is_cancelled() {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.is_cancelled()
    }

    /// Fraction of requested output points recorded so far, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn set_progress(&self, fraction: f64) {
        self.progress
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::SimulationController;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn checkpoint_passes_when_running() {
        let controller = SimulationController::new();
        assert!(!controller.checkpoint());
        controller.cancel();
        assert!(controller.checkpoint());
    }

    #[test]
    fn checkpoint_blocks_until_resumed() {
        let controller = Arc::new(SimulationController::new());
        controller.pause();
        let worker = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.checkpoint())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        controller.resume();
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn cancel_releases_a_paused_run() {
        let controller = Arc::new(SimulationController::new());
        controller.pause();
        let worker = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.checkpoint())
        };
        controller.cancel();
        assert!(worker.join().unwrap());
        assert!(controller.is_paused());
    }

    #[test]
    fn reset_clears_cancel_pause_and_progress() {
        let controller = SimulationController::new();
        controller.pause();
        controller.cancel();
        controller.set_progress(0.5);
        controller.reset();
        assert!(!controller.is_cancelled());
        assert!(!controller.is_paused());
        assert_eq!(controller.progress(), 0.0);
        assert!(!controller.checkpoint());
    }

    #[test]
    fn progress_is_clamped() {
        let controller = SimulationController::new();
        assert_eq!(controller.progress(), 0.0);
        controller.set_progress(0.25);
        assert_eq!(controller.progress(), 0.25);
        controller.set_progress(3.0);
        assert_eq!(controller.progress(), 1.0);
    }
}
