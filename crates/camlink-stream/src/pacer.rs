use std::time::{Duration, Instant};

/// Target interval between displayed frames (~30 fps).
pub const TARGET_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Enforces a maximum display rate by discarding frames that complete faster
/// than the target interval. Discarded frames are simply dropped — there is
/// no catch-up queue, the next on-time frame is always the freshest one.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    last: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a frame completing at `now` should be displayed. Admitting a
    /// frame moves the window; rejected frames leave it untouched.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new(TARGET_FRAME_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_always_admitted() {
        let mut pacer = FramePacer::default();
        assert!(pacer.admit(Instant::now()));
    }

    #[test]
    fn admits_ceil_elapsed_over_interval() {
        // 1000 frames arriving 1 ms apart against a 33 ms interval:
        // admissions at 0, 33, 66, ... = ceil(999 / 33) + 1 boundary case.
        let mut pacer = FramePacer::new(Duration::from_millis(33));
        let base = Instant::now();

        let admitted = (0..1000)
            .filter(|i| pacer.admit(base + Duration::from_millis(*i)))
            .count();
        assert_eq!(admitted, 31); // 999 ms elapsed, one frame per full 33 ms window
    }

    #[test]
    fn slow_frames_all_admitted() {
        let mut pacer = FramePacer::new(Duration::from_millis(33));
        let base = Instant::now();
        for i in 0..10 {
            assert!(pacer.admit(base + Duration::from_millis(i * 50)));
        }
    }

    #[test]
    fn rejection_does_not_move_window() {
        let mut pacer = FramePacer::new(Duration::from_millis(33));
        let base = Instant::now();
        assert!(pacer.admit(base));
        assert!(!pacer.admit(base + Duration::from_millis(20)));
        // 33 ms after the last ADMITTED frame, not the rejected one.
        assert!(pacer.admit(base + Duration::from_millis(33)));
    }

    #[test]
    fn reset_forgets_last_frame() {
        let mut pacer = FramePacer::new(Duration::from_millis(33));
        let base = Instant::now();
        assert!(pacer.admit(base));
        pacer.reset();
        assert!(pacer.admit(base + Duration::from_millis(1)));
    }
}
