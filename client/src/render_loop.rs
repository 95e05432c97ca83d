/// Coalesces repaint requests into at most one composite per frame tick.
///
/// Call `mark_dirty()` whenever state changes. On each tick the driver calls
/// `begin_frame()`; it returns `true` (and clears the flag) only if something
/// changed since the last composite. When a frame reports that it needs a
/// follow-up (for example because chunks are still streaming in), pass `true`
/// to `end_frame` and the next tick repaints again.
#[derive(Debug, Default)]
pub struct RenderScheduler {
    dirty: bool,
    frames: u64,
    coalesced: u64,
}

impl RenderScheduler {
    pub fn new() -> Self {
        // First tick always paints.
        Self {
            dirty: true,
            ..Self::default()
        }
    }

    pub fn mark_dirty(&mut self) {
        if self.dirty {
            self.coalesced += 1;
        }
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn begin_frame(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;
        self.frames += 1;
        true
    }

    pub fn end_frame(&mut self, needs_more: bool) {
        if needs_more {
            self.dirty = true;
        }
    }

    /// Composites performed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Dirty marks absorbed into an already pending frame.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_marks_yields_one_frame() {
        let mut scheduler = RenderScheduler::new();
        assert!(scheduler.begin_frame());
        scheduler.end_frame(false);

        for _ in 0..50 {
            scheduler.mark_dirty();
        }
        assert!(scheduler.begin_frame());
        scheduler.end_frame(false);
        assert!(!scheduler.begin_frame());
        assert_eq!(scheduler.frames(), 2);
        assert_eq!(scheduler.coalesced(), 49);
    }

    #[test]
    fn needs_more_keeps_painting() {
        let mut scheduler = RenderScheduler::new();
        assert!(scheduler.begin_frame());
        scheduler.end_frame(true);
        assert!(scheduler.is_dirty());
        assert!(scheduler.begin_frame());
        scheduler.end_frame(false);
        assert!(!scheduler.is_dirty());
    }
}
