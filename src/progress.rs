//! Progress update callbacks

/// Progress update callbacks
///
/// Long-running device operations report their progress through this trait
/// so that a frontend can render bars or spinners without the library
/// depending on any particular rendering.
pub trait ProgressCallbacks {
    /// Begin a new operation. A `total` of zero means the duration is
    /// unknown and only liveness should be indicated.
    fn init(&mut self, label: &str, total: usize);
    /// Update the current operation
    fn update(&mut self, current: usize);
    /// Finish the current operation
    fn finish(&mut self);
}

/// Discards all progress updates
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _label: &str, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}
