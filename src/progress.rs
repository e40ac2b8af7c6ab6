//! Progress update callbacks

/// Progress reporting for long-running device operations. The library calls
/// these; the frontend decides how to render them.
pub trait ProgressCallbacks {
    /// A new operation is starting at `addr` covering `total` bytes
    fn init(&mut self, addr: u32, total: usize);
    /// `current` bytes have been transferred so far
    fn update(&mut self, current: usize);
    /// The operation completed
    fn finish(&mut self);
}

/// Discards all progress updates
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}
