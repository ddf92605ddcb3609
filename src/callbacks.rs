//! The callback set passed through `ActionQueue::process` (§6). Modeled
//! as a struct of optional function pointers by role, the same shape
//! the teacher uses for its own installer step callbacks
//! (`src/installer/mod.rs`'s `FnMut` progress hooks), generalized to
//! the handful of named hooks the action model calls.

/// Optional progress/feedback hooks. Any field may be left `None`; the
/// action model treats an absent callback as a no-op, except
/// `wait_for_entropy`, whose absence means "do not force continue"
/// (`false`).
#[derive(Default)]
pub struct Callbacks<'a> {
    pub report_progress:    Option<Box<dyn FnMut(&str) + 'a>>,
    pub create_format_pre:  Option<Box<dyn FnMut(&str) + 'a>>,
    pub create_format_post: Option<Box<dyn FnMut(&str) + 'a>>,
    pub resize_format_pre:  Option<Box<dyn FnMut(&str) + 'a>>,
    pub resize_format_post: Option<Box<dyn FnMut(&str) + 'a>>,
    /// Called when a LUKS format is about to be created and the host's
    /// current entropy is below `MIN_LUKS_ENTROPY_BITS`. Returns
    /// whether to force continue without waiting further.
    pub wait_for_entropy: Option<Box<dyn FnMut(&str, u32) -> bool + 'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn new() -> Callbacks<'a> { Callbacks::default() }

    pub fn report_progress(&mut self, msg: &str) {
        if let Some(cb) = self.report_progress.as_mut() {
            cb(msg);
        }
    }

    pub fn create_format_pre(&mut self, msg: &str) {
        if let Some(cb) = self.create_format_pre.as_mut() {
            cb(msg);
        }
    }

    pub fn create_format_post(&mut self, msg: &str) {
        if let Some(cb) = self.create_format_post.as_mut() {
            cb(msg);
        }
    }

    pub fn resize_format_pre(&mut self, msg: &str) {
        if let Some(cb) = self.resize_format_pre.as_mut() {
            cb(msg);
        }
    }

    pub fn resize_format_post(&mut self, msg: &str) {
        if let Some(cb) = self.resize_format_post.as_mut() {
            cb(msg);
        }
    }

    /// Returns `true` if the caller should force continue despite low
    /// entropy; `false` if no callback is registered.
    pub fn wait_for_entropy(&mut self, msg: &str, required_bits: u32) -> bool {
        match self.wait_for_entropy.as_mut() {
            Some(cb) => cb(msg, required_bits),
            None => false,
        }
    }
}
