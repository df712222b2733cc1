//! Per-frame time budget for resource uploads.
//!
//! Clones share the same frame start and budget, so the render loop and the
//! uploading manager see one clock.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

const UNLIMITED: u64 = u64::MAX;

struct Inner {
    frame_start: Mutex<Instant>,
    upload_budget_us: AtomicU64,
}

#[derive(Clone)]
pub struct FrameTimer {
    inner: Arc<Inner>,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl FrameTimer {
    pub fn new(upload_budget: Option<Duration>) -> Self {
        let timer = Self {
            inner: Arc::new(Inner {
                frame_start: Mutex::new(Instant::now()),
                upload_budget_us: AtomicU64::new(UNLIMITED),
            }),
        };
        timer.set_upload_budget(upload_budget);
        timer
    }

    pub fn start_frame(&self) {
        *self
            .inner
            .frame_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// `None` removes the limit.
    pub fn set_upload_budget(&self, budget: Option<Duration>) {
        let us = budget.map_or(UNLIMITED, |b| b.as_micros().min(u128::from(UNLIMITED - 1)) as u64);
        self.inner.upload_budget_us.store(us, Ordering::Relaxed);
    }

    pub fn upload_budget(&self) -> Option<Duration> {
        match self.inner.upload_budget_us.load(Ordering::Relaxed) {
            UNLIMITED => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.inner
            .frame_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn is_upload_budget_exceeded(&self) -> bool {
        self.upload_budget()
            .is_some_and(|budget| self.elapsed() >= budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_exceeds() {
        let timer = FrameTimer::default();
        assert!(timer.upload_budget().is_none());
        assert!(!timer.is_upload_budget_exceeded());
    }

    #[test]
    fn zero_budget_is_always_exceeded() {
        let timer = FrameTimer::new(Some(Duration::ZERO));
        timer.start_frame();
        assert!(timer.is_upload_budget_exceeded());
    }

    #[test]
    fn clones_share_budget() {
        let timer = FrameTimer::default();
        let other = timer.clone();
        other.set_upload_budget(Some(Duration::from_secs(3600)));
        assert_eq!(timer.upload_budget(), Some(Duration::from_secs(3600)));
        assert!(!timer.is_upload_budget_exceeded());
    }
}
