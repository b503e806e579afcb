//! In-memory reservation backend.
//!
//! Consumes exactly as many management frames as the bookkeeping layout
//! requires and records every reservation it accepts. Failures can be
//! injected to exercise the carving engine's rollback paths.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{PlatformBackend, ReserveRequest};
use crate::error::{Error, Result};
use crate::memory::BookkeepingConfig;

/// Reservation backend with no platform side effects.
pub struct SimulatedBackend {
    config: BookkeepingConfig,
    reservations: Mutex<Vec<ReserveRequest>>,
    /// Number of upcoming calls to fail.
    fail_next: AtomicUsize,
    /// Extra frames to report on top of the real consumption.
    over_report: AtomicUsize,
}

impl SimulatedBackend {
    /// Create a backend using the given bookkeeping layout.
    pub fn new(config: BookkeepingConfig) -> Self {
        Self {
            config,
            reservations: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            over_report: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` reservations fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Report `extra` more frames than actually consumed, violating the
    /// backend contract.
    pub fn over_report(&self, extra: usize) {
        self.over_report.store(extra, Ordering::SeqCst);
    }

    /// Reservations accepted so far, in call order.
    pub fn reservations(&self) -> Vec<ReserveRequest> {
        self.reservations.lock().clone()
    }

    fn consumed(&self, req: &ReserveRequest) -> u64 {
        match req.mgmt {
            None => 0,
            Some(mgmt) if mgmt == req.range => self.config.required_frames(mgmt.frames()),
            Some(mgmt) => self
                .config
                .required_frames(req.range.frames().saturating_add(mgmt.frames())),
        }
    }
}

impl PlatformBackend for SimulatedBackend {
    fn reserve(&self, req: &ReserveRequest) -> Result<u64> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::backend(format!("injected failure reserving {}", req)));
        }

        let used = self.consumed(req) + self.over_report.load(Ordering::SeqCst) as u64;
        self.reservations.lock().push(*req);
        Ok(used)
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FrameRange;

    fn request(range: (u64, u64), mgmt: Option<(u64, u64)>) -> ReserveRequest {
        ReserveRequest {
            range: FrameRange::new(range.0, range.1).unwrap(),
            locality: 0,
            mgmt: mgmt.map(|(s, e)| FrameRange::new(s, e).unwrap()),
        }
    }

    #[test]
    fn test_consumption() {
        let backend = SimulatedBackend::new(BookkeepingConfig::default());
        // Self-hosted management region of 4096 frames needs 40 frames.
        assert_eq!(backend.reserve(&request((0, 4096), Some((0, 4096)))).unwrap(), 40);
        // 4096 data frames plus 4096 offered management frames need 80.
        assert_eq!(
            backend
                .reserve(&request((8192, 12288), Some((40, 4136))))
                .unwrap(),
            80
        );
        assert_eq!(backend.reserve(&request((0, 10), None)).unwrap(), 0);
        assert_eq!(backend.reservations().len(), 3);
        assert_eq!(backend.name(), "sim");
    }

    #[test]
    fn test_injected_failures() {
        let backend = SimulatedBackend::new(BookkeepingConfig::default());
        backend.fail_next(2);
        assert!(backend.reserve(&request((0, 8), Some((0, 8)))).is_err());
        assert!(backend.reserve(&request((0, 8), Some((0, 8)))).is_err());
        assert!(backend.reserve(&request((0, 8), Some((0, 8)))).is_ok());
        assert_eq!(backend.reservations().len(), 1);
    }

    #[test]
    fn test_over_report() {
        let backend = SimulatedBackend::new(BookkeepingConfig::default());
        backend.over_report(5);
        assert_eq!(backend.reserve(&request((0, 8), Some((0, 8)))).unwrap(), 5);
    }
}
