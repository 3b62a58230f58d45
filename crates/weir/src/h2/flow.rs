//! Flow-control windows.
//!
//! Send windows are shared between the session and application handles, so
//! they live behind an atomic. Receive windows are only touched by the
//! session, which also decides when to hand credit back to the peer.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// Largest window either side may ever have (RFC 9113 section 6.9.1).
pub const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

/// Window size every stream and the connection start with.
pub const DEFAULT_WINDOW_SIZE: u32 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow-control window would exceed 2^31-1")]
pub struct WindowOverflow;

/// A flow-control window. Can go negative when the peer shrinks
/// SETTINGS_INITIAL_WINDOW_SIZE while data is in flight.
#[derive(Debug, Clone)]
pub struct Window(Arc<AtomicI64>);

impl Window {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicI64::new(initial as i64)))
    }

    pub fn available(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Adds `increment` credit, as on WINDOW_UPDATE. On overflow the window
    /// is left untouched.
    pub fn increase(&self, increment: u32) -> Result<(), WindowOverflow> {
        self.adjust(increment as i64)
    }

    /// Applies a signed delta, as on a SETTINGS_INITIAL_WINDOW_SIZE change.
    pub fn adjust(&self, delta: i64) -> Result<(), WindowOverflow> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current + delta;
                (next <= MAX_WINDOW_SIZE).then_some(next)
            })
            .map(|_| ())
            .map_err(|_| WindowOverflow)
    }

    /// Takes `n` bytes of credit if available. Returns false, leaving the
    /// window untouched, when there isn't enough.
    pub fn try_consume(&self, n: u32) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current - n as i64;
                (next >= 0).then_some(next)
            })
            .is_ok()
    }

    /// How much of `want` could be sent right now.
    pub fn capacity(&self, want: usize) -> usize {
        (self.available().max(0) as usize).min(want)
    }
}

/// Receive side of a window, with the bookkeeping that decides when to send
/// a WINDOW_UPDATE.
#[derive(Debug)]
pub struct RecvFlow {
    window: Window,

    /// The window size we aim to keep granting
    target: u32,

    /// Bytes the application consumed that haven't been granted back yet
    released: u32,
}

impl RecvFlow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: Window::new(initial),
            target: initial,
            released: 0,
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Accounts for `n` received bytes. False means the peer overran the
    /// window.
    pub fn receive(&mut self, n: u32) -> bool {
        self.window.try_consume(n)
    }

    /// The application consumed `n` bytes. Returns the increment to announce
    /// once at least half the target has been consumed.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        self.released = self.released.saturating_add(n);
        if self.released < self.target / 2 {
            return None;
        }
        let increment = std::mem::take(&mut self.released);
        // we never grant more than was consumed, so this cannot overflow
        self.window.increase(increment).ok()?;
        Some(increment)
    }

    /// Grows the target and the window at once, returning the increment to
    /// announce. Used to raise the connection window above 65535.
    pub fn grow_to(&mut self, target: u32) -> Option<u32> {
        let increment = target.checked_sub(self.target).filter(|inc| *inc > 0)?;
        self.window.increase(increment).ok()?;
        self.target = target;
        Some(increment)
    }

    /// Applies a change of our SETTINGS_INITIAL_WINDOW_SIZE once the peer
    /// acknowledged it.
    pub fn retarget(&mut self, target: u32) -> Result<(), WindowOverflow> {
        let delta = target as i64 - self.target as i64;
        self.window.adjust(delta)?;
        self.target = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_overflow_leaves_window_untouched() {
        let w = Window::new(DEFAULT_WINDOW_SIZE);
        assert_eq!(
            w.increase((MAX_WINDOW_SIZE as u32) - DEFAULT_WINDOW_SIZE),
            Ok(())
        );
        assert_eq!(w.available(), MAX_WINDOW_SIZE);
        assert_eq!(w.increase(1), Err(WindowOverflow));
        assert_eq!(w.available(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_window_can_go_negative_on_settings_change() {
        let w = Window::new(100);
        assert!(w.try_consume(80));
        w.adjust(-50).unwrap();
        assert_eq!(w.available(), -30);
        assert_eq!(w.capacity(10), 0);
        assert!(!w.try_consume(1));
        w.increase(40).unwrap();
        assert_eq!(w.capacity(100), 10);
    }

    #[test]
    fn test_window_clones_share_credit() {
        let w = Window::new(10);
        let handle = w.clone();
        assert!(w.try_consume(4));
        assert_eq!(handle.available(), 6);
    }

    #[test]
    fn test_recv_flow_releases_at_half() {
        let mut flow = RecvFlow::new(100);
        assert!(flow.receive(60));
        assert_eq!(flow.release(30), None);
        assert_eq!(flow.release(20), Some(50));
        assert_eq!(flow.window().available(), 90);

        assert!(flow.receive(90));
        assert!(!flow.receive(1));
    }

    #[test]
    fn test_recv_flow_grow_and_retarget() {
        let mut flow = RecvFlow::new(DEFAULT_WINDOW_SIZE);
        assert_eq!(flow.grow_to(1 << 20), Some((1 << 20) - DEFAULT_WINDOW_SIZE));
        assert_eq!(flow.grow_to(1 << 20), None);
        assert_eq!(flow.window().available(), 1 << 20);

        flow.retarget(1 << 10).unwrap();
        assert_eq!(flow.window().available(), 1 << 10);
    }
}
