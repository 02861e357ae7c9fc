//! Timer state machines for the session loop.
//!
//! All protocol timers are plain deadline holders polled by the single task
//! that owns the connection (`select!` over the socket and the deadlines).
//! Nothing here spawns; cancellation just clears the deadline, which makes
//! it idempotent and free of callback races.
//!
//! Uses `tokio::time::Instant` so the paused test clock drives these in
//! timing tests.

use tokio::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// OneShot
// ---------------------------------------------------------------------------

/// One-shot timer: Idle → Armed(deadline) → Idle.
///
/// `arm` is a no-op while armed: the ack timer measures time since the
/// *first* unacked chunk, not the latest.
#[derive(Debug, Default)]
pub struct OneShot {
    deadline: Option<Instant>,
}

impl OneShot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + after);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the armed deadline has passed.  Lets the owning loop
    /// re-check after waking, since the deadline may have been cancelled
    /// between the select registration and the wake.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

// ---------------------------------------------------------------------------
// Periodic
// ---------------------------------------------------------------------------

/// Fixed-interval timer; re-armed with [`Periodic::tick`] after each fire.
#[derive(Debug)]
pub struct Periodic {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Periodic {
    /// A started periodic timer with its first deadline one interval away.
    pub fn started(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Some(Instant::now() + interval),
        }
    }

    pub fn tick(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential delay sequence: `initial, ×2, ×2 … cap`.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: initial,
        }
    }

    /// The next delay to wait; doubles the one after, up to the cap.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// BackoffTimer
// ---------------------------------------------------------------------------

/// Idle → Running(deadline, timeout); the timeout doubles per tick up to the
/// cap and resets when the peer acknowledges progress.
#[derive(Debug)]
pub struct BackoffTimer {
    backoff: Backoff,
    deadline: Option<Instant>,
}

impl BackoffTimer {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            backoff: Backoff::new(initial, cap),
            deadline: None,
        }
    }

    /// Reset the backoff and arm at the initial delay.
    pub fn restart(&mut self) {
        self.backoff.reset();
        self.deadline = Some(Instant::now() + self.backoff.next());
    }

    /// Re-arm after a fire, doubling the delay.
    pub fn tick(&mut self) {
        self.deadline = Some(Instant::now() + self.backoff.next());
    }

    /// Back to Idle with the backoff reset.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.deadline = None;
    }

    /// Back to Idle, keeping the current backoff.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut b = Backoff::new(MS * 2000, MS * 30_000);
        assert_eq!(b.next(), MS * 2000);
        assert_eq!(b.next(), MS * 4000);
        assert_eq!(b.next(), MS * 8000);
        assert_eq!(b.next(), MS * 16_000);
        assert_eq!(b.next(), MS * 30_000);
        assert_eq!(b.next(), MS * 30_000);
        b.reset();
        assert_eq!(b.next(), MS * 2000);
    }

    #[test]
    fn one_shot_arm_is_sticky_and_cancel_idempotent() {
        let mut t = OneShot::new();
        assert!(t.deadline().is_none());
        t.arm(MS * 1000);
        let first = t.deadline().unwrap();
        t.arm(MS * 5000); // ignored; still measuring from the first arm
        assert_eq!(t.deadline().unwrap(), first);
        t.cancel();
        t.cancel();
        assert!(t.deadline().is_none());
        assert!(!t.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_expires_after_its_deadline() {
        let mut t = OneShot::new();
        t.arm(MS * 100);
        assert!(!t.expired());
        tokio::time::advance(MS * 101).await;
        assert!(t.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_timer_runs_then_resets_on_ack() {
        let mut t = BackoffTimer::new(MS * 2000, MS * 30_000);
        assert!(t.deadline().is_none());
        t.restart();
        let d1 = t.deadline().unwrap();
        tokio::time::advance(MS * 2001).await;
        assert!(t.expired());
        t.tick();
        // second delay doubled to 4 s
        assert_eq!(t.deadline().unwrap(), Instant::now() + MS * 4000);
        assert!(t.deadline().unwrap() > d1);
        t.reset();
        assert!(t.deadline().is_none());
        t.restart();
        assert!(!t.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_rearms_on_tick() {
        let mut t = Periodic::started(MS * 500);
        assert!(!t.expired());
        tokio::time::advance(MS * 501).await;
        assert!(t.expired());
        t.tick();
        assert!(!t.expired());
    }
}
