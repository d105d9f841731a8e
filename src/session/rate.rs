//! Producer rate flow control.
//!
//! A token bucket keyed on messages per second. The broker advertises a
//! credit window to the publishing client; tokens accrue with time and are
//! granted back as `message.flow` frames. Grants are withheld while more
//! than half the window is still outstanding, which bounds flow-frame
//! chatter; the scheduled retry task covers the idle tail. Time is always
//! injected by the caller, never sampled here.

use std::time::{Duration, Instant};

pub struct RateFlowControl {
    /// Advertised messages per second.
    rate: u32,
    /// Maximum credit outstanding at the client.
    window: u32,
    /// Credit currently outstanding at the client.
    balance: u32,
    last_grant: Instant,
}

impl RateFlowControl {
    pub fn new(rate: u32, window_cap: u32, now: Instant) -> Self {
        Self {
            rate: rate.max(1),
            window: rate.clamp(1, window_cap.max(1)),
            balance: 0,
            last_grant: now,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn balance(&self) -> u32 {
        self.balance
    }

    /// True when the client has exhausted its granted credit; publishing
    /// past this point violates the advertised rate.
    pub fn flow_stopped(&self) -> bool {
        self.balance == 0
    }

    /// Account for received publishes and compute the credit to grant back
    /// (possibly zero).
    pub fn received_message(&mut self, now: Instant, msgs: u32) -> u32 {
        self.balance = self.balance.saturating_sub(msgs);
        if self.balance >= self.window / 2 {
            // plenty outstanding; no need to chatter
            return 0;
        }
        let elapsed_ms = now.duration_since(self.last_grant).as_millis() as u64;
        let earned = ((elapsed_ms * u64::from(self.rate)) / 1000).min(u64::from(self.window)) as u32;
        earned.min(self.window - self.balance)
    }

    /// Record credit actually transmitted to the client.
    pub fn sent_credit(&mut self, now: Instant, credit: u32) {
        self.balance = (self.balance.saturating_add(credit)).min(self.window);
        self.last_grant = now;
    }

    /// Delay heuristic for the scheduled retry: time for 50 messages, but
    /// no longer than the configured cap.
    pub fn retry_delay(&self, cap: Duration) -> Duration {
        Duration::from_millis(50_000 / u64::from(self.rate)).min(cap)
    }
}
