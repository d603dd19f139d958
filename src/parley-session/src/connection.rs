//! Connection lifecycle of one session channel.
//!
//! The manager never touches the transport itself. The owner reports
//! transport outcomes and timer expiries tagged with the generation they were
//! issued for, and the manager answers with what to do next. Every new
//! connection attempt, every scheduled timer and every close bumps the
//! generation, so a callback or timer from a superseded attempt is recognized
//! and ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, error, warn};

use crate::error::ConnectionError;

/// Connectivity as exposed to the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectExhausted,
}

/// Bounded linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// A pending reconnect. Hand it back to [`ConnectionManager::timer_fired`]
/// once `delay` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectTimer {
    generation: u64,
    attempt: u32,
    delay: Duration,
}

impl ReconnectTimer {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// What the owner must do after a transport loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossOutcome {
    /// The loss belongs to a superseded connection; nothing changed.
    Stale,
    /// Wait for the timer, then report it.
    Reconnect(ReconnectTimer),
    /// The bound was reached. Only [`ConnectionManager::retry`] reopens.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    policy: ReconnectPolicy,
    state: ConnectionState,
    generation: u64,
    attempts: u32,
    pending_timer: Option<u64>,
    closed: bool,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            pending_timer: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Identity of the current connection attempt or timer.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the channel was closed on purpose and must not reconnect.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_pending_timer(&self) -> bool {
        self.pending_timer.is_some()
    }

    /// Starts a connection attempt. Returns the generation to tag transport
    /// callbacks with. A pending reconnect timer is superseded.
    pub fn open(&mut self) -> Result<u64, ConnectionError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(ConnectionError::AlreadyOpen(self.state))
            }
            ConnectionState::ReconnectExhausted => Err(ConnectionError::Exhausted),
            ConnectionState::Disconnected => {
                self.closed = false;
                self.pending_timer = None;
                Ok(self.begin_attempt())
            }
        }
    }

    /// Transport came up. Returns `false` for a stale generation.
    pub fn connected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation, current = self.generation, "Ignoring stale connect");
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.pending_timer = None;
        true
    }

    /// Transport failed to come up or dropped.
    pub fn lost(&mut self, generation: u64) -> LossOutcome {
        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if generation != self.generation || !live || self.closed {
            debug!(generation, current = self.generation, "Ignoring stale loss");
            return LossOutcome::Stale;
        }

        self.state = ConnectionState::Disconnected;
        self.generation += 1;

        if self.attempts < self.policy.max_attempts {
            self.attempts += 1;
            let timer = ReconnectTimer {
                generation: self.generation,
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            };
            self.pending_timer = Some(timer.generation);
            warn!(
                attempt = timer.attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = timer.delay.as_millis() as u64,
                "Connection lost, scheduling reconnect"
            );
            LossOutcome::Reconnect(timer)
        } else {
            self.state = ConnectionState::ReconnectExhausted;
            self.pending_timer = None;
            error!(
                attempts = self.attempts,
                "Reconnect attempts exhausted, giving up"
            );
            LossOutcome::Exhausted
        }
    }

    /// A reconnect timer expired. Returns the generation of the new attempt,
    /// or `None` if the timer was superseded.
    pub fn timer_fired(&mut self, timer: ReconnectTimer) -> Option<u64> {
        if self.closed
            || self.state != ConnectionState::Disconnected
            || self.pending_timer != Some(timer.generation)
        {
            debug!(
                generation = timer.generation,
                current = self.generation,
                "Ignoring stale reconnect timer"
            );
            return None;
        }
        self.pending_timer = None;
        Some(self.begin_attempt())
    }

    /// Manual recovery from exhaustion. Resets the attempt counter and opens.
    pub fn retry(&mut self) -> Result<u64, ConnectionError> {
        if self.state != ConnectionState::ReconnectExhausted {
            return Err(ConnectionError::NotExhausted(self.state));
        }
        self.attempts = 0;
        self.closed = false;
        Ok(self.begin_attempt())
    }

    /// Deliberate disconnect. Cancels any pending timer and invalidates the
    /// current attempt; no reconnect follows.
    pub fn close(&mut self) {
        self.closed = true;
        self.state = ConnectionState::Disconnected;
        self.pending_timer = None;
        self.attempts = 0;
        self.generation += 1;
    }

    fn begin_attempt(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }
}
