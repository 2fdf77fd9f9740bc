//! SIP Transaction Layer
//!
//! Non-INVITE client transactions as per RFC 3261 Section 17.1.2, driven
//! by the caller: the transaction never sleeps, it is handed the current
//! time and reports which retransmissions or timeouts are due.
//!
//! The timer model is shared with the INVITE handling in [`super::call`],
//! which retransmits INVITEs and 2xx answers itself.

use super::message::SipMessage;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer types used by transactions and calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (default: T1)
    TimerA,
    /// Timer B: INVITE timeout (default: 64*T1)
    TimerB,
    /// Timer E: Non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (default: T1)
    TimerG,
    /// Timer H: Wait time for ACK receipt (default: 64*T1)
    TimerH,
}

impl TimerType {
    /// Get default duration for this timer
    pub fn default_duration(&self, timers: &SipTimers) -> Duration {
        match self {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => timers.t1,
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => timers.t1 * 64,
        }
    }
}

/// Active timer
#[derive(Debug, Clone)]
pub struct ActiveTimer {
    pub timer_type: TimerType,
    pub expires_at: Instant,
    pub interval: Duration,
}

impl ActiveTimer {
    pub fn start(timer_type: TimerType, timers: &SipTimers, now: Instant) -> Self {
        let interval = timer_type.default_duration(timers);
        Self {
            timer_type,
            expires_at: now + interval,
            interval,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Re-arm with a doubled interval, capped at `cap`
    pub fn backoff(&mut self, now: Instant, cap: Duration) {
        self.interval = std::cmp::min(self.interval * 2, cap);
        self.expires_at = now + self.interval;
    }
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Request sent, no response yet
    Trying,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received final response (2xx-6xx)
    Completed,
    /// Timed out
    Terminated,
}

impl TransactionState {
    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Trying => "NICT-Trying",
            TransactionState::Proceeding => "NICT-Proceeding",
            TransactionState::Completed => "NICT-Completed",
            TransactionState::Terminated => "NICT-Terminated",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Terminated)
    }
}

/// Actions that should be taken when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimerAction {
    /// Retransmit the request
    RetransmitRequest,
    /// Transaction timed out
    Timeout,
}

/// Non-INVITE client transaction
#[derive(Debug, Clone)]
pub struct SipTransaction {
    branch: String,
    state: TransactionState,
    request: SipMessage,
    response: Option<SipMessage>,
    timers: Vec<ActiveTimer>,
    sip_timers: SipTimers,
}

impl SipTransaction {
    /// Start a transaction for `request`, which the caller sends right away
    pub fn new(request: SipMessage, sip_timers: SipTimers, now: Instant) -> Self {
        let branch = request.branch().unwrap_or_default();
        debug!("Created transaction {} for {}", branch, request.method());

        Self {
            branch,
            state: TransactionState::Trying,
            timers: vec![
                ActiveTimer::start(TimerType::TimerE, &sip_timers, now),
                ActiveTimer::start(TimerType::TimerF, &sip_timers, now),
            ],
            request,
            response: None,
            sip_timers,
        }
    }

    /// Via branch identifying the transaction
    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &SipMessage {
        &self.request
    }

    /// Final response, if one was received
    pub fn response(&self) -> Option<&SipMessage> {
        self.response.as_ref()
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.expires_at).min()
    }

    /// Process a response matching our branch.
    ///
    /// Returns `true` when the response completed the transaction.
    pub fn handle_response(&mut self, response: &SipMessage) -> bool {
        if self.state.is_finished() {
            return false;
        }

        let old_state = self.state;
        let status = response.status_code();
        if (100..200).contains(&status) {
            self.state = TransactionState::Proceeding;
            // retransmit at T2 once the server has answered
            let t2 = self.sip_timers.t2;
            if let Some(timer) = self
                .timers
                .iter_mut()
                .find(|t| t.timer_type == TimerType::TimerE)
            {
                timer.expires_at = timer.expires_at - timer.interval + t2;
                timer.interval = t2;
            }
        } else if status >= 200 {
            self.state = TransactionState::Completed;
            self.response = Some(response.clone());
            self.timers.clear();
        }

        debug!(
            "Transaction {} processed response {}: {} -> {}",
            self.branch,
            status,
            old_state.name(),
            self.state.name()
        );
        self.state == TransactionState::Completed
    }

    /// Fire expired timers
    pub fn check_timers(&mut self, now: Instant) -> Vec<TransactionTimerAction> {
        let mut actions = Vec::new();
        let t2 = self.sip_timers.t2;

        let timed_out = self
            .timers
            .iter()
            .any(|t| t.timer_type == TimerType::TimerF && t.is_expired(now));
        if timed_out {
            warn!("{} transaction timed out", self.request.method());
            self.state = TransactionState::Terminated;
            self.timers.clear();
            actions.push(TransactionTimerAction::Timeout);
            return actions;
        }

        for timer in self.timers.iter_mut() {
            if timer.timer_type == TimerType::TimerE && timer.is_expired(now) {
                timer.backoff(now, t2);
                debug!(
                    "Retransmitting {} for transaction {} (next in {:?})",
                    self.request.method(),
                    self.branch,
                    timer.interval
                );
                actions.push(TransactionTimerAction::RetransmitRequest);
            }
        }

        actions
    }
}
