//! Authentication lifecycle of the messaging session and the bounded wait the
//! `/qr` page uses to obtain a pairing challenge.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_channels::{LifecycleHandler, MessageHandler, MessagingSession, SessionSubscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Longest wait [`SessionLifecycle::await_challenge`] honors.
pub const MAX_CHALLENGE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    AwaitingScan,
    Authenticated,
    Ready,
    Disconnected,
}

impl SessionPhase {
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

/// Invariant: `pending_challenge` is `Some` only while `phase == AwaitingScan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub pending_challenge: Option<PendingChallenge>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            pending_challenge: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    AlreadyAuthenticated,
    Challenge(PendingChallenge),
    TimedOut,
}

pub struct SessionLifecycle {
    transport: Arc<dyn MessagingSession>,
    messages: Arc<dyn MessageHandler>,
    this: Weak<SessionLifecycle>,
    state: watch::Sender<SessionState>,
    initialized: AtomicBool,
    check_interval: Duration,
    qr_url: String,
}

impl SessionLifecycle {
    pub fn new(
        transport: Arc<dyn MessagingSession>,
        messages: Arc<dyn MessageHandler>,
        check_interval: Duration,
        qr_url: impl Into<String>,
    ) -> Arc<Self> {
        let qr_url = qr_url.into();
        Arc::new_cyclic(|this| Self {
            transport,
            messages,
            this: this.clone(),
            state: watch::Sender::new(SessionState::default()),
            initialized: AtomicBool::new(false),
            check_interval,
            qr_url,
        })
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    /// Start a transport session unless one is already running or starting.
    /// Concurrent callers race on the latch; only the winner initializes.
    #[tracing::instrument(level = "info", skip_all, fields(session = %self.transport.session_id()))]
    pub async fn ensure_initialized(&self) -> Result<()> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let lifecycle: Arc<dyn LifecycleHandler> = match self.this.upgrade() {
            Some(this) => this as Arc<dyn LifecycleHandler>,
            None => {
                self.initialized.store(false, Ordering::Release);
                return Err(anyhow!("session lifecycle is shutting down"));
            }
        };
        let subscription = SessionSubscription::new(lifecycle, self.messages.clone());

        tracing::info!("initializing messaging session");
        if let Err(error) = self.transport.initialize(subscription).await {
            self.initialized.store(false, Ordering::Release);
            tracing::error!(%error, "messaging session failed to initialize");
            return Err(error);
        }
        Ok(())
    }

    /// Wait up to `max_wait` for a pairing challenge, initializing the session
    /// first when needed. Returns immediately once authenticated. Waits longer
    /// than [`MAX_CHALLENGE_WAIT`] are clamped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn await_challenge(&self, max_wait: Duration) -> Result<ChallengeOutcome> {
        if let Some(outcome) = self.settled_outcome() {
            return Ok(outcome);
        }

        let mut changes = self.state.subscribe();
        self.ensure_initialized().await?;

        let max_wait = max_wait.min(MAX_CHALLENGE_WAIT);
        let deadline = Instant::now() + max_wait;
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if let Some(outcome) = self.settled_outcome() {
                return Ok(outcome);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(wait_ms = max_wait.as_millis() as u64, "no pairing challenge before deadline");
                    return Ok(ChallengeOutcome::TimedOut);
                }
                _ = ticker.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(ChallengeOutcome::TimedOut);
                    }
                }
            }
        }
    }

    fn settled_outcome(&self) -> Option<ChallengeOutcome> {
        let state = self.state.borrow();
        if state.phase.is_authenticated() {
            return Some(ChallengeOutcome::AlreadyAuthenticated);
        }
        state
            .pending_challenge
            .clone()
            .map(ChallengeOutcome::Challenge)
    }
}

#[async_trait]
impl LifecycleHandler for SessionLifecycle {
    async fn on_challenge(&self, token: String) {
        let awaiting_reinit = !self.initialized.load(Ordering::Acquire);
        let accepted = self.state.send_if_modified(|state| match state.phase {
            SessionPhase::Authenticated | SessionPhase::Ready => false,
            SessionPhase::Disconnected if awaiting_reinit => false,
            _ => {
                state.phase = SessionPhase::AwaitingScan;
                state.pending_challenge = Some(PendingChallenge {
                    token: token.clone(),
                    issued_at: Utc::now(),
                });
                true
            }
        });
        if accepted {
            tracing::info!(qr_url = %self.qr_url, "pairing challenge received; scan it to log in");
        } else {
            tracing::warn!(phase = ?self.phase(), "ignoring pairing challenge in current phase");
        }
    }

    async fn on_authenticated(&self) {
        self.state.send_modify(|state| {
            state.phase = SessionPhase::Authenticated;
            state.pending_challenge = None;
        });
        tracing::info!("messaging session authenticated");
    }

    async fn on_auth_failure(&self, reason: String) {
        tracing::error!(%reason, phase = ?self.phase(), "messaging session authentication failed");
    }

    async fn on_ready(&self) {
        self.state.send_modify(|state| {
            state.phase = SessionPhase::Ready;
            state.pending_challenge = None;
        });
        tracing::info!("messaging session ready");
    }

    async fn on_disconnected(&self, reason: String) {
        self.state.send_modify(|state| {
            state.phase = SessionPhase::Disconnected;
            state.pending_challenge = None;
        });
        self.initialized.store(false, Ordering::Release);
        tracing::warn!(%reason, "messaging session disconnected; it will be re-initialized on the next /qr request");
    }
}
