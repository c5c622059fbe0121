//! Proactive per-account token refresh with exponential backoff.
//!
//! The scheduler is an actor: one task owns every account's schedule and
//! processes commands, timer expirations and acquisition results one at a
//! time, so the per-account map needs no locking. [`RefreshScheduler`] is the
//! cloneable handle callers use.
//!
//! # Lifecycle of one schedule
//!
//! 1. `schedule(account, token)` reads the token's `exp` and arms a timer for
//!    `max(now + 1s, exp - 60s)`. A schedule already present for the same
//!    account key is cancelled first.
//! 2. When the timer fires, the [`TokenSource`] is asked for a new token on a
//!    spawned task so the actor never waits on the network.
//! 3. Success emits [`RefreshEvent::Refreshed`] and re-arms from the new
//!    token's expiry. Failure re-arms after `2s * 2^(attempt - 1)`; once the
//!    retries are spent (or the error needs user interaction)
//!    [`RefreshEvent::Exhausted`] is emitted and the schedule ends.
//!
//! Every schedule carries a generation number. Timer and acquisition results
//! for a generation that is no longer current are dropped, which is how a
//! `stop` issued while an acquisition is in flight stays stopped.

use crate::jwt::read_expiry;
use crate::secret::{ExposeSecret, SecretString};
use crate::token_source::{AccountKey, AcquiredToken, SessionAccount, TokenError, TokenSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Command mailbox size.
const SCHEDULER_CHANNEL_BUFFER: usize = 256;

// =============================================================================
// Policy
// =============================================================================

/// Timing rules for refresh and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Refresh this long before expiry.
    pub lead_time: Duration,

    /// Never arm a refresh timer shorter than this.
    pub min_delay: Duration,

    /// First retry delay; doubles on each consecutive failure.
    pub backoff_base: Duration,

    /// Retries after the initial attempt before giving up.
    pub max_retries: u32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_secs(60),
            min_delay: Duration::from_secs(1),
            backoff_base: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

impl RefreshPolicy {
    /// Delay until the refresh for a token expiring at `expires_at` (Unix
    /// seconds), measured from `now_ms` (Unix milliseconds).
    #[must_use]
    pub fn refresh_delay(&self, expires_at: i64, now_ms: i64) -> Duration {
        let lead_ms = i64::try_from(self.lead_time.as_millis()).unwrap_or(i64::MAX);
        let min_ms = i64::try_from(self.min_delay.as_millis()).unwrap_or(i64::MAX);

        let until_refresh = expires_at
            .saturating_mul(1000)
            .saturating_sub(lead_ms)
            .saturating_sub(now_ms);

        Duration::from_millis(u64::try_from(until_refresh.max(min_ms)).unwrap_or(0))
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1_u32 << exponent)
    }
}

// =============================================================================
// Public Types
// =============================================================================

/// Terminal and intermediate outcomes of a schedule.
#[derive(Debug, Clone)]
pub enum RefreshEvent {
    /// A new token was acquired; the next refresh is already armed.
    Refreshed(AcquiredToken),

    /// Retries are spent. The schedule has ended.
    Exhausted(TokenError),
}

/// Stream of events for one schedule.
///
/// Ends (yields `None`) when the schedule is stopped, replaced, exhausted, or
/// when a refreshed token carries no expiry. Dropping it ends the schedule at
/// the next event.
#[derive(Debug)]
pub struct RefreshEvents {
    receiver: mpsc::UnboundedReceiver<RefreshEvent>,
}

impl RefreshEvents {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<RefreshEvent> {
        self.receiver.recv().await
    }
}

/// Result of [`RefreshScheduler::schedule`].
#[derive(Debug)]
pub enum ScheduleOutcome {
    /// A timer is armed for the account.
    Scheduled(RefreshEvents),

    /// The token has no readable `exp`; nothing was scheduled and any
    /// existing schedule for the account is left as it was.
    NoExpiry,
}

// =============================================================================
// Handle
// =============================================================================

enum SchedulerMessage {
    Schedule {
        account: SessionAccount,
        expires_at: i64,
        respond_to: oneshot::Sender<RefreshEvents>,
    },
    Stop {
        key: AccountKey,
        respond_to: oneshot::Sender<bool>,
    },
    StopAll {
        respond_to: oneshot::Sender<usize>,
    },
    PendingTimers {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Handle to the refresh scheduler task.
///
/// Must be created inside a Tokio runtime. The task exits when every handle
/// is dropped or [`RefreshScheduler::shutdown`] is called; pending timers are
/// cancelled either way.
#[derive(Clone)]
pub struct RefreshScheduler {
    sender: mpsc::Sender<SchedulerMessage>,
    cancel_token: CancellationToken,
}

impl RefreshScheduler {
    /// Spawn a scheduler that re-acquires tokens through `source`.
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>, policy: RefreshPolicy) -> Self {
        let (sender, receiver) = mpsc::channel(SCHEDULER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = SchedulerActor::new(source, policy, receiver, cancel_token.clone());
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Start (or replace) the refresh schedule for `account`.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ChannelClosed` if the scheduler task has exited.
    pub async fn schedule(
        &self,
        account: SessionAccount,
        current_token: &SecretString,
    ) -> Result<ScheduleOutcome, TokenError> {
        let Some(expires_at) = read_expiry(current_token.expose_secret()) else {
            debug!(
                target: "common.refresh_scheduler",
                account = %account.key,
                "Token has no readable expiry, not scheduling refresh"
            );
            return Ok(ScheduleOutcome::NoExpiry);
        };

        let events = self
            .request(|respond_to| SchedulerMessage::Schedule {
                account,
                expires_at,
                respond_to,
            })
            .await?;
        Ok(ScheduleOutcome::Scheduled(events))
    }

    /// Cancel the schedule for `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ChannelClosed` if the scheduler task has exited.
    pub async fn stop(&self, key: &AccountKey) -> Result<bool, TokenError> {
        let key = key.clone();
        self.request(|respond_to| SchedulerMessage::Stop { key, respond_to })
            .await
    }

    /// Cancel every schedule. Returns how many were cancelled.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ChannelClosed` if the scheduler task has exited.
    pub async fn stop_all(&self) -> Result<usize, TokenError> {
        self.request(|respond_to| SchedulerMessage::StopAll { respond_to })
            .await
    }

    /// Number of armed timers. An account whose acquisition is in flight has
    /// no armed timer.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ChannelClosed` if the scheduler task has exited.
    pub async fn pending_timers(&self) -> Result<usize, TokenError> {
        self.request(|respond_to| SchedulerMessage::PendingTimers { respond_to })
            .await
    }

    /// Stop the scheduler task and cancel all timers.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerMessage,
    ) -> Result<T, TokenError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| TokenError::ChannelClosed)?;
        rx.await.map_err(|_| TokenError::ChannelClosed)
    }
}

// =============================================================================
// Actor
// =============================================================================

enum InternalEvent {
    TimerFired {
        key: AccountKey,
        generation: u64,
    },
    AcquisitionCompleted {
        key: AccountKey,
        generation: u64,
        result: Result<AcquiredToken, TokenError>,
    },
}

struct AccountSchedule {
    account: SessionAccount,
    generation: u64,
    /// Attempts since the last success.
    attempt: u32,
    timer: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<RefreshEvent>,
}

impl AccountSchedule {
    fn cancel(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

struct SchedulerActor {
    source: Arc<dyn TokenSource>,
    policy: RefreshPolicy,
    receiver: mpsc::Receiver<SchedulerMessage>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    cancel_token: CancellationToken,
    accounts: HashMap<AccountKey, AccountSchedule>,
    next_generation: u64,
}

fn arm_timer(
    internal_tx: &mpsc::UnboundedSender<InternalEvent>,
    key: AccountKey,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    let tx = internal_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // Fails only when the actor is gone
        let _ = tx.send(InternalEvent::TimerFired { key, generation });
    })
}

impl SchedulerActor {
    fn new(
        source: Arc<dyn TokenSource>,
        policy: RefreshPolicy,
        receiver: mpsc::Receiver<SchedulerMessage>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            source,
            policy,
            receiver,
            internal_tx,
            internal_rx,
            cancel_token,
            accounts: HashMap::new(),
            next_generation: 0,
        }
    }

    #[instrument(skip_all, name = "common.refresh_scheduler")]
    async fn run(mut self) {
        debug!(target: "common.refresh_scheduler", "Refresh scheduler started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "common.refresh_scheduler", "Refresh scheduler cancelled");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            debug!(target: "common.refresh_scheduler", "All handles dropped, exiting");
                            break;
                        }
                    }
                }

                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
            }
        }

        let abandoned = self.cancel_all();
        info!(
            target: "common.refresh_scheduler",
            abandoned_schedules = abandoned,
            "Refresh scheduler stopped"
        );
    }

    fn handle_message(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Schedule {
                account,
                expires_at,
                respond_to,
            } => {
                let events = self.install(account, expires_at);
                if respond_to.send(events).is_err() {
                    debug!(target: "common.refresh_scheduler", "Schedule caller went away");
                }
            }
            SchedulerMessage::Stop { key, respond_to } => {
                let existed = match self.accounts.remove(&key) {
                    Some(schedule) => {
                        schedule.cancel();
                        info!(target: "common.refresh_scheduler", account = %key, "Refresh schedule stopped");
                        true
                    }
                    None => false,
                };
                let _ = respond_to.send(existed);
            }
            SchedulerMessage::StopAll { respond_to } => {
                let cancelled = self.cancel_all();
                let _ = respond_to.send(cancelled);
            }
            SchedulerMessage::PendingTimers { respond_to } => {
                let armed = self
                    .accounts
                    .values()
                    .filter(|s| s.timer.as_ref().is_some_and(|t| !t.is_finished()))
                    .count();
                let _ = respond_to.send(armed);
            }
        }
    }

    fn install(&mut self, account: SessionAccount, expires_at: i64) -> RefreshEvents {
        let key = account.key.clone();
        if let Some(previous) = self.accounts.remove(&key) {
            debug!(target: "common.refresh_scheduler", account = %key, "Replacing existing refresh schedule");
            previous.cancel();
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let delay = self
            .policy
            .refresh_delay(expires_at, chrono::Utc::now().timestamp_millis());
        let timer = arm_timer(&self.internal_tx, key.clone(), generation, delay);

        info!(
            target: "common.refresh_scheduler",
            account = %key,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Token refresh scheduled"
        );

        let (events, receiver) = mpsc::unbounded_channel();
        self.accounts.insert(
            key,
            AccountSchedule {
                account,
                generation,
                attempt: 0,
                timer: Some(timer),
                events,
            },
        );

        RefreshEvents { receiver }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::TimerFired { key, generation } => self.on_timer_fired(key, generation),
            InternalEvent::AcquisitionCompleted {
                key,
                generation,
                result,
            } => self.on_acquisition_completed(key, generation, result),
        }
    }

    fn on_timer_fired(&mut self, key: AccountKey, generation: u64) {
        let Some(schedule) = self
            .accounts
            .get_mut(&key)
            .filter(|s| s.generation == generation)
        else {
            debug!(target: "common.refresh_scheduler", account = %key, "Stale timer ignored");
            return;
        };

        schedule.timer = None;
        schedule.attempt += 1;
        debug!(
            target: "common.refresh_scheduler",
            account = %key,
            attempt = schedule.attempt,
            "Attempting silent token acquisition"
        );

        let account = schedule.account.clone();
        let source = Arc::clone(&self.source);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = source.acquire_silent(&account).await;
            let _ = tx.send(InternalEvent::AcquisitionCompleted {
                key,
                generation,
                result,
            });
        });
    }

    fn on_acquisition_completed(
        &mut self,
        key: AccountKey,
        generation: u64,
        result: Result<AcquiredToken, TokenError>,
    ) {
        // Still wanted: the schedule that started this attempt is current
        let Some(schedule) = self
            .accounts
            .get_mut(&key)
            .filter(|s| s.generation == generation)
        else {
            debug!(
                target: "common.refresh_scheduler",
                account = %key,
                "Acquisition finished for a stopped or replaced schedule, dropping result"
            );
            return;
        };

        match result {
            Ok(token) => {
                schedule.attempt = 0;
                if let Some(rotated) = &token.refresh_credential {
                    schedule.account.refresh_credential = Some(rotated.clone());
                }
                let next_expiry = token.expiry();

                if schedule.events.send(RefreshEvent::Refreshed(token)).is_err() {
                    debug!(target: "common.refresh_scheduler", account = %key, "Event receiver dropped, ending schedule");
                    self.accounts.remove(&key);
                    return;
                }

                match next_expiry {
                    Some(expires_at) => {
                        let delay = self
                            .policy
                            .refresh_delay(expires_at, chrono::Utc::now().timestamp_millis());
                        schedule.timer =
                            Some(arm_timer(&self.internal_tx, key.clone(), generation, delay));
                        info!(
                            target: "common.refresh_scheduler",
                            account = %key,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Token refreshed, next refresh scheduled"
                        );
                    }
                    None => {
                        info!(
                            target: "common.refresh_scheduler",
                            account = %key,
                            "Refreshed token has no readable expiry, schedule ends"
                        );
                        self.accounts.remove(&key);
                    }
                }
            }
            Err(error) if error.is_retryable() && schedule.attempt <= self.policy.max_retries => {
                let delay = self.policy.backoff_delay(schedule.attempt);
                warn!(
                    target: "common.refresh_scheduler",
                    account = %key,
                    attempt = schedule.attempt,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Token refresh failed, retrying"
                );
                schedule.timer = Some(arm_timer(&self.internal_tx, key, generation, delay));
            }
            Err(error) => {
                warn!(
                    target: "common.refresh_scheduler",
                    account = %key,
                    attempt = schedule.attempt,
                    error = %error,
                    "Token refresh exhausted"
                );
                let _ = schedule.events.send(RefreshEvent::Exhausted(error));
                self.accounts.remove(&key);
            }
        }
    }

    fn cancel_all(&mut self) -> usize {
        let count = self.accounts.len();
        for (_, schedule) in self.accounts.drain() {
            schedule.cancel();
        }
        count
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    fn token_expiring_in(secs: i64) -> SecretString {
        let exp = chrono::Utc::now().timestamp() + secs;
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"alice","exp":{exp}}}"#));
        SecretString::from(format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig"))
    }

    fn refreshed(token: SecretString) -> Result<AcquiredToken, TokenError> {
        Ok(AcquiredToken::new(token))
    }

    fn opaque() -> Result<AcquiredToken, TokenError> {
        Ok(AcquiredToken::new(SecretString::from("opaque-token")))
    }

    fn account(key: &str) -> SessionAccount {
        SessionAccount::new(AccountKey::new(key))
            .with_refresh_credential(SecretString::from("rt-0"))
    }

    /// Returns scripted results in order and records when each call happened.
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<AcquiredToken, TokenError>>>,
        calls: Mutex<Vec<(Instant, Option<String>)>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<AcquiredToken, TokenError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        fn credentials_seen(&self) -> Vec<Option<String>> {
            self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn acquire_silent(
            &self,
            account: &SessionAccount,
        ) -> Result<AcquiredToken, TokenError> {
            let credential = account
                .refresh_credential
                .as_ref()
                .map(|c| c.expose_secret().to_string());
            self.calls.lock().unwrap().push((Instant::now(), credential));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TokenError::HttpError("script exhausted".into())))
        }
    }

    fn scheduled(outcome: ScheduleOutcome) -> RefreshEvents {
        match outcome {
            ScheduleOutcome::Scheduled(events) => events,
            ScheduleOutcome::NoExpiry => panic!("expected a schedule"),
        }
    }

    fn assert_near(actual: Duration, expected_min: Duration, expected_max: Duration) {
        assert!(
            actual >= expected_min && actual <= expected_max,
            "{actual:?} not within [{expected_min:?}, {expected_max:?}]"
        );
    }

    // -------------------------------------------------------------------------
    // Policy
    // -------------------------------------------------------------------------

    #[test]
    fn test_refresh_delay_clamps_to_minimum() {
        let policy = RefreshPolicy::default();
        let now_ms = 1_700_000_000_000;

        // expires in 30s: exp - 60s is in the past
        assert_eq!(
            policy.refresh_delay(1_700_000_030, now_ms),
            Duration::from_secs(1)
        );
        // already expired
        assert_eq!(
            policy.refresh_delay(1_600_000_000, now_ms),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_refresh_delay_uses_lead_time() {
        let policy = RefreshPolicy::default();
        let now_ms = 1_700_000_000_000;

        assert_eq!(
            policy.refresh_delay(1_700_000_120, now_ms),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.refresh_delay(1_700_003_600, now_ms + 500),
            Duration::from_millis(3_539_500)
        );
    }

    #[test]
    fn test_backoff_delays_double_from_base() {
        let policy = RefreshPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|a| policy.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_token_expiring_in_30s_refreshes_after_one_second() {
        let source = ScriptedSource::new(vec![opaque()]);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());
        let start = Instant::now();

        let mut events = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(30))
                .await
                .unwrap(),
        );

        assert!(matches!(events.recv().await, Some(RefreshEvent::Refreshed(_))));
        let calls = source.call_times();
        assert_eq!(calls.len(), 1);
        assert_near(
            calls[0] - start,
            Duration::from_secs(1),
            Duration::from_millis(1_010),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expiring_in_120s_refreshes_at_expiry_minus_lead() {
        let source = ScriptedSource::new(vec![opaque()]);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());
        let start = Instant::now();

        let mut events = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(120))
                .await
                .unwrap(),
        );

        assert!(matches!(events.recv().await, Some(RefreshEvent::Refreshed(_))));
        // exp has whole-second resolution, so up to one second earlier
        assert_near(
            source.call_times()[0] - start,
            Duration::from_secs(58),
            Duration::from_millis(60_010),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_back_off_then_exhaust() {
        let failures = (0..6)
            .map(|_| Err(TokenError::HttpError("503".into())))
            .collect();
        let source = ScriptedSource::new(failures);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());

        let mut events = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(30))
                .await
                .unwrap(),
        );

        match events.recv().await {
            Some(RefreshEvent::Exhausted(TokenError::HttpError(msg))) => assert_eq!(msg, "503"),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert!(events.recv().await.is_none());

        let calls = source.call_times();
        assert_eq!(calls.len(), 6, "initial attempt plus five retries");
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([2, 4, 8, 16, 32]) {
            assert_near(
                *gap,
                Duration::from_secs(expected),
                Duration::from_secs(expected) + Duration::from_millis(10),
            );
        }

        assert_eq!(scheduler.pending_timers().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.call_times().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interaction_required_is_terminal_immediately() {
        let source = ScriptedSource::new(vec![Err(TokenError::InteractionRequired(
            "invalid_grant".into(),
        ))]);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());

        let mut events = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(30))
                .await
                .unwrap(),
        );

        assert!(matches!(
            events.recv().await,
            Some(RefreshEvent::Exhausted(TokenError::InteractionRequired(_)))
        ));
        assert_eq!(source.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_success_resets_and_reschedules() {
        let source = ScriptedSource::new(vec![
            Err(TokenError::HttpError("flaky".into())),
            Ok(AcquiredToken {
                access_token: token_expiring_in(120),
                expires_at: None,
                refresh_credential: Some(SecretString::from("rt-1")),
            }),
            opaque(),
        ]);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());

        let mut events = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(30))
                .await
                .unwrap(),
        );

        assert!(matches!(events.recv().await, Some(RefreshEvent::Refreshed(_))));
        assert_eq!(scheduler.pending_timers().await.unwrap(), 1);
        assert!(matches!(events.recv().await, Some(RefreshEvent::Refreshed(_))));
        assert!(events.recv().await.is_none(), "opaque token ends the chain");

        let calls = source.call_times();
        assert_eq!(calls.len(), 3);
        assert_near(
            calls[1] - calls[0],
            Duration::from_secs(2),
            Duration::from_millis(2_010),
        );
        assert_near(
            calls[2] - calls[1],
            Duration::from_secs(58),
            Duration::from_millis(60_010),
        );

        assert_eq!(
            source.credentials_seen(),
            vec![
                Some("rt-0".to_string()),
                Some("rt-0".to_string()),
                Some("rt-1".to_string())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_twice_keeps_one_timer() {
        let source = ScriptedSource::new(vec![opaque()]);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());

        let mut first = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(3600))
                .await
                .unwrap(),
        );
        let mut second = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(30))
                .await
                .unwrap(),
        );

        assert_eq!(scheduler.pending_timers().await.unwrap(), 1);
        assert!(first.recv().await.is_none(), "replaced schedule ends");
        assert!(matches!(second.recv().await, Some(RefreshEvent::Refreshed(_))));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(source.call_times().len(), 1, "replaced timer never fired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounts_are_scheduled_independently() {
        let source = ScriptedSource::new(vec![]);
        let scheduler = RefreshScheduler::new(source, RefreshPolicy::default());

        let _a = scheduler
            .schedule(account("a"), &token_expiring_in(3600))
            .await
            .unwrap();
        let _b = scheduler
            .schedule(account("b"), &token_expiring_in(3600))
            .await
            .unwrap();

        assert_eq!(scheduler.pending_timers().await.unwrap(), 2);
        assert_eq!(scheduler.stop_all().await.unwrap(), 2);
        assert_eq!(scheduler.pending_timers().await.unwrap(), 0);
        assert_eq!(scheduler.stop_all().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unknown_account_is_noop() {
        let source = ScriptedSource::new(vec![]);
        let scheduler = RefreshScheduler::new(source, RefreshPolicy::default());
        let _events = scheduler
            .schedule(account("a"), &token_expiring_in(3600))
            .await
            .unwrap();

        assert!(!scheduler.stop(&AccountKey::new("nobody")).await.unwrap());
        assert_eq!(scheduler.pending_timers().await.unwrap(), 1);

        assert!(scheduler.stop(&AccountKey::new("a")).await.unwrap());
        assert!(!scheduler.stop(&AccountKey::new("a")).await.unwrap());
        assert_eq!(scheduler.pending_timers().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_without_expiry_is_noop() {
        let source = ScriptedSource::new(vec![]);
        let scheduler = RefreshScheduler::new(source, RefreshPolicy::default());
        let _events = scheduler
            .schedule(account("a"), &token_expiring_in(3600))
            .await
            .unwrap();

        let outcome = scheduler
            .schedule(account("a"), &SecretString::from("opaque-session-token"))
            .await
            .unwrap();

        assert!(matches!(outcome, ScheduleOutcome::NoExpiry));
        assert_eq!(
            scheduler.pending_timers().await.unwrap(),
            1,
            "existing schedule untouched"
        );
    }

    /// Blocks inside `acquire_silent` until released.
    struct GatedSource {
        started: Notify,
        release: Notify,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl TokenSource for GatedSource {
        async fn acquire_silent(&self, _: &SessionAccount) -> Result<AcquiredToken, TokenError> {
            *self.calls.lock().unwrap() += 1;
            self.started.notify_one();
            self.release.notified().await;
            Ok(AcquiredToken::new(token_expiring_in(120)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_inflight_acquisition_stays_stopped() {
        let source = Arc::new(GatedSource {
            started: Notify::new(),
            release: Notify::new(),
            calls: Mutex::new(0),
        });
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());

        let mut events = scheduled(
            scheduler
                .schedule(account("a"), &token_expiring_in(30))
                .await
                .unwrap(),
        );

        source.started.notified().await;
        assert_eq!(scheduler.pending_timers().await.unwrap(), 0);
        assert!(scheduler.stop(&AccountKey::new("a")).await.unwrap());
        source.release.notify_one();

        assert!(events.recv().await.is_none());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(scheduler.pending_timers().await.unwrap(), 0);
        assert_eq!(*source.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_event_stream_ends_schedule() {
        let source = ScriptedSource::new(vec![refreshed(token_expiring_in(120))]);
        let scheduler = RefreshScheduler::new(source.clone(), RefreshPolicy::default());

        let events = scheduler
            .schedule(account("a"), &token_expiring_in(30))
            .await
            .unwrap();
        drop(events);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.call_times().len(), 1);
        assert_eq!(scheduler.pending_timers().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_handle() {
        let source = ScriptedSource::new(vec![]);
        let scheduler = RefreshScheduler::new(source, RefreshPolicy::default());

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = scheduler
            .schedule(account("a"), &token_expiring_in(3600))
            .await;
        assert!(matches!(result, Err(TokenError::ChannelClosed)));
    }
}
