//! Graceful shutdown with bounded polling and forced escalation.
//!
//! ```text
//!   Signal ──► Wait(delay) ──► Poll ──► Done(Graceful)
//!                 ▲             │
//!                 └─ Wait(int) ◄┤ pending
//!                               │ timeout / unexpected state
//!                               ▼
//!                           Escalate ──► Done(Forced)
//! ```
//!
//! A failed shutdown request does not abort the machine: the domain may
//! already be off, and the polls decide what state it is really in.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{HypervisorError, ReconcileError};
use crate::traits::HypervisorClient;
use crate::types::{DomainState, LiveHandle};

/// Timing of the shutdown poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Wait before the first poll.
    pub delay: Duration,
    /// Wait between later polls.
    pub min_interval: Duration,
    /// Overall budget, measured from the shutdown request.
    pub timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            min_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Classification of one state poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Still on its way down.
    Pending,
    /// Shut off.
    Satisfied,
    /// A state the guest should not be in after a shutdown request.
    Unexpected,
}

impl PollStatus {
    pub fn classify(state: DomainState) -> Self {
        match state {
            DomainState::ShutOff => Self::Satisfied,
            // Guests often keep reporting running for a while after ACPI
            DomainState::Running | DomainState::Blocked | DomainState::ShuttingDown => Self::Pending,
            DomainState::NoState
            | DomainState::Paused
            | DomainState::Crashed
            | DomainState::PmSuspended
            | DomainState::Unknown(_) => Self::Unexpected,
        }
    }
}

/// Why the machine fell back to a forced destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EscalationReason {
    TimedOut,
    UnexpectedState(DomainState),
    PollFailed(String),
}

/// How the domain reached shutoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    Graceful,
    Forced(EscalationReason),
    /// The domain disappeared while we were waiting for it.
    Vanished,
}

/// Result of a shutdown run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    /// Number of state polls issued.
    pub polls: u32,
    /// Time from the shutdown request to completion.
    pub elapsed: Duration,
    /// The tolerated shutdown-request failure, if there was one.
    pub signal_error: Option<String>,
}

enum Phase {
    Signal,
    Wait(Duration),
    Poll,
    Escalate(EscalationReason),
    Done(ShutdownOutcome),
}

/// Drives one domain from running to shut off.
pub struct ShutdownMachine<'a> {
    client: &'a dyn HypervisorClient,
    clock: &'a dyn Clock,
    policy: ShutdownPolicy,
}

impl<'a> ShutdownMachine<'a> {
    pub fn new(client: &'a dyn HypervisorClient, clock: &'a dyn Clock, policy: ShutdownPolicy) -> Self {
        Self { client, clock, policy }
    }

    /// Shut the domain down, escalating to a forced destroy when it does not
    /// get there in time.
    ///
    /// Only a failed destroy is an error; every other failure either is
    /// tolerated or leads to escalation.
    #[instrument(skip(self, handle), fields(identity = %handle.identity()))]
    pub async fn run(&self, handle: &LiveHandle) -> Result<ShutdownReport, ReconcileError> {
        let started = self.clock.now();
        let deadline = started + self.policy.timeout;
        let mut polls: u32 = 0;
        let mut signal_error = None;
        let mut phase = Phase::Signal;

        loop {
            phase = match phase {
                Phase::Signal => {
                    match self.client.shutdown(handle).await {
                        Ok(()) => info!("Shutdown requested"),
                        Err(source) => {
                            let err = ReconcileError::Signal {
                                kind: handle.kind(),
                                identity: handle.identity(),
                                source,
                            };
                            warn!(error = %err, "Shutdown request failed, polling state anyway");
                            signal_error = Some(err.to_string());
                        }
                    }
                    Phase::Wait(self.policy.delay)
                }

                Phase::Wait(interval) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        Phase::Escalate(EscalationReason::TimedOut)
                    } else {
                        self.clock.sleep(interval.min(deadline - now)).await;
                        Phase::Poll
                    }
                }

                Phase::Poll => {
                    polls = polls.saturating_add(1);
                    match self.client.domain_state(handle).await {
                        Ok(state) => {
                            debug!(poll = polls, state = %state, "Polled domain state");
                            match PollStatus::classify(state) {
                                PollStatus::Satisfied => Phase::Done(ShutdownOutcome::Graceful),
                                PollStatus::Pending => Phase::Wait(self.policy.min_interval),
                                PollStatus::Unexpected => {
                                    Phase::Escalate(EscalationReason::UnexpectedState(state))
                                }
                            }
                        }
                        Err(e) if e.is_not_found() => Phase::Done(ShutdownOutcome::Vanished),
                        Err(e) => Phase::Escalate(EscalationReason::PollFailed(e.to_string())),
                    }
                }

                Phase::Escalate(reason) => {
                    warn!(?reason, polls, "Domain did not shut down, forcing it off");
                    match self.client.destroy(handle, true).await {
                        Ok(()) => Phase::Done(ShutdownOutcome::Forced(reason)),
                        Err(source) => Phase::Done(self.settle_failed_destroy(handle, source).await?),
                    }
                }

                Phase::Done(outcome) => {
                    let elapsed = self.clock.now().saturating_duration_since(started);
                    info!(?outcome, polls, elapsed_ms = elapsed.as_millis() as u64, "Shutdown finished");
                    return Ok(ShutdownReport {
                        outcome,
                        polls,
                        elapsed,
                        signal_error,
                    });
                }
            };
        }
    }
}

impl ShutdownMachine<'_> {
    /// A destroy refused because nothing is running means the guest got to
    /// shutoff between the last poll and the destroy. Confirm with one more
    /// query before treating the failure as fatal.
    async fn settle_failed_destroy(
        &self,
        handle: &LiveHandle,
        source: HypervisorError,
    ) -> Result<ShutdownOutcome, ReconcileError> {
        if matches!(source, HypervisorError::InvalidState(_)) {
            match self.client.domain_state(handle).await {
                Ok(DomainState::ShutOff) => {
                    info!("Domain reached shutoff before the destroy landed");
                    return Ok(ShutdownOutcome::Graceful);
                }
                Err(e) if e.is_not_found() => return Ok(ShutdownOutcome::Vanished),
                Ok(state) => debug!(state = %state, "Domain still not shut off after refused destroy"),
                Err(e) => debug!(error = %e, "State query after refused destroy failed"),
            }
        }

        Err(ReconcileError::Destroy {
            kind: handle.kind(),
            identity: handle.identity(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::handle::HandleGuard;
    use crate::mock::{MockClient, MockOp, ShutdownBehavior};
    use crate::types::ObjectKind;

    async fn running_domain(client: &MockClient) -> HandleGuard<'_> {
        let handle = client
            .define(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
            .await
            .unwrap();
        client.start(&handle).await.unwrap();
        HandleGuard::new(client, handle)
    }

    #[tokio::test]
    async fn test_graceful_on_second_poll() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client
            .set_shutdown_behavior(&guard.identity(), ShutdownBehavior::AfterPolls(2))
            .unwrap();

        let report = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap();

        assert_eq!(report.outcome, ShutdownOutcome::Graceful);
        assert_eq!(report.polls, 2);
        assert_eq!(report.elapsed, Duration::from_secs(10));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5), Duration::from_secs(5)]);
        assert_eq!(client.calls(MockOp::Destroy), 0);
    }

    #[tokio::test]
    async fn test_timeout_escalates_once() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client
            .set_shutdown_behavior(&guard.identity(), ShutdownBehavior::Never)
            .unwrap();

        let report = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap();

        assert_eq!(report.outcome, ShutdownOutcome::Forced(EscalationReason::TimedOut));
        assert_eq!(report.polls, 36);
        assert_eq!(report.elapsed, Duration::from_secs(180));
        assert_eq!(client.calls(MockOp::Destroy), 1);
        assert_eq!(client.last_destroy_graceful(), Some(true));
        assert_eq!(
            client.state_of(ObjectKind::Domain, &guard.identity()),
            Some(DomainState::ShutOff)
        );
    }

    #[tokio::test]
    async fn test_last_sleep_is_clamped_to_deadline() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client
            .set_shutdown_behavior(&guard.identity(), ShutdownBehavior::Never)
            .unwrap();

        let policy = ShutdownPolicy {
            delay: Duration::from_secs(2),
            min_interval: Duration::from_secs(4),
            timeout: Duration::from_secs(9),
        };
        let report = ShutdownMachine::new(&client, &clock, policy)
            .run(guard.handle())
            .await
            .unwrap();

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(3)]
        );
        assert_eq!(report.polls, 3);
        assert_eq!(report.elapsed, Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_signal_failure_is_tolerated() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        // Defined but never started: the shutdown request is invalid
        let handle = client
            .define(ObjectKind::Domain, "<domain><name>idle</name></domain>")
            .await
            .unwrap();
        let guard = HandleGuard::new(&client, handle);

        let report = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap();

        assert_eq!(report.outcome, ShutdownOutcome::Graceful);
        assert_eq!(report.polls, 1);
        assert!(report.signal_error.is_some());
        assert_eq!(client.calls(MockOp::Destroy), 0);
    }

    #[tokio::test]
    async fn test_unexpected_state_escalates_immediately() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client
            .set_state(ObjectKind::Domain, &guard.identity(), DomainState::Paused)
            .unwrap();

        let report = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap();

        assert_eq!(
            report.outcome,
            ShutdownOutcome::Forced(EscalationReason::UnexpectedState(DomainState::Paused))
        );
        assert_eq!(report.polls, 1);
        assert_eq!(client.calls(MockOp::Destroy), 1);
    }

    #[tokio::test]
    async fn test_poll_failure_escalates() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client.fail_next(MockOp::DomainState);

        let report = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap();

        assert!(matches!(
            report.outcome,
            ShutdownOutcome::Forced(EscalationReason::PollFailed(_))
        ));
        assert_eq!(client.calls(MockOp::Destroy), 1);
    }

    #[tokio::test]
    async fn test_destroy_failure_is_reported() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client
            .set_shutdown_behavior(&guard.identity(), ShutdownBehavior::Never)
            .unwrap();
        client.fail_next(MockOp::Destroy);

        let err = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Destroy { .. }));
    }

    #[tokio::test]
    async fn test_shutoff_just_before_destroy_is_graceful() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        client
            .set_shutdown_behavior(&guard.identity(), ShutdownBehavior::RacesDestroy)
            .unwrap();

        let report = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap();

        assert_eq!(report.outcome, ShutdownOutcome::Graceful);
        assert_eq!(report.polls, 36);
        assert_eq!(client.calls(MockOp::Destroy), 1);
        assert_eq!(client.calls(MockOp::DomainState), 37);
        assert_eq!(
            client.state_of(ObjectKind::Domain, &guard.identity()),
            Some(DomainState::ShutOff)
        );
    }

    #[tokio::test]
    async fn test_refused_destroy_on_running_domain_is_an_error() {
        let client = MockClient::new();
        let clock = ManualClock::new();
        let guard = running_domain(&client).await;
        // Paused escalates, and a paused domain still counts as active
        client
            .set_state(ObjectKind::Domain, &guard.identity(), DomainState::Paused)
            .unwrap();
        client.fail_next(MockOp::Destroy);

        let err = ShutdownMachine::new(&client, &clock, ShutdownPolicy::default())
            .run(guard.handle())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Destroy {
                source: HypervisorError::Rejected(_),
                ..
            }
        ));
    }

    #[test]
    fn test_classify() {
        assert_eq!(PollStatus::classify(DomainState::ShutOff), PollStatus::Satisfied);
        assert_eq!(PollStatus::classify(DomainState::ShuttingDown), PollStatus::Pending);
        assert_eq!(PollStatus::classify(DomainState::Running), PollStatus::Pending);
        assert_eq!(PollStatus::classify(DomainState::Crashed), PollStatus::Unexpected);
        assert_eq!(PollStatus::classify(DomainState::Unknown(9)), PollStatus::Unexpected);
    }
}
