//! Reconnect loop

use super::lifecycle::Lifecycle;
use super::policy::{RetryBudget, RetryPolicy};
use super::state::LinkState;
use crate::error::Action;
use crate::{Error, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why [`Supervisor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Shutdown requested or the session was interrupted
    Stopped,
    /// Retryable failures outlasted the retry budget
    RetriesExhausted,
    /// A failure that retrying cannot fix
    Aborted,
}

impl RunExit {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Aborted => "aborted",
        }
    }
}

/// Drives a [`Lifecycle`] through connect, register and drain, closing and
/// retrying on failure.
///
/// # Examples
///
/// ```ignore
/// let service = ConsumerService::new(driver, params)
///     .consumer(ConsumerSpec::new("jobs", handler(|_| Disposition::Ack)));
/// let mut supervisor = Supervisor::new(service, RetryPolicy::default());
/// let shutdown = supervisor.shutdown_token();
/// tokio::spawn(async move { tokio::signal::ctrl_c().await.ok(); shutdown.cancel(); });
/// let exit = supervisor.run().await;
/// ```
pub struct Supervisor<L> {
    lifecycle: L,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    state: LinkState,
    state_tx: watch::Sender<LinkState>,
}

impl<L: Lifecycle> Supervisor<L> {
    /// Create a supervisor with its own shutdown token
    pub fn new(lifecycle: L, policy: RetryPolicy) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            lifecycle,
            policy,
            shutdown: CancellationToken::new(),
            state: LinkState::Disconnected,
            state_tx,
        }
    }

    /// Use an externally owned shutdown token
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The lifecycle
    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    /// Consume the supervisor, returning the lifecycle
    pub fn into_inner(self) -> L {
        self.lifecycle
    }

    /// Run sessions until shutdown, an unrecoverable failure, or the retry
    /// budget runs out.
    ///
    /// Never returns an error. Retryable failures are logged and retried after
    /// the policy's interval; the budget is refilled after every successful
    /// connect. Cancelling the shutdown token interrupts a pending connect,
    /// registration or retry wait. A drain in progress finishes its batch
    /// first, so shutdown takes at most one drain wait. The session is still
    /// closed before returning.
    pub async fn run(&mut self) -> RunExit {
        let mut budget = RetryBudget::new(self.policy.max_retries);

        let exit = loop {
            let outcome = self.session(&mut budget).await;

            if let Err(e) = self.enter(LinkState::Closing) {
                break self.abort(&e);
            }
            self.lifecycle.close().await;
            if let Err(e) = self.enter(LinkState::Disconnected) {
                break self.abort(&e);
            }

            let error = match outcome {
                Ok(()) => break RunExit::Stopped,
                Err(_) if self.shutdown.is_cancelled() => break RunExit::Stopped,
                Err(e) => e,
            };

            match error.kind().action() {
                Action::Stop => {
                    tracing::info!("session interrupted, stopping");
                    break RunExit::Stopped;
                }
                Action::Abort => break self.abort(&error),
                Action::Retry => {
                    tracing::warn!(kind = %error.kind(), error = %error, "broker session failed");
                    if !budget.try_consume() {
                        tracing::error!(
                            "giving up after exhausting {} retries",
                            self.policy.max_retries
                        );
                        break RunExit::RetriesExhausted;
                    }
                    crate::metrics::counters::retry_scheduled(error.kind().as_str());

                    let interval = self.policy.retry_interval;
                    tracing::info!("waiting {} seconds before retry", interval.as_secs_f64());
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break RunExit::Stopped,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    tracing::info!("retrying now");
                }
            }
        };

        tracing::debug!(exit = exit.as_str(), "reconnect loop finished");
        crate::metrics::counters::run_exited(exit.as_str());
        exit
    }

    /// Connect, register and drain until failure (`Err`) or shutdown (`Ok`)
    async fn session(&mut self, budget: &mut RetryBudget) -> Result<()> {
        let shutdown = self.shutdown.clone();

        self.enter(LinkState::Connecting)?;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            result = self.lifecycle.connect() => result?,
        }
        self.enter(LinkState::Open)?;
        budget.reset();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            result = self.lifecycle.register() => result?,
        }
        self.enter(LinkState::Draining)?;

        // Batches always complete, including their acks
        while !shutdown.is_cancelled() {
            self.lifecycle.drain().await?;
        }
        Ok(())
    }

    fn enter(&mut self, next: LinkState) -> Result<()> {
        self.state.transition(next)?;
        self.state_tx.send_replace(next);
        tracing::trace!(state = %next, "link state changed");
        Ok(())
    }

    fn abort(&self, error: &Error) -> RunExit {
        tracing::error!(kind = %error.kind(), error = ?error, "unrecoverable broker failure");
        RunExit::Aborted
    }
}
