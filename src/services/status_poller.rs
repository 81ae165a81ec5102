// services/status_poller.rs
//! Per-attempt status polling and local expiry.
//!
//! Every watched attempt gets two tasks sharing one `CancellationToken`:
//! a poll task that queries the gateway on a fixed interval, and a countdown
//! task that publishes the seconds left and marks the attempt `expired` when
//! its deadline passes. Whichever task settles the attempt cancels the token,
//! which stops the other and aborts any status query still in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::ledger::TransactionLedger;
use crate::models::payment_attempt::{Finalization, PaymentAttempt, TerminalOutcome};
use crate::services::gateway::{PaymentGateway, QueryStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The attempt reached a terminal state (by poll, callback or expiry).
    Settled(PaymentAttempt),
    /// Polling was stopped before the attempt settled.
    Cancelled,
}

#[derive(Clone)]
pub struct StatusPoller {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn TransactionLedger>,
    interval: Duration,
    query_timeout: Duration,
}

impl StatusPoller {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn TransactionLedger>,
        interval: Duration,
        query_timeout: Duration,
    ) -> Self {
        StatusPoller {
            gateway,
            ledger,
            interval,
            query_timeout,
        }
    }

    /// Starts the poll and countdown tasks for a pending attempt.
    pub fn spawn(&self, attempt: PaymentAttempt) -> PollHandle {
        let cancel = CancellationToken::new();
        let initial = attempt.seconds_remaining(Utc::now());
        let (remaining_tx, remaining_rx) = watch::channel(initial);

        let countdown_task = tokio::spawn(run_countdown(
            self.ledger.clone(),
            attempt.clone(),
            remaining_tx,
            cancel.clone(),
        ));

        let poll_task = tokio::spawn(run_poll(self.clone(), attempt.clone(), cancel.clone()));

        PollHandle {
            transaction_id: attempt.transaction_id,
            cancel,
            remaining: remaining_rx,
            poll_task,
            countdown_task,
        }
    }
}

pub struct PollHandle {
    pub transaction_id: String,
    cancel: CancellationToken,
    remaining: watch::Receiver<i64>,
    poll_task: JoinHandle<PollOutcome>,
    countdown_task: JoinHandle<()>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for both tasks to finish.
    pub async fn join(self) -> PollOutcome {
        let outcome = match self.poll_task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Poll task for {} failed: {}", self.transaction_id, e);
                PollOutcome::Cancelled
            }
        };
        if let Err(e) = self.countdown_task.await {
            error!("Countdown task for {} failed: {}", self.transaction_id, e);
        }
        outcome
    }
}

async fn run_poll(poller: StatusPoller, attempt: PaymentAttempt, cancel: CancellationToken) -> PollOutcome {
    let transaction_id = attempt.transaction_id.clone();
    let Some(checkout_request_id) = attempt.gateway_request_id.clone() else {
        warn!(transaction_id = %transaction_id, "Attempt has no checkout request id; relying on countdown");
        cancel.cancelled().await;
        return settled_or_cancelled(poller.ledger.as_ref(), &transaction_id).await;
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + poller.interval, poller.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A callback may have settled the attempt since the last tick.
        match poller.ledger.get(&transaction_id).await {
            Ok(Some(current)) if current.is_terminal() => {
                debug!(transaction_id = %transaction_id, status = %current.status, "Attempt already settled");
                cancel.cancel();
                return PollOutcome::Settled(current);
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(transaction_id = %transaction_id, "Attempt vanished from ledger; stopping poller");
                cancel.cancel();
                return PollOutcome::Cancelled;
            }
            Err(e) => warn!(transaction_id = %transaction_id, "Ledger read failed: {}", e),
        }

        let query = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(poller.query_timeout, poller.gateway.query(&checkout_request_id)) => result,
        };

        match query {
            Ok(Ok(QueryStatus::Final { result_code, description })) => {
                let outcome = TerminalOutcome::from_result_code(result_code, &description, None);
                match poller.ledger.finalize(&transaction_id, &outcome).await {
                    Ok(finalization) => {
                        if finalization.was_applied() {
                            info!(
                                transaction_id = %transaction_id,
                                result_code,
                                status = %outcome.status,
                                "Poll settled payment"
                            );
                        }
                        cancel.cancel();
                        return PollOutcome::Settled(finalization.into_attempt());
                    }
                    Err(e) => error!(transaction_id = %transaction_id, "Failed to record poll result: {}", e),
                }
            }
            Ok(Ok(QueryStatus::Pending)) => {
                debug!(transaction_id = %transaction_id, "Payment still pending");
            }
            Ok(Err(e)) => {
                warn!(transaction_id = %transaction_id, "Status query failed, retrying next tick: {}", e);
            }
            Err(_) => {
                warn!(transaction_id = %transaction_id, "Status query timed out, retrying next tick");
            }
        }
    }

    settled_or_cancelled(poller.ledger.as_ref(), &transaction_id).await
}

async fn settled_or_cancelled(ledger: &dyn TransactionLedger, transaction_id: &str) -> PollOutcome {
    match ledger.get(transaction_id).await {
        Ok(Some(attempt)) if attempt.is_terminal() => PollOutcome::Settled(attempt),
        _ => PollOutcome::Cancelled,
    }
}

async fn run_countdown(
    ledger: Arc<dyn TransactionLedger>,
    attempt: PaymentAttempt,
    remaining: watch::Sender<i64>,
    cancel: CancellationToken,
) {
    let left = (attempt.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let deadline = Instant::now() + left;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        remaining.send_replace(i64::try_from(left.as_secs()).unwrap_or(i64::MAX));
        if left.is_zero() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
            _ = ticker.tick() => {}
        }
    }

    match ledger.finalize(&attempt.transaction_id, &TerminalOutcome::expired()).await {
        Ok(Finalization::Applied(_)) => {
            info!(transaction_id = %attempt.transaction_id, order_id = %attempt.order_id, "Payment expired");
        }
        Ok(Finalization::Unchanged(current)) => {
            debug!(transaction_id = %attempt.transaction_id, status = %current.status, "Expiry found attempt settled");
        }
        Err(e) => {
            error!(transaction_id = %attempt.transaction_id, "Failed to expire attempt: {}", e);
        }
    }
    cancel.cancel();
}

struct LivePoller {
    cancel: CancellationToken,
    remaining: watch::Receiver<i64>,
}

/// Live pollers keyed by transaction id. Entries are removed once both
/// tasks of a poller have ended.
#[derive(Default)]
pub struct PollerRegistry {
    live: Mutex<HashMap<String, LivePoller>>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracking(&self, transaction_id: &str) -> bool {
        self.live
            .lock()
            .map(|live| live.contains_key(transaction_id))
            .unwrap_or(false)
    }

    /// Registers a poller. Returns `false` (and cancels the handle) if one is
    /// already running for that transaction.
    pub fn track(self: &Arc<Self>, handle: PollHandle) -> bool {
        {
            let Ok(mut live) = self.live.lock() else {
                handle.cancel();
                return false;
            };
            if live.contains_key(&handle.transaction_id) {
                handle.cancel();
                return false;
            }
            live.insert(
                handle.transaction_id.clone(),
                LivePoller {
                    cancel: handle.cancel.clone(),
                    remaining: handle.remaining.clone(),
                },
            );
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let transaction_id = handle.transaction_id.clone();
            let outcome = handle.join().await;
            debug!(transaction_id = %transaction_id, ?outcome, "Poller finished");
            if let Ok(mut live) = registry.live.lock() {
                live.remove(&transaction_id);
            }
        });
        true
    }

    pub fn cancel(&self, transaction_id: &str) -> bool {
        match self.live.lock() {
            Ok(live) => match live.get(transaction_id) {
                Some(poller) => {
                    poller.cancel.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn remaining_secs(&self, transaction_id: &str) -> Option<i64> {
        let live = self.live.lock().ok()?;
        live.get(transaction_id).map(|p| *p.remaining.borrow())
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}
