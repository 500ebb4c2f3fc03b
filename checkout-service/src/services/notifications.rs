//! Deferred side effects.
//!
//! Webhook handlers must acknowledge within the provider's timeout, so
//! emails, alerts and payout sweeps are queued here and delivered by a
//! background worker that retries with exponential backoff.

use crate::services::metrics::record_side_effect;
use crate::services::payout::PayoutOrchestrator;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    OrderCompleted {
        order_id: Uuid,
        email: String,
        total: Decimal,
        currency: String,
    },
    SecurityAlert {
        provider: String,
        order_id: Uuid,
        reason: String,
    },
    CommissionReview {
        commission_id: Uuid,
        affiliate_id: Uuid,
        score: u32,
        notes: String,
    },
    PayoutSent {
        affiliate_id: Uuid,
        email: String,
        amount: Decimal,
        currency: String,
        transfer_id: String,
    },
    PayoutSweep,
}

impl SideEffect {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderCompleted { .. } => "order_completed",
            Self::SecurityAlert { .. } => "security_alert",
            Self::CommissionReview { .. } => "commission_review",
            Self::PayoutSent { .. } => "payout_sent",
            Self::PayoutSweep => "payout_sweep",
        }
    }
}

/// Delivers notifications to the outside world (email, chat, pager).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, effect: &SideEffect) -> Result<(), anyhow::Error>;
}

/// Used when no notification endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, effect: &SideEffect) -> Result<(), anyhow::Error> {
        tracing::info!(kind = effect.kind(), payload = ?effect, "Notification");
        Ok(())
    }
}

/// POSTs each notification as JSON.
pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, effect: &SideEffect) -> Result<(), anyhow::Error> {
        let response = self.client.post(&self.url).json(effect).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("notification endpoint returned {}: {}", status, body);
        }
        Ok(())
    }
}

/// Sending half of the side-effect queue.
#[derive(Clone)]
pub struct SideEffectQueue {
    tx: mpsc::Sender<SideEffect>,
}

impl SideEffectQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SideEffect>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Never blocks the caller; a full queue drops the effect with an error log.
    pub fn enqueue(&self, effect: SideEffect) {
        let kind = effect.kind();
        match self.tx.try_send(effect) {
            Ok(()) => record_side_effect(kind, "queued"),
            Err(e) => {
                record_side_effect(kind, "dropped");
                tracing::error!(kind, error = %e, "Side-effect queue rejected item");
            }
        }
    }
}

pub struct SideEffectWorker {
    rx: mpsc::Receiver<SideEffect>,
    notifier: Arc<dyn Notifier>,
    payouts: Option<Arc<PayoutOrchestrator>>,
    max_elapsed: Duration,
}

impl SideEffectWorker {
    pub fn new(
        rx: mpsc::Receiver<SideEffect>,
        notifier: Arc<dyn Notifier>,
        payouts: Option<Arc<PayoutOrchestrator>>,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            rx,
            notifier,
            payouts,
            max_elapsed,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Side-effect worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Side-effect worker shutting down");
                    break;
                }
                effect = self.rx.recv() => {
                    match effect {
                        Some(effect) => self.handle(effect).await,
                        None => {
                            tracing::info!("Side-effect queue closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, effect: SideEffect) {
        let kind = effect.kind();

        if matches!(effect, SideEffect::PayoutSweep) {
            match &self.payouts {
                Some(payouts) => {
                    let report = payouts.sweep("queued").await;
                    record_side_effect(kind, if report.is_ok() { "delivered" } else { "failed" });
                    if let Err(e) = report {
                        tracing::error!(error = %e, "Queued payout sweep failed");
                    }
                }
                None => tracing::warn!("Payout sweep requested but payouts are not configured"),
            }
            return;
        }

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        let result = retry(backoff, || async {
            self.notifier
                .notify(&effect)
                .await
                .map_err(backoff::Error::transient)
        })
        .await;

        match result {
            Ok(()) => record_side_effect(kind, "delivered"),
            Err(e) => {
                record_side_effect(kind, "failed");
                tracing::error!(kind, error = %e, "Side effect failed after retries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyNotifier {
        failures_left: AtomicUsize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, _effect: &SideEffect) -> Result<(), anyhow::Error> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("temporarily unavailable");
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_retries_until_delivered() {
        let notifier = Arc::new(FlakyNotifier {
            failures_left: AtomicUsize::new(2),
            delivered: AtomicUsize::new(0),
        });
        let (queue, rx) = SideEffectQueue::channel(8);
        let worker = SideEffectWorker::new(rx, notifier.clone(), None, Duration::from_secs(10));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        queue.enqueue(SideEffect::SecurityAlert {
            provider: "stripe".into(),
            order_id: Uuid::new_v4(),
            reason: "amount mismatch".into(),
        });

        for _ in 0..100 {
            if notifier.delivered.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn effects_serialize_with_kind_tag() {
        let json = serde_json::to_value(SideEffect::PayoutSweep).unwrap();
        assert_eq!(json["kind"], "payout_sweep");
    }
}
