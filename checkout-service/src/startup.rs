//! Application startup and lifecycle management.
//!
//! Wires the storage backends, provider adapters and pipeline services into
//! one HTTP server, and owns the background tasks (side-effect worker, payout
//! scheduler, dedup eviction) that stop with it.

use crate::config::CheckoutConfig;
use crate::handlers;
use crate::services::commission::CommissionService;
use crate::services::currency::{CurrencyConverter, HttpRateSource};
use crate::services::notifications::{
    HttpNotifier, LogNotifier, Notifier, SideEffect, SideEffectQueue, SideEffectWorker,
};
use crate::services::payout::{HttpTransferGateway, PayoutConfig, TransferGateway};
use crate::services::providers::{
    HttpPaymentLookup, MercadoPagoAdapter, PaypalAdapter, ProviderAdapter, SignatureSettings,
    StripeAdapter,
};
use crate::services::{
    init_metrics, CheckoutService, Database, DedupStore, InMemoryDedupStore, InMemoryStore,
    PayoutOrchestrator, RedisDedupStore, Store, WebhookProcessor,
};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::{
    admin_auth::{require_internal_api_key, InternalApiKey},
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware},
    tracing::request_id_middleware,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub webhooks: Arc<WebhookProcessor>,
    pub checkout: CheckoutService,
    pub payouts: Arc<PayoutOrchestrator>,
    pub queue: SideEffectQueue,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
    worker: SideEffectWorker,
    dedup: Option<InMemoryDedupStore>,
    dedup_ttl: Duration,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application, choosing Postgres or the in-memory store from
    /// configuration.
    pub async fn build(config: CheckoutConfig) -> Result<Self, AppError> {
        let store: Arc<dyn Store> = match &config.database {
            Some(database) => {
                let db = Database::new(
                    database.url.expose_secret(),
                    database.max_connections,
                    database.min_connections,
                )
                .await?;
                db.run_migrations().await?;
                Arc::new(db)
            }
            None => {
                tracing::warn!(
                    "DATABASE_URL not set, using the in-memory store (single instance, not durable)"
                );
                Arc::new(InMemoryStore::new())
            }
        };

        Self::build_with_store(config, store).await
    }

    /// Build the application on an existing store.
    pub async fn build_with_store(
        config: CheckoutConfig,
        store: Arc<dyn Store>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let dedup_ttl = Duration::from_secs(config.dedup_ttl_secs.max(1));
        let (dedup, local_dedup): (Arc<dyn DedupStore>, Option<InMemoryDedupStore>) =
            match &config.redis_url {
                Some(url) => (
                    Arc::new(RedisDedupStore::connect(url.expose_secret(), dedup_ttl).await?),
                    None,
                ),
                None => {
                    tracing::warn!("REDIS_URL not set, webhook dedup is local to this instance");
                    let local = InMemoryDedupStore::new(dedup_ttl);
                    (Arc::new(local.clone()), Some(local))
                }
            };

        let notifications = &config.notifications;
        let (queue, rx) = SideEffectQueue::channel(notifications.queue_capacity);

        let gateway: Option<Arc<dyn TransferGateway>> = match &config.payouts.api_url {
            Some(url) => Some(Arc::new(HttpTransferGateway::new(
                url.clone(),
                expose(&config.payouts.api_token),
                Duration::from_millis(config.payouts.timeout_ms),
            )?)),
            None => {
                tracing::warn!("PAYOUT_API_URL not set, affiliate transfers are disabled");
                None
            }
        };
        let payouts = Arc::new(PayoutOrchestrator::new(
            store.clone(),
            gateway,
            queue.clone(),
            PayoutConfig {
                global_minimum: config.payouts.global_minimum,
                max_transfer_attempts: config.payouts.max_transfer_attempts,
                ..PayoutConfig::default()
            },
        ));

        let commissions = Arc::new(CommissionService::new(
            store.clone(),
            payouts.clone(),
            queue.clone(),
            config.fraud_threshold,
        ));

        let webhooks = Arc::new(WebhookProcessor::new(
            build_adapters(&config)?,
            dedup,
            store.clone(),
            &config.resolver,
            commissions,
            queue.clone(),
        ));

        let rates = HttpRateSource::new(
            config.currency.rates_url.clone(),
            Duration::from_millis(config.currency.timeout_ms),
        )?;
        let converter = Arc::new(CurrencyConverter::new(
            Arc::new(rates),
            Duration::from_secs(config.currency.cache_ttl_secs),
        ));
        let checkout = CheckoutService::new(store.clone(), converter);

        let notifier: Arc<dyn Notifier> = match &notifications.url {
            Some(url) => Arc::new(HttpNotifier::new(
                url.clone(),
                Duration::from_millis(notifications.timeout_ms),
            )?),
            None => Arc::new(LogNotifier),
        };
        let worker = SideEffectWorker::new(
            rx,
            notifier,
            Some(payouts.clone()),
            Duration::from_secs(notifications.max_retry_secs),
        );

        let state = AppState {
            store,
            webhooks,
            checkout,
            payouts,
            queue,
        };
        let router = build_router(
            state.clone(),
            InternalApiKey(config.internal_api_key.expose_secret().clone()),
            config.clicks_per_minute,
        );

        // Port 0 binds a random port for testing
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!(
            service = %config.service_name,
            port = http_port,
            "Checkout service listening"
        );

        Ok(Self {
            http_port,
            listener,
            router,
            state,
            worker,
            dedup: local_dedup,
            dedup_ttl,
            sweep_interval: Duration::from_secs(config.payouts.sweep_interval_secs.max(1)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Cancelling this token drains the server and stops background tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the server and background tasks until the shutdown token fires.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let Self {
            listener,
            router,
            state,
            worker,
            dedup,
            dedup_ttl,
            sweep_interval,
            shutdown,
            ..
        } = self;

        let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(worker.run(shutdown.clone()))];
        if state.payouts.transfers_enabled() {
            tasks.push(tokio::spawn(run_payout_scheduler(
                state.payouts.clone(),
                state.queue.clone(),
                sweep_interval,
                shutdown.clone(),
            )));
        }
        if let Some(dedup) = dedup {
            tasks.push(tokio::spawn(run_dedup_eviction(
                dedup,
                dedup_ttl,
                shutdown.clone(),
            )));
        }

        let server_shutdown = shutdown.clone();
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;

        shutdown.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }

        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }
        result
    }
}

fn expose(secret: &Option<Secret<String>>) -> Option<String> {
    secret.as_ref().map(|s| s.expose_secret().clone())
}

fn build_adapters(config: &CheckoutConfig) -> Result<Vec<Arc<dyn ProviderAdapter>>, AppError> {
    let lookup = HttpPaymentLookup::new(
        config.mercadopago.api_url.clone(),
        expose(&config.mercadopago.access_token),
        Duration::from_millis(config.mercadopago.timeout_ms),
    )?;

    Ok(vec![
        Arc::new(StripeAdapter::new(
            SignatureSettings::new(
                expose(&config.stripe.webhook_secret),
                config.stripe.signature_policy,
            ),
            config.stripe.tolerance_secs,
        )),
        Arc::new(PaypalAdapter::new(
            SignatureSettings::new(
                expose(&config.paypal.webhook_secret),
                config.paypal.signature_policy,
            ),
            config.paypal.webhook_id.clone(),
            config.paypal.tolerance_secs,
        )),
        Arc::new(MercadoPagoAdapter::new(
            SignatureSettings::new(
                expose(&config.mercadopago.webhook_secret),
                config.mercadopago.signature_policy,
            ),
            Arc::new(lookup),
            config.mercadopago.tolerance_secs,
        )),
    ])
}

fn build_router(state: AppState, api_key: InternalApiKey, clicks_per_minute: u32) -> Router {
    let admin = Router::new()
        .route("/commissions", get(handlers::admin::list_commissions))
        .route(
            "/commissions/:id/approve",
            post(handlers::admin::approve_commission),
        )
        .route("/payouts/sweep", post(handlers::admin::run_payout_sweep))
        .route("/payouts/retry", post(handlers::admin::retry_failed_transfers))
        .route_layer(from_fn_with_state(api_key.clone(), require_internal_api_key));

    // Prices and promotions arrive already looked up by the storefront, so
    // only the storefront backend may finalise orders.
    let checkout = Router::new()
        .route("/checkout/orders", post(handlers::checkout::create_order))
        .route_layer(from_fn_with_state(api_key, require_internal_api_key));

    let clicks = Router::new()
        .route("/affiliates/clicks", post(handlers::affiliates::record_click))
        .route_layer(from_fn_with_state(
            create_ip_rate_limiter(clicks_per_minute, 60),
            ip_rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/webhooks/stripe", post(handlers::webhooks::stripe))
        .route("/webhooks/paypal", post(handlers::webhooks::paypal))
        .route("/webhooks/mercadopago", post(handlers::webhooks::mercadopago))
        .merge(checkout)
        .merge(clicks)
        .nest("/admin", admin)
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .with_state(state)
}

/// Retry failed automatic transfers, then queue a consolidated sweep.
async fn run_payout_scheduler(
    payouts: Arc<PayoutOrchestrator>,
    queue: SideEffectQueue,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately; wait a full period before paying.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Payout scheduler shutting down");
                break;
            }
            _ = interval.tick() => {
                match payouts.retry_failed_transfers().await {
                    Ok(report) => tracing::info!(?report, "Failed transfer retry finished"),
                    Err(e) => tracing::error!(error = %e, "Failed transfer retry errored"),
                }
                queue.enqueue(SideEffect::PayoutSweep);
            }
        }
    }
}

async fn run_dedup_eviction(
    dedup: InMemoryDedupStore,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = dedup.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = dedup.len(), "Evicted expired dedup claims");
                }
            }
        }
    }
}
