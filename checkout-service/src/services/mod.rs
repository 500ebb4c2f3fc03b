pub mod attribution;
pub mod checkout;
pub mod commission;
pub mod coupons;
pub mod currency;
pub mod database;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod fraud;
pub mod idempotency;
pub mod memory;
pub mod metrics;
pub mod notifications;
pub mod payout;
pub mod pipeline;
pub mod pricing;
pub mod providers;
pub mod resolver;
pub mod store;

pub use checkout::CheckoutService;
pub use database::Database;
pub use idempotency::{DedupStore, InMemoryDedupStore, RedisDedupStore};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use payout::PayoutOrchestrator;
pub use pipeline::{WebhookOutcome, WebhookProcessor};
pub use store::Store;
