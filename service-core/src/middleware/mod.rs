pub mod admin_auth;
pub mod metrics;
pub mod rate_limit;
pub mod tracing;
