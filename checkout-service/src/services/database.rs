//! PostgreSQL store for checkout-service.

use super::store::{
    AffiliateStore, ClickStats, CommissionStore, CouponStore, OrderStore, RedemptionWrite,
    SettledTransfer, TransferSettlement,
};
use crate::models::{
    Affiliate, AffiliateClick, AffiliateCommission, CommissionStatus, Coupon, CouponRedemption,
    FinancialTransaction, NewAffiliateClick, Order, OrderItem, OrderStatus, ProviderId,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, user_id, email, subtotal, discount, total, currency, \
    conversion_rate, payment_provider, payment_reference, provisional_reference, external_reference, status, \
    payment_status, coupon_code, affiliate_id, affiliate_link_id, affiliate_click_id, \
    referral_code, paid_at, created_at, updated_at";

const COMMISSION_COLUMNS: &str = "id, order_id, affiliate_id, order_total, commission_rate, \
    commission_amount, currency, status, fraud_score, fraud_notes, transfer_id, transfer_status, \
    transfer_attempts, transfer_error, created_at, updated_at, paid_at";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Add deltas to an affiliate's running totals inside `tx`.
async fn add_affiliate_totals(
    tx: &mut Transaction<'_, Postgres>,
    affiliate_id: Uuid,
    revenue: Decimal,
    owed: Decimal,
    paid: Decimal,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE affiliates
        SET total_revenue = total_revenue + $2,
            commission_owed = commission_owed + $3,
            commission_paid = commission_paid + $4
        WHERE id = $1
        "#,
    )
    .bind(affiliate_id)
    .bind(revenue)
    .bind(owed)
    .bind(paid)
    .execute(&mut **tx)
    .await
    .map_err(|e| db_error("Failed to update affiliate totals", e))?;
    Ok(())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(database_url), fields(service = "checkout-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_order(
        &self,
        operation: &str,
        filter: &str,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM orders WHERE payment_provider = $1 AND {} LIMIT 1",
            ORDER_COLUMNS, filter
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(provider.as_str())
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to look up order", e))?;

        timer.observe_duration();
        Ok(order)
    }
}

#[async_trait]
impl OrderStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, order, items), fields(order_id = %order.id))]
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_order"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, email, subtotal, discount, total, currency,
                conversion_rate, payment_provider, payment_reference, provisional_reference,
                external_reference, status, payment_status, coupon_code, affiliate_id,
                affiliate_link_id, affiliate_click_id, referral_code, paid_at, created_at,
                updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(&order.email)
        .bind(order.subtotal)
        .bind(order.discount)
        .bind(order.total)
        .bind(&order.currency)
        .bind(order.conversion_rate)
        .bind(order.payment_provider.as_str())
        .bind(&order.payment_reference)
        .bind(&order.provisional_reference)
        .bind(&order.external_reference)
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.coupon_code)
        .bind(order.affiliate_id)
        .bind(order.affiliate_link_id)
        .bind(order.affiliate_click_id)
        .bind(&order.referral_code)
        .bind(order.paid_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to insert order", e))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_id, variation_id, unit_price, quantity, total)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(item.id)
            .bind(item.order_id)
            .bind(item.product_id)
            .bind(item.variation_id)
            .bind(item.unit_price)
            .bind(item.quantity)
            .bind(item.total)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert order item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit order", e))?;

        timer.observe_duration();
        info!(items = items.len(), "Order persisted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order"])
            .start_timer();

        let sql = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get order", e))?;

        timer.observe_duration();
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["order_items"])
            .start_timer();

        let items = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, variation_id, unit_price, quantity, total
            FROM order_items WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list order items", e))?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn find_order_by_payment_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        self.fetch_order(
            "find_order_by_payment_reference",
            "payment_reference = $2",
            provider,
            reference,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn find_order_by_external_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        self.fetch_order(
            "find_order_by_external_reference",
            "(external_reference = $2 OR id::text = $2)",
            provider,
            reference,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn find_order_by_provisional_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        self.fetch_order(
            "find_order_by_provisional_reference",
            "provisional_reference = $2",
            provider,
            reference,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_unresolved_orders(
        &self,
        provider: ProviderId,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unresolved_orders"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {} FROM orders
            WHERE payment_provider = $1
              AND status = 'pending'
              AND payment_reference = provisional_reference
              AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
            ORDER_COLUMNS
        );
        let orders = sqlx::query_as::<_, Order>(&sql)
            .bind(provider.as_str())
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to scan unresolved orders", e))?;

        timer.observe_duration();
        Ok(orders)
    }

    #[instrument(skip(self))]
    async fn upgrade_payment_reference(
        &self,
        order_id: Uuid,
        provisional: &str,
        final_reference: &str,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upgrade_payment_reference"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE orders SET payment_reference = $3, updated_at = NOW()
            WHERE id = $1 AND payment_reference = $2
            "#,
        )
        .bind(order_id)
        .bind(provisional)
        .bind(final_reference)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upgrade payment reference", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_order"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                payment_status = $4,
                paid_at = CASE WHEN $3 = 'completed' THEN $5 ELSE paid_at END,
                updated_at = $5
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to.payment_status().as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to transition order", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn attach_affiliate(
        &self,
        order_id: Uuid,
        affiliate_id: Uuid,
        link_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["attach_affiliate"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE orders
            SET affiliate_id = $2, affiliate_link_id = COALESCE($3, affiliate_link_id), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(affiliate_id)
        .bind(link_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to attach affiliate", e))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl CouponStore for Database {
    #[instrument(skip(self))]
    async fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_coupon_by_code"])
            .start_timer();

        let coupon = sqlx::query_as::<_, Coupon>(
            r#"
            SELECT id, code, kind, value, min_subtotal, usage_limit, per_user_limit, stackable,
                   valid_from, valid_until, active, used_count, allowed_emails
            FROM coupons WHERE LOWER(code) = LOWER($1)
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to look up coupon", e))?;

        timer.observe_duration();
        Ok(coupon)
    }

    #[instrument(skip(self, email))]
    async fn count_user_redemptions(
        &self,
        coupon_id: Uuid,
        user_id: Option<Uuid>,
        email: &str,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_user_redemptions"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM coupon_redemptions
            WHERE coupon_id = $1
              AND (($2::uuid IS NOT NULL AND user_id = $2)
                OR ($2::uuid IS NULL AND LOWER(email) = LOWER($3)))
            "#,
        )
        .bind(coupon_id)
        .bind(user_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count redemptions", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self, redemption), fields(coupon_id = %redemption.coupon_id, order_id = %redemption.order_id))]
    async fn record_redemption(
        &self,
        redemption: &CouponRedemption,
    ) -> Result<RedemptionWrite, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_redemption"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO coupon_redemptions (id, coupon_id, user_id, email, order_id, amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (coupon_id, order_id) DO NOTHING
            "#,
        )
        .bind(redemption.id)
        .bind(redemption.coupon_id)
        .bind(redemption.user_id)
        .bind(&redemption.email)
        .bind(redemption.order_id)
        .bind(redemption.amount)
        .bind(redemption.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to insert redemption", e))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back redemption", e))?;
            timer.observe_duration();
            return Ok(RedemptionWrite::AlreadyRecorded);
        }

        let incremented = sqlx::query(
            r#"
            UPDATE coupons SET used_count = used_count + 1
            WHERE id = $1 AND (usage_limit IS NULL OR used_count < usage_limit)
            "#,
        )
        .bind(redemption.coupon_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to increment coupon usage", e))?
        .rows_affected();

        if incremented == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back redemption", e))?;
            timer.observe_duration();
            return Ok(RedemptionWrite::LimitReached);
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit redemption", e))?;

        timer.observe_duration();
        Ok(RedemptionWrite::Recorded)
    }

    #[instrument(skip(self))]
    async fn redemptions_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<CouponRedemption>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["redemptions_for_order"])
            .start_timer();

        let rows = sqlx::query_as::<_, CouponRedemption>(
            r#"
            SELECT id, coupon_id, user_id, email, order_id, amount, created_at
            FROM coupon_redemptions WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list redemptions", e))?;

        timer.observe_duration();
        Ok(rows)
    }
}

const AFFILIATE_COLUMNS: &str = "id, code, slug, email, user_id, status, affiliate_type, \
    commission_value, total_revenue, commission_owed, commission_paid, pix_key, auto_transfer, \
    minimum_payout";

const CLICK_COLUMNS: &str = "id, affiliate_id, link_id, ip, created_at, converted, converted_at, order_id";

#[async_trait]
impl AffiliateStore for Database {
    #[instrument(skip(self))]
    async fn get_affiliate(&self, id: Uuid) -> Result<Option<Affiliate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_affiliate"])
            .start_timer();

        let sql = format!("SELECT {} FROM affiliates WHERE id = $1", AFFILIATE_COLUMNS);
        let affiliate = sqlx::query_as::<_, Affiliate>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get affiliate", e))?;

        timer.observe_duration();
        Ok(affiliate)
    }

    #[instrument(skip(self))]
    async fn find_affiliate_by_code(&self, code: &str) -> Result<Option<Affiliate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_affiliate_by_code"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM affiliates WHERE LOWER(code) = LOWER($1) OR LOWER(slug) = LOWER($1) LIMIT 1",
            AFFILIATE_COLUMNS
        );
        let affiliate = sqlx::query_as::<_, Affiliate>(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to look up affiliate", e))?;

        timer.observe_duration();
        Ok(affiliate)
    }

    #[instrument(skip(self, click), fields(affiliate_id = %click.affiliate_id))]
    async fn insert_click(&self, click: &NewAffiliateClick) -> Result<AffiliateClick, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_click"])
            .start_timer();

        let sql = format!(
            "INSERT INTO affiliate_clicks (id, affiliate_id, link_id, ip) VALUES ($1, $2, $3, $4) RETURNING {}",
            CLICK_COLUMNS
        );
        let stored = sqlx::query_as::<_, AffiliateClick>(&sql)
            .bind(Uuid::new_v4())
            .bind(click.affiliate_id)
            .bind(click.link_id)
            .bind(&click.ip)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to record click", e))?;

        timer.observe_duration();
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn get_click(&self, id: Uuid) -> Result<Option<AffiliateClick>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_click"])
            .start_timer();

        let sql = format!("SELECT {} FROM affiliate_clicks WHERE id = $1", CLICK_COLUMNS);
        let click = sqlx::query_as::<_, AffiliateClick>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get click", e))?;

        timer.observe_duration();
        Ok(click)
    }

    #[instrument(skip(self))]
    async fn mark_click_converted(
        &self,
        click_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_click_converted"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE affiliate_clicks SET converted = TRUE, converted_at = $3, order_id = $2
            WHERE id = $1 AND converted = FALSE
            "#,
        )
        .bind(click_id)
        .bind(order_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark click converted", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn count_converted_clicks_from_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_converted_clicks_from_ip"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM affiliate_clicks
            WHERE ip = $1 AND converted = TRUE AND converted_at >= $2
            "#,
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count clicks by ip", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn click_stats(
        &self,
        affiliate_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<ClickStats, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["click_stats"])
            .start_timer();

        let (total, converted): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE converted)
            FROM affiliate_clicks
            WHERE affiliate_id = $1 AND created_at >= $2
            "#,
        )
        .bind(affiliate_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load click stats", e))?;

        timer.observe_duration();
        Ok(ClickStats { total, converted })
    }
}

#[async_trait]
impl CommissionStore for Database {
    #[instrument(skip(self, commission), fields(order_id = %commission.order_id))]
    async fn insert_commission(&self, commission: &AffiliateCommission) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_commission"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO affiliate_commissions (id, order_id, affiliate_id, order_total,
                commission_rate, commission_amount, currency, status, fraud_score, fraud_notes,
                transfer_id, transfer_status, transfer_attempts, transfer_error, created_at,
                updated_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(commission.id)
        .bind(commission.order_id)
        .bind(commission.affiliate_id)
        .bind(commission.order_total)
        .bind(commission.commission_rate)
        .bind(commission.commission_amount)
        .bind(&commission.currency)
        .bind(commission.status.as_str())
        .bind(commission.fraud_score)
        .bind(&commission.fraud_notes)
        .bind(&commission.transfer_id)
        .bind(commission.transfer_status.as_str())
        .bind(commission.transfer_attempts)
        .bind(&commission.transfer_error)
        .bind(commission.created_at)
        .bind(commission.updated_at)
        .bind(commission.paid_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to insert commission", e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back commission", e))?;
            timer.observe_duration();
            return Ok(false);
        }

        let (owed, paid) = if commission.status == CommissionStatus::Paid {
            (Decimal::ZERO, commission.commission_amount)
        } else {
            (commission.commission_amount, Decimal::ZERO)
        };
        add_affiliate_totals(&mut tx, commission.affiliate_id, commission.order_total, owed, paid)
            .await?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit commission", e))?;

        timer.observe_duration();
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn get_commission(&self, id: Uuid) -> Result<Option<AffiliateCommission>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_commission"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM affiliate_commissions WHERE id = $1",
            COMMISSION_COLUMNS
        );
        let row = sqlx::query_as::<_, AffiliateCommission>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get commission", e))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn commission_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<AffiliateCommission>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commission_for_order"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM affiliate_commissions WHERE order_id = $1",
            COMMISSION_COLUMNS
        );
        let row = sqlx::query_as::<_, AffiliateCommission>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get commission", e))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn list_commissions(
        &self,
        status: CommissionStatus,
        limit: i64,
    ) -> Result<Vec<AffiliateCommission>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_commissions"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM affiliate_commissions WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
            COMMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, AffiliateCommission>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list commissions", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_retryable_transfers(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<AffiliateCommission>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_retryable_transfers"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {} FROM affiliate_commissions
            WHERE status = 'pending'
              AND transfer_status = 'failed'
              AND fraud_notes IS NULL
              AND transfer_attempts < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            COMMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, AffiliateCommission>(&sql)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list retryable transfers", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self, settlement), fields(affiliate_id = %settlement.affiliate_id))]
    async fn settle_transfer(
        &self,
        settlement: &TransferSettlement<'_>,
    ) -> Result<SettledTransfer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_transfer"])
            .start_timer();

        let ids: Vec<Uuid> = settlement.commissions.iter().map(|c| c.id).collect();
        let expected: Vec<&str> = settlement.expected.iter().map(|s| s.as_str()).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let rows: Vec<(Uuid, Decimal)> = sqlx::query_as(
            r#"
            UPDATE affiliate_commissions
            SET status = 'paid',
                transfer_id = $3,
                transfer_status = 'succeeded',
                transfer_attempts = transfer_attempts + 1,
                transfer_error = NULL,
                paid_at = $4,
                updated_at = $4
            WHERE id = ANY($1) AND status = ANY($2)
            RETURNING id, commission_amount
            "#,
        )
        .bind(&ids)
        .bind(&expected)
        .bind(settlement.transfer_id)
        .bind(settlement.at)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record transfer", e))?;

        let settled = SettledTransfer {
            amount: rows.iter().map(|(_, amount)| *amount).sum(),
            commission_ids: rows.into_iter().map(|(id, _)| id).collect(),
        };

        if !settled.is_empty() {
            let entry = settlement.ledger_entry(settled.amount);
            sqlx::query(
                r#"
                INSERT INTO financial_transactions (id, kind, scope, reference, amount, currency, paid, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.id)
            .bind(&entry.kind)
            .bind(&entry.scope)
            .bind(&entry.reference)
            .bind(entry.amount)
            .bind(&entry.currency)
            .bind(entry.paid)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to append financial transaction", e))?;

            add_affiliate_totals(
                &mut tx,
                settlement.affiliate_id,
                Decimal::ZERO,
                -settled.amount,
                settled.amount,
            )
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transfer settlement", e))?;

        timer.observe_duration();
        Ok(settled)
    }

    #[instrument(skip(self))]
    async fn record_transfer_failure(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_transfer_failure"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE affiliate_commissions
            SET transfer_status = 'failed',
                transfer_attempts = transfer_attempts + 1,
                transfer_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'paid'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record transfer failure", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn approve_commission(&self, id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["approve_commission"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE affiliate_commissions SET status = 'approved', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to approve commission", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn financial_transactions(
        &self,
        scope: &str,
    ) -> Result<Vec<FinancialTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["financial_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, FinancialTransaction>(
            r#"
            SELECT id, kind, scope, reference, amount, currency, paid, created_at
            FROM financial_transactions WHERE scope = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list financial transactions", e))?;

        timer.observe_duration();
        Ok(rows)
    }
}
