//! PostgreSQL ledger store
//!
//! Debits against one (tenant, pool) are serialized with a transaction-scoped
//! advisory lock, bounded by `lock_timeout`. Counter and package updates are
//! additionally conditional on the value read, so a debit can never apply
//! on top of a balance it did not see.

use crate::{
    Correlation, Cost, LedgerStore, LedgerTransaction, MeteringError, PackageDebit,
    PackagePurchase, PackageStatus, PeriodCounter, RecordQuery, Reservation, ReservationStatus,
    Result, ScheduledPlan, Tenant, UsageBreakdown, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::{Currency, DatabaseConfig, Money, PeriodKey, QuotaPool, TenantId};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Map a database error onto the ledger's error kinds
fn db_err(err: sqlx::Error) -> MeteringError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available, unique_violation
            Some("40001") | Some("40P01") | Some("55P03") | Some("23505") => {
                MeteringError::ConcurrencyConflict(db.message().to_string())
            }
            _ => MeteringError::Persistence(err.to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            MeteringError::Unavailable(err.to_string())
        }
        _ => MeteringError::Persistence(err.to_string()),
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| MeteringError::InvalidAmount(format!("{value} exceeds storage range")))
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| MeteringError::Persistence(format!("negative value in {column}: {value}")))
}

fn corrupt(what: &str, value: &str) -> MeteringError {
    MeteringError::Persistence(format!("unreadable {what} '{value}'"))
}

fn parse_pool(value: &str) -> Result<QuotaPool> {
    value.parse().map_err(|_| corrupt("pool", value))
}

fn parse_currency(value: &str) -> Result<Currency> {
    value.parse().map_err(|_| corrupt("currency", value))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(db_err)
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    let scheduled_plan = match (
        get::<Option<String>>(row, "scheduled_plan_id")?,
        get::<Option<DateTime<Utc>>>(row, "scheduled_effective_at")?,
    ) {
        (Some(plan_id), Some(effective_at)) => Some(ScheduledPlan {
            plan_id,
            effective_at,
        }),
        _ => None,
    };
    let overage_allowed = get::<Vec<String>>(row, "overage_pools")?
        .iter()
        .map(|pool| parse_pool(pool))
        .collect::<Result<BTreeSet<_>>>()?;

    Ok(Tenant {
        id: TenantId::new(get::<String>(row, "id")?),
        plan_id: get(row, "plan_id")?,
        scheduled_plan,
        overage_allowed,
        currency: parse_currency(&get::<String>(row, "currency")?)?,
        created_at: get(row, "created_at")?,
    })
}

fn counter_from_row(row: &PgRow) -> Result<PeriodCounter> {
    let period_key: String = get(row, "period_key")?;
    Ok(PeriodCounter {
        tenant_id: TenantId::new(get::<String>(row, "tenant_id")?),
        pool: parse_pool(&get::<String>(row, "pool")?)?,
        period_key: period_key
            .parse()
            .map_err(|_| corrupt("period key", &period_key))?,
        consumed: to_u64(get(row, "consumed")?, "consumed")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn package_from_row(row: &PgRow) -> Result<PackagePurchase> {
    let status: String = get(row, "status")?;
    let validity_days: i32 = get(row, "validity_days")?;
    Ok(PackagePurchase {
        id: get(row, "id")?,
        tenant_id: TenantId::new(get::<String>(row, "tenant_id")?),
        pool: parse_pool(&get::<String>(row, "pool")?)?,
        package_id: get(row, "package_id")?,
        quantity: to_u64(get(row, "quantity")?, "quantity")?,
        consumed: to_u64(get(row, "consumed")?, "consumed")?,
        status: PackageStatus::parse(&status).ok_or_else(|| corrupt("package status", &status))?,
        price: Cost {
            base: Money::new(
                get(row, "price_base")?,
                parse_currency(&get::<String>(row, "base_currency")?)?,
            ),
            local: Money::new(
                get(row, "price_local")?,
                parse_currency(&get::<String>(row, "local_currency")?)?,
            ),
        },
        validity_days: u32::try_from(validity_days)
            .map_err(|_| corrupt("validity", &validity_days.to_string()))?,
        created_at: get(row, "created_at")?,
        activated_at: get(row, "activated_at")?,
        expires_at: get(row, "expires_at")?,
        cancelled_at: get(row, "cancelled_at")?,
        payment_ref: get(row, "payment_ref")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<UsageRecord> {
    let period_key: String = get(row, "period_key")?;
    let Json(packages): Json<Vec<PackageDebit>> = get(row, "package_debits")?;
    let Json(attributes): Json<BTreeMap<String, String>> = get(row, "attributes")?;
    let list_cost = match (
        get::<Option<Decimal>>(row, "list_cost")?,
        get::<Option<String>>(row, "list_currency")?,
    ) {
        (Some(amount), Some(currency)) => Some(Money::new(amount, parse_currency(&currency)?)),
        _ => None,
    };

    Ok(UsageRecord {
        id: get(row, "id")?,
        tenant_id: TenantId::new(get::<String>(row, "tenant_id")?),
        pool: parse_pool(&get::<String>(row, "pool")?)?,
        amount: to_u64(get(row, "amount")?, "amount")?,
        breakdown: UsageBreakdown {
            included: to_u64(get(row, "included")?, "included")?,
            packages,
            overage: to_u64(get(row, "overage")?, "overage")?,
        },
        cost: Cost {
            base: Money::new(
                get(row, "cost_base")?,
                parse_currency(&get::<String>(row, "base_currency")?)?,
            ),
            local: Money::new(
                get(row, "cost_local")?,
                parse_currency(&get::<String>(row, "local_currency")?)?,
            ),
        },
        list_cost,
        period_key: period_key
            .parse()
            .map_err(|_| corrupt("period key", &period_key))?,
        plan_id: get(row, "plan_id")?,
        catalog_version: get(row, "catalog_version")?,
        reservation_id: get(row, "reservation_id")?,
        correlation: Correlation {
            idempotency_key: get(row, "idempotency_key")?,
            model: get(row, "model")?,
            attributes,
        },
        recorded_at: get(row, "recorded_at")?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
    let status: String = get(row, "status")?;
    let Json(attributes): Json<BTreeMap<String, String>> = get(row, "attributes")?;
    Ok(Reservation {
        id: get(row, "id")?,
        tenant_id: TenantId::new(get::<String>(row, "tenant_id")?),
        pool: parse_pool(&get::<String>(row, "pool")?)?,
        amount: to_u64(get(row, "amount")?, "amount")?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| corrupt("reservation status", &status))?,
        correlation: Correlation {
            idempotency_key: get(row, "idempotency_key")?,
            model: get(row, "model")?,
            attributes,
        },
        created_at: get(row, "created_at")?,
        expires_at: get(row, "expires_at")?,
        closed_at: get(row, "closed_at")?,
        record_id: get(row, "record_id")?,
    })
}

/// PostgreSQL-backed [`LedgerStore`]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    /// Connect using the database section of the configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(db_err)?;
        info!(
            max_connections = config.max_connections,
            "Connected to ledger database"
        );
        Ok(Self::with_pool(pool).with_lock_timeout(config.lock_timeout()))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MeteringError::Persistence(format!("migration failed: {e}")))?;
        info!("Ledger schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        let overage_pools: Vec<String> = tenant
            .overage_allowed
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO tenants (id, plan_id, scheduled_plan_id, scheduled_effective_at,
                                 overage_pools, currency, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                scheduled_plan_id = EXCLUDED.scheduled_plan_id,
                scheduled_effective_at = EXCLUDED.scheduled_effective_at,
                overage_pools = EXCLUDED.overage_pools,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(tenant.id.as_str())
        .bind(&tenant.plan_id)
        .bind(tenant.scheduled_plan.as_ref().map(|s| s.plan_id.clone()))
        .bind(tenant.scheduled_plan.as_ref().map(|s| s.effective_at))
        .bind(&overage_pools)
        .bind(tenant.currency.as_str())
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(tenant_from_row)
            .transpose()
    }

    async fn tenant_ids(&self) -> Result<Vec<TenantId>> {
        let rows = sqlx::query("SELECT id FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| get::<String>(row, "id").map(TenantId::new))
            .collect()
    }

    async fn period_consumed(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        period_key: &PeriodKey,
    ) -> Result<u64> {
        let consumed: Option<i64> = sqlx::query_scalar(
            "SELECT consumed FROM period_counters WHERE tenant_id = $1 AND pool = $2 AND period_key = $3",
        )
        .bind(tenant_id.as_str())
        .bind(pool.as_str())
        .bind(period_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        consumed.map_or(Ok(0), |c| to_u64(c, "consumed"))
    }

    async fn counters(&self, tenant_id: &TenantId) -> Result<Vec<PeriodCounter>> {
        let rows = sqlx::query(
            "SELECT * FROM period_counters WHERE tenant_id = $1 ORDER BY pool, period_key",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(counter_from_row).collect()
    }

    async fn insert_package(&self, purchase: &PackagePurchase) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO package_purchases (id, tenant_id, pool, package_id, quantity, consumed,
                status, price_base, base_currency, price_local, local_currency, validity_days,
                created_at, activated_at, expires_at, cancelled_at, payment_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(purchase.id)
        .bind(purchase.tenant_id.as_str())
        .bind(purchase.pool.as_str())
        .bind(&purchase.package_id)
        .bind(to_i64(purchase.quantity)?)
        .bind(to_i64(purchase.consumed)?)
        .bind(purchase.status.as_str())
        .bind(purchase.price.base.amount)
        .bind(purchase.price.base.currency.as_str())
        .bind(purchase.price.local.amount)
        .bind(purchase.price.local.currency.as_str())
        .bind(purchase.validity_days as i32)
        .bind(purchase.created_at)
        .bind(purchase.activated_at)
        .bind(purchase.expires_at)
        .bind(purchase.cancelled_at)
        .bind(&purchase.payment_ref)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn package(&self, purchase_id: Uuid) -> Result<Option<PackagePurchase>> {
        sqlx::query("SELECT * FROM package_purchases WHERE id = $1")
            .bind(purchase_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(package_from_row)
            .transpose()
    }

    async fn packages(
        &self,
        tenant_id: &TenantId,
        pool: Option<QuotaPool>,
    ) -> Result<Vec<PackagePurchase>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM package_purchases
            WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR pool = $2)
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(pool.map(|p| p.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(package_from_row).collect()
    }

    async fn activate_package(
        &self,
        purchase_id: Uuid,
        payment_ref: &str,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>> {
        sqlx::query(
            r#"
            UPDATE package_purchases
            SET status = 'active', payment_ref = $2, activated_at = $3, expires_at = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(purchase_id)
        .bind(payment_ref)
        .bind(activated_at)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(package_from_row)
        .transpose()
    }

    async fn cancel_package(
        &self,
        purchase_id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>> {
        sqlx::query(
            r#"
            UPDATE package_purchases SET status = 'cancelled', cancelled_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(purchase_id)
        .bind(cancelled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(package_from_row)
        .transpose()
    }

    async fn expire_packages(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            r#"
            UPDATE package_purchases SET status = 'expired'
            WHERE status = 'active' AND expires_at < $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<UsageRecord>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM usage_records WHERE TRUE");
        if let Some(tenant_id) = &query.tenant_id {
            builder
                .push(" AND tenant_id = ")
                .push_bind(tenant_id.as_str().to_string());
        }
        if let Some(pool) = query.pool {
            builder.push(" AND pool = ").push_bind(pool.as_str());
        }
        if let Some(period_key) = &query.period_key {
            builder
                .push(" AND period_key = ")
                .push_bind(period_key.as_str().to_string());
        }
        if let Some(from) = query.from {
            builder.push(" AND recorded_at >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            builder.push(" AND recorded_at < ").push_bind(to);
        }
        builder.push(" ORDER BY recorded_at, id");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn record(&self, record_id: Uuid) -> Result<Option<UsageRecord>> {
        sqlx::query("SELECT * FROM usage_records WHERE id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn record_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<UsageRecord>> {
        sqlx::query("SELECT * FROM usage_records WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(tenant_id.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        sqlx::query("SELECT * FROM reservations WHERE id = $1")
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(reservation_from_row)
            .transpose()
    }

    async fn held_reservations(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM reservations
            WHERE tenant_id = $1 AND pool = $2 AND status = 'held' AND expires_at >= $3
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(pool.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            r#"
            UPDATE reservations SET status = 'expired', closed_at = $1
            WHERE status = 'held' AND expires_at < $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn begin(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
    ) -> Result<Box<dyn LedgerTransaction>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // SET does not take bind parameters; the value is an integer we own
        let timeout_ms = self.lock_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = '{timeout_ms}ms'"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{tenant_id}/{pool}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        Ok(Box::new(PgTransaction {
            tx,
            tenant_id: tenant_id.clone(),
            pool,
        }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    tenant_id: TenantId,
    pool: QuotaPool,
}

#[async_trait]
impl LedgerTransaction for PgTransaction {
    async fn period_consumed(&mut self, period_key: &PeriodKey) -> Result<u64> {
        let consumed: Option<i64> = sqlx::query_scalar(
            "SELECT consumed FROM period_counters WHERE tenant_id = $1 AND pool = $2 AND period_key = $3",
        )
        .bind(self.tenant_id.as_str())
        .bind(self.pool.as_str())
        .bind(period_key.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        consumed.map_or(Ok(0), |c| to_u64(c, "consumed"))
    }

    async fn consumable_packages(&mut self, now: DateTime<Utc>) -> Result<Vec<PackagePurchase>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM package_purchases
            WHERE tenant_id = $1 AND pool = $2 AND status = 'active'
              AND expires_at >= $3 AND consumed < quantity
            ORDER BY expires_at, created_at, id
            "#,
        )
        .bind(self.tenant_id.as_str())
        .bind(self.pool.as_str())
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(package_from_row).collect()
    }

    async fn held_reservations(&mut self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM reservations
            WHERE tenant_id = $1 AND pool = $2 AND status = 'held' AND expires_at >= $3
            "#,
        )
        .bind(self.tenant_id.as_str())
        .bind(self.pool.as_str())
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn reservation(&mut self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        sqlx::query("SELECT * FROM reservations WHERE id = $1 FOR UPDATE")
            .bind(reservation_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(reservation_from_row)
            .transpose()
    }

    async fn record(&mut self, record_id: Uuid) -> Result<Option<UsageRecord>> {
        sqlx::query("SELECT * FROM usage_records WHERE id = $1")
            .bind(record_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn record_by_idempotency_key(&mut self, key: &str) -> Result<Option<UsageRecord>> {
        sqlx::query("SELECT * FROM usage_records WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(self.tenant_id.as_str())
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn debit_counter(
        &mut self,
        period_key: &PeriodKey,
        expected: u64,
        amount: u64,
    ) -> Result<u64> {
        let value = expected
            .checked_add(amount)
            .ok_or_else(|| MeteringError::InvalidAmount(format!("counter {period_key} overflow")))?;

        // A missing counter reads as zero, so only a zero expectation may create it
        let sql = if expected == 0 {
            r#"
            INSERT INTO period_counters (tenant_id, pool, period_key, consumed, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (tenant_id, pool, period_key) DO UPDATE
                SET consumed = EXCLUDED.consumed, updated_at = NOW()
                WHERE period_counters.consumed = $5
            RETURNING consumed
            "#
        } else {
            r#"
            UPDATE period_counters SET consumed = $4, updated_at = NOW()
            WHERE tenant_id = $1 AND pool = $2 AND period_key = $3 AND consumed = $5
            RETURNING consumed
            "#
        };

        let updated: Option<i64> = sqlx::query_scalar(sql)
            .bind(self.tenant_id.as_str())
            .bind(self.pool.as_str())
            .bind(period_key.as_str())
            .bind(to_i64(value)?)
            .bind(to_i64(expected)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;

        match updated {
            Some(consumed) => to_u64(consumed, "consumed"),
            None => Err(MeteringError::ConcurrencyConflict(format!(
                "counter {period_key} no longer reads {expected}"
            ))),
        }
    }

    async fn debit_package(&mut self, purchase_id: Uuid, expected: u64, amount: u64) -> Result<u64> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE package_purchases SET consumed = consumed + $2
            WHERE id = $1 AND tenant_id = $3 AND pool = $4 AND status = 'active'
              AND consumed = $5 AND consumed + $2 <= quantity
            RETURNING consumed
            "#,
        )
        .bind(purchase_id)
        .bind(to_i64(amount)?)
        .bind(self.tenant_id.as_str())
        .bind(self.pool.as_str())
        .bind(to_i64(expected)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        match updated {
            Some(consumed) => to_u64(consumed, "consumed"),
            None => Err(MeteringError::ConcurrencyConflict(format!(
                "purchase {purchase_id} cannot cover {amount} more units"
            ))),
        }
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (id, tenant_id, pool, amount, status, idempotency_key,
                model, attributes, created_at, expires_at, closed_at, record_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.tenant_id.as_str())
        .bind(reservation.pool.as_str())
        .bind(to_i64(reservation.amount)?)
        .bind(reservation.status.as_str())
        .bind(&reservation.correlation.idempotency_key)
        .bind(&reservation.correlation.model)
        .bind(Json(&reservation.correlation.attributes))
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .bind(reservation.closed_at)
        .bind(reservation.record_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn close_reservation(
        &mut self,
        reservation_id: Uuid,
        status: ReservationStatus,
        record_id: Option<Uuid>,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reservations SET status = $2, record_id = $3, closed_at = $4
            WHERE id = $1 AND tenant_id = $5 AND pool = $6 AND status = 'held'
            "#,
        )
        .bind(reservation_id)
        .bind(status.as_str())
        .bind(record_id)
        .bind(closed_at)
        .bind(self.tenant_id.as_str())
        .bind(self.pool.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(MeteringError::ConcurrencyConflict(format!(
                "reservation {reservation_id} is no longer held"
            )));
        }
        Ok(())
    }

    async fn append_record(&mut self, record: &UsageRecord) -> Result<()> {
        let (list_cost, list_currency) = match &record.list_cost {
            Some(money) => (Some(money.amount), Some(money.currency.as_str().to_string())),
            None => (None, None),
        };
        sqlx::query(
            r#"
            INSERT INTO usage_records (id, tenant_id, pool, amount, included, package_debits,
                overage, cost_base, base_currency, cost_local, local_currency, list_cost,
                list_currency, period_key, plan_id, catalog_version, reservation_id,
                idempotency_key, model, attributes, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id.as_str())
        .bind(record.pool.as_str())
        .bind(to_i64(record.amount)?)
        .bind(to_i64(record.breakdown.included)?)
        .bind(Json(&record.breakdown.packages))
        .bind(to_i64(record.breakdown.overage)?)
        .bind(record.cost.base.amount)
        .bind(record.cost.base.currency.as_str())
        .bind(record.cost.local.amount)
        .bind(record.cost.local.currency.as_str())
        .bind(list_cost)
        .bind(list_currency)
        .bind(record.period_key.as_str())
        .bind(&record.plan_id)
        .bind(&record.catalog_version)
        .bind(record.reservation_id)
        .bind(&record.correlation.idempotency_key)
        .bind(&record.correlation.model)
        .bind(Json(&record.correlation.attributes))
        .bind(record.recorded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgTransaction {
            tx,
            tenant_id,
            pool,
        } = *self;
        tx.commit().await.map_err(db_err)?;
        debug!(tenant_id = %tenant_id, pool = %pool, "Committed ledger transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_range_conversions() {
        assert_eq!(to_i64(42).unwrap(), 42);
        assert!(to_i64(u64::MAX).is_err());
        assert_eq!(to_u64(7, "consumed").unwrap(), 7);
        assert!(matches!(
            to_u64(-1, "consumed"),
            Err(MeteringError::Persistence(_))
        ));
    }

    #[test]
    fn test_pool_timeouts_are_transient() {
        assert!(db_err(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!db_err(sqlx::Error::RowNotFound).is_retryable());
    }
}
