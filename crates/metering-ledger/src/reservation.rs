//! Capacity reservations
//!
//! A reservation earmarks capacity in one pool for the duration of a
//! long-running action. It does not pin specific sources: the sources are
//! chosen when the reservation is committed with the actual amount.

use crate::Correlation;
use chrono::{DateTime, Utc};
use metering_core::{QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "held" => Some(Self::Held),
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub pool: QuotaPool,
    /// Estimated amount held against capacity
    pub amount: u64,
    pub status: ReservationStatus,
    /// Carried onto the usage record at commit
    pub correlation: Correlation,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Usage record written by the commit
    pub record_id: Option<Uuid>,
}

impl Reservation {
    pub fn hold(
        tenant_id: &TenantId,
        pool: QuotaPool,
        amount: u64,
        correlation: Correlation,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.clone(),
            pool,
            amount,
            status: ReservationStatus::Held,
            correlation,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            closed_at: None,
            record_id: None,
        }
    }

    /// Past its TTL, whether or not the sweep has marked it
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ReservationStatus::Expired => true,
            ReservationStatus::Held => now > self.expires_at,
            ReservationStatus::Committed | ReservationStatus::Released => false,
        }
    }

    /// Still holding capacity at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && !self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reservation_lapses_after_ttl() {
        let now = Utc::now();
        let reservation = Reservation::hold(
            &TenantId::new("acme"),
            QuotaPool::AiUnits,
            100,
            Correlation::new(),
            now,
            Duration::seconds(300),
        );

        assert!(reservation.is_live(now));
        assert!(reservation.is_live(now + Duration::seconds(300)));
        assert!(!reservation.is_live(now + Duration::seconds(301)));
        assert!(reservation.is_expired(now + Duration::seconds(301)));
    }

    #[test]
    fn test_oversized_ttl_saturates() {
        let now = Utc::now();
        let reservation = Reservation::hold(
            &TenantId::new("acme"),
            QuotaPool::AiUnits,
            100,
            Correlation::new(),
            now,
            Duration::days(365 * 1_000_000),
        );

        assert_eq!(reservation.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(reservation.is_live(now + Duration::days(365 * 100)));
    }

    #[test]
    fn test_closed_reservation_never_expires() {
        let now = Utc::now();
        let mut reservation = Reservation::hold(
            &TenantId::new("acme"),
            QuotaPool::Audio,
            5,
            Correlation::new(),
            now,
            Duration::seconds(1),
        );
        reservation.status = ReservationStatus::Committed;

        assert!(!reservation.is_expired(now + Duration::days(1)));
        assert!(!reservation.is_live(now));
    }
}
