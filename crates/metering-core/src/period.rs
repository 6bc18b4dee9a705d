//! Billing periods and period keys
//!
//! A plan's allotment is metered per period key. The key for a timestamp is
//! derived from the plan's [`BillingPeriod`]; rollover needs no reset, a new
//! key simply starts at zero.

use crate::CoreError;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Billing period length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Default for BillingPeriod {
    fn default() -> Self {
        Self::Monthly
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    match date.and_hms_opt(0, 0, 0) {
        Some(naive) => Utc.from_utc_datetime(&naive),
        None => DateTime::<Utc>::MIN_UTC,
    }
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    fn start_date(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => date,
            Self::Weekly => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Self::Monthly => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date),
            Self::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }

    /// Get period start for a given timestamp
    pub fn period_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        midnight(self.start_date(ts.date_naive()))
    }

    /// Get period end (exclusive) for a given timestamp
    pub fn period_end(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.start_date(ts.date_naive());
        let end = match self {
            Self::Daily => start.succ_opt(),
            Self::Weekly => start.checked_add_signed(Duration::weeks(1)),
            Self::Monthly => start.checked_add_months(Months::new(1)),
            Self::Yearly => start.checked_add_months(Months::new(12)),
        };
        end.map(midnight).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Period key for a given timestamp
    pub fn key(&self, ts: DateTime<Utc>) -> PeriodKey {
        let date = ts.date_naive();
        let key = match self {
            Self::Daily => date.format("%Y-%m-%d").to_string(),
            Self::Weekly => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Self::Monthly => date.format("%Y-%m").to_string(),
            Self::Yearly => date.format("%Y").to_string(),
        };
        PeriodKey(key)
    }
}

/// Identifies one billing period, e.g. `2026-10`, `2026-W42`, `2026-10-18`, `2026`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The period length this key was produced by
    pub fn period(&self) -> BillingPeriod {
        match self.0.len() {
            4 => BillingPeriod::Yearly,
            7 => BillingPeriod::Monthly,
            8 => BillingPeriod::Weekly,
            _ => BillingPeriod::Daily,
        }
    }
}

fn parse_year(s: &str) -> Option<i32> {
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

impl FromStr for PeriodKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidPeriodKey(s.to_string());
        let valid = match s.len() {
            4 => parse_year(s).is_some(),
            7 => NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").is_ok(),
            8 => {
                let (year, week) = s.split_once("-W").ok_or_else(invalid)?;
                let year = parse_year(year).ok_or_else(invalid)?;
                let week: u32 = week.parse().map_err(|_| invalid())?;
                NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).is_some()
            }
            10 => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            _ => false,
        };
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(invalid())
        }
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
