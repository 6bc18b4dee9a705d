use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Tenant identifier owned by the surrounding CRM
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Independently metered resource category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPool {
    /// AI model consumption, in model units (tokens / 1k-token credits)
    AiUnits,
    /// Retrieval / knowledge-base lookups
    Retrieval,
    /// Audio minutes
    Audio,
    /// Image generations
    Image,
}

impl QuotaPool {
    pub const ALL: [QuotaPool; 4] = [Self::AiUnits, Self::Retrieval, Self::Audio, Self::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiUnits => "ai_units",
            Self::Retrieval => "retrieval",
            Self::Audio => "audio",
            Self::Image => "image",
        }
    }
}

impl FromStr for QuotaPool {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ai_units" => Ok(Self::AiUnits),
            "retrieval" => Ok(Self::Retrieval),
            "audio" => Ok(Self::Audio),
            "image" => Ok(Self::Image),
            _ => Err(CoreError::InvalidPool(s.to_string())),
        }
    }
}

impl std::fmt::Display for QuotaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ISO 4217 currency code, stored upper-case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(CoreError::InvalidCurrency(s.to_string()))
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
