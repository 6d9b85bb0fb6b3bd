//! Core data types for market-data aggregation.
//!
//! This module defines the fundamental data structures:
//!
//! - [`Symbol`] - Trading symbol/ticker
//! - [`Market`] - Exchange group a symbol trades on
//! - [`MarketStatus`] - Live trading/holiday state of a market
//! - [`Payload`] - Opaque upstream data
//! - [`FetchOptions`] - Per-call options handed to a receiver
//! - [`StorageClassification`] - Category tag for persisted data

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DataError, Result};

/// Opaque data returned by an upstream receiver.
pub type Payload = serde_json::Value;

/// Longest symbol accepted by [`Symbol::parse`].
pub const MAX_SYMBOL_LEN: usize = 32;

/// A trading symbol/ticker.
///
/// Symbols are automatically uppercased on creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Creates a new symbol from a string, converting to uppercase.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    /// Parses and validates a raw symbol.
    ///
    /// Leading and trailing whitespace is trimmed. Empty symbols, symbols longer
    /// than [`MAX_SYMBOL_LEN`] and symbols containing characters other than ASCII
    /// alphanumerics, `.`, `-` or `_` are rejected.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidSymbol`] when the symbol is malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| DataError::InvalidSymbol {
            symbol: raw.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("symbol is empty"));
        }
        if trimmed.len() > MAX_SYMBOL_LEN {
            return Err(invalid("symbol is too long"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(invalid("symbol contains unsupported characters"));
        }

        Ok(Self::new(trimmed))
    }

    /// Returns the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Infers the market this symbol trades on.
    #[must_use]
    pub fn market(&self) -> Market {
        Market::infer(self)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Market (exchange group) a symbol trades on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Market {
    /// Mainland China A-shares (Shanghai and Shenzhen).
    Cn,
    /// Hong Kong.
    Hk,
    /// United States.
    Us,
}

impl Market {
    /// All known markets.
    pub const ALL: [Self; 3] = [Self::Cn, Self::Hk, Self::Us];

    /// Infers the market of a symbol from its format.
    ///
    /// Rules, first match wins:
    /// - `.HK` suffix, or a bare 4-5 digit code, is Hong Kong
    /// - `.SH`/`.SZ` suffix, or a bare 6 digit code, is mainland China
    /// - `.US` suffix or anything else is United States
    #[must_use]
    pub fn infer(symbol: &Symbol) -> Self {
        let s = symbol.as_str();

        if let Some((code, suffix)) = s.rsplit_once('.') {
            match suffix {
                "HK" => return Self::Hk,
                "SH" | "SZ" | "SS" => return Self::Cn,
                "US" => return Self::Us,
                _ => {
                    if code.chars().all(|c| c.is_ascii_digit()) {
                        return Self::from_numeric_len(code.len());
                    }
                }
            }
        }

        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            return Self::from_numeric_len(s.len());
        }

        Self::Us
    }

    const fn from_numeric_len(len: usize) -> Self {
        match len {
            4 | 5 => Self::Hk,
            _ => Self::Cn,
        }
    }

    /// Short code used in keys and logs.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Cn => "CN",
            Self::Hk => "HK",
            Self::Us => "US",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Market {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CN" | "SH" | "SZ" => Ok(Self::Cn),
            "HK" => Ok(Self::Hk),
            "US" => Ok(Self::Us),
            other => Err(DataError::Other(format!("unknown market: {other}"))),
        }
    }
}

/// Whether a market is currently in a trading session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingStatus {
    /// A trading session is open.
    Trading,
    /// No session is open.
    #[default]
    Closed,
}

/// Live state of a market as reported by a market-status provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketStatus {
    /// Current session state.
    pub status: TradingStatus,
    /// Whether today is an exchange holiday.
    pub is_holiday: bool,
}

impl MarketStatus {
    /// A market with an open session.
    #[must_use]
    pub const fn trading() -> Self {
        Self {
            status: TradingStatus::Trading,
            is_holiday: false,
        }
    }

    /// A market outside its sessions on a normal day.
    #[must_use]
    pub const fn closed() -> Self {
        Self {
            status: TradingStatus::Closed,
            is_holiday: false,
        }
    }

    /// A market closed for a holiday.
    #[must_use]
    pub const fn holiday() -> Self {
        Self {
            status: TradingStatus::Closed,
            is_holiday: true,
        }
    }

    /// Returns true if a session is open.
    #[must_use]
    pub const fn is_trading(&self) -> bool {
        matches!(self.status, TradingStatus::Trading)
    }
}

/// Options forwarded to a receiver for a single fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Capability requested from the receiver (e.g. `get-stock-quote`).
    pub receiver_type: String,
    /// Preferred upstream provider, if any.
    pub provider: Option<String>,
    /// Market the symbol was grouped under.
    pub market: Option<Market>,
    /// Fields the caller wants in the payload.
    pub include_fields: Vec<String>,
    /// Fields the caller does not want in the payload.
    pub exclude_fields: Vec<String>,
}

/// Category tag attached to data handed to the storage collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClassification {
    /// Real-time quotes.
    StockQuote,
    /// Company/instrument reference data.
    StockBasicInfo,
    /// Index quotes.
    IndexQuote,
    /// Anything else.
    #[default]
    General,
}

impl StorageClassification {
    /// Derives a classification from a receiver capability name.
    #[must_use]
    pub fn from_receiver_type(receiver_type: &str) -> Self {
        let lower = receiver_type.to_ascii_lowercase();
        if lower.contains("index") {
            Self::IndexQuote
        } else if lower.contains("basic-info") || lower.contains("basic_info") {
            Self::StockBasicInfo
        } else if lower.contains("quote") {
            Self::StockQuote
        } else {
            Self::General
        }
    }

    /// Stable string form used by persistent storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StockQuote => "stock_quote",
            Self::StockBasicInfo => "stock_basic_info",
            Self::IndexQuote => "index_quote",
            Self::General => "general",
        }
    }

    /// Inverse of [`StorageClassification::as_str`]; unknown tags map to `General`.
    #[must_use]
    pub fn from_stored(tag: &str) -> Self {
        match tag {
            "stock_quote" => Self::StockQuote,
            "stock_basic_info" => Self::StockBasicInfo,
            "index_quote" => Self::IndexQuote,
            _ => Self::General,
        }
    }
}
