//! Shared wire and output types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One market row from the REST `/markets` endpoint.
///
/// Kalshi omits fields freely depending on market type, so everything
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Market {
    pub ticker: String,
    pub event_ticker: String,
    pub title: String,
    pub status: String,
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub no_bid: i64,
    pub no_ask: i64,
    pub last_price: i64,
    pub volume: i64,
    pub open_interest: i64,
    pub floor_strike: f64,
    pub cap_strike: f64,
    pub open_time: String,
    pub close_time: String,
    pub expiration_time: String,
    pub expected_expiration_time: String,
    pub result: String,
    pub subtitle: String,
    pub yes_sub_title: String,
    pub no_sub_title: String,
    pub custom_strike: serde_json::Value,
    pub rules_primary: String,
}

impl Market {
    /// Derive the strike from explicit cap/floor fields, falling back to the
    /// human-readable rules text ("... is at least 70000.00 ...").
    pub fn strike_price(&self) -> f64 {
        if self.cap_strike > 0.0 {
            return self.cap_strike;
        }
        if self.floor_strike > 0.0 {
            return self.floor_strike;
        }
        parse_rules_strike(&self.rules_primary).unwrap_or(0.0)
    }

    /// Expiry instant: expected expiration when present, else expiration.
    pub fn expiration_parsed(&self) -> Option<DateTime<Utc>> {
        let raw = if !self.expected_expiration_time.is_empty() {
            &self.expected_expiration_time
        } else {
            &self.expiration_time
        };
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn parse_rules_strike(rules: &str) -> Option<f64> {
    let rest = &rules[rules.find("is at least ")? + "is at least ".len()..];
    let num: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let strike: f64 = num.parse().ok()?;
    (strike > 0.0).then_some(strike)
}

/// One per-second output record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    #[serde(rename = "type")]
    pub kind: String,
    /// RFC 3339 with nanoseconds, UTC.
    pub ts: String,
    pub brti: f64,
    pub coinbase: f64,
    pub kraken: f64,
    pub bitstamp: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub markets: Vec<MarketSnap>,
}

/// Point-in-time snapshot of one contract inside a [`TickRecord`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnap {
    pub ticker: String,
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub last_price: i64,
    pub volume: i64,
    pub open_interest: i64,
    #[serde(skip_serializing_if = "strike_is_zero", default)]
    pub strike: f64,
    pub secs_left: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub result: String,
    /// (price_cents, quantity) levels sorted by price ascending.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub yes_book: Option<Vec<(i64, i64)>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub no_book: Option<Vec<(i64, i64)>>,
}

fn strike_is_zero(v: &f64) -> bool {
    *v == 0.0
}
