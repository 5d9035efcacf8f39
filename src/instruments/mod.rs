//! Instrument model for the fixed-income blotter.
//!
//! The four security kinds share a common header and carry kind-specific
//! payloads as a tagged variant. The delta engine and the filter evaluator
//! never look at the typed structs; they work on the flat field-map view
//! keyed by wire field names, so a field is addressable the same way in a
//! delta, a predicate, and an admin merge update.

pub mod seed;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Wall-clock now truncated to milliseconds, the wire resolution of every
/// timestamp field.
pub fn now_millis() -> DateTime<Utc> {
    let ms = Utc::now().timestamp_millis();
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Security kind discriminant, serialized as its wire tag ("Bond", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityType {
    Bond,
    Swap,
    Future,
    Option,
}

impl SecurityType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Bond" => Some(SecurityType::Bond),
            "Swap" => Some(SecurityType::Swap),
            "Future" => Some(SecurityType::Future),
            "Option" => Some(SecurityType::Option),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityType::Bond => "Bond",
            SecurityType::Swap => "Swap",
            SecurityType::Future => "Future",
            SecurityType::Option => "Option",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Jpy,
}

impl Currency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            "GBP" => Some(Currency::Gbp),
            "JPY" => Some(Currency::Jpy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Jpy => "JPY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sector {
    Government,
    Agency,
    Corporate,
    Financial,
    Municipal,
}

impl Sector {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GOVERNMENT" => Some(Sector::Government),
            "AGENCY" => Some(Sector::Agency),
            "CORPORATE" => Some(Sector::Corporate),
            "FINANCIAL" => Some(Sector::Financial),
            "MUNICIPAL" => Some(Sector::Municipal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Government => "GOVERNMENT",
            Sector::Agency => "AGENCY",
            Sector::Corporate => "CORPORATE",
            Sector::Financial => "FINANCIAL",
            Sector::Municipal => "MUNICIPAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Rating {
    Aaa,
    Aa,
    A,
    Bbb,
    Bb,
    B,
    Nr,
}

impl Rating {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AAA" => Some(Rating::Aaa),
            "AA" => Some(Rating::Aa),
            "A" => Some(Rating::A),
            "BBB" => Some(Rating::Bbb),
            "BB" => Some(Rating::Bb),
            "B" => Some(Rating::B),
            "NR" => Some(Rating::Nr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Aaa => "AAA",
            Rating::Aa => "AA",
            Rating::A => "A",
            Rating::Bbb => "BBB",
            Rating::Bb => "BB",
            Rating::B => "B",
            Rating::Nr => "NR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentStatus {
    Active,
    Suspended,
    Matured,
}

impl InstrumentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(InstrumentStatus::Active),
            "SUSPENDED" => Some(InstrumentStatus::Suspended),
            "MATURED" => Some(InstrumentStatus::Matured),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentStatus::Active => "ACTIVE",
            InstrumentStatus::Suspended => "SUSPENDED",
            InstrumentStatus::Matured => "MATURED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CALL" => Some(OptionType::Call),
            "PUT" => Some(OptionType::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CALL",
            OptionType::Put => "PUT",
        }
    }
}

/// A typed field value as it appears in deltas and in the field-map view.
///
/// Timestamps carry epoch milliseconds so equality is integer equality.
/// Lists compare element-wise. Numbers compare with plain `==`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Num(f64),
    /// Epoch milliseconds.
    Time(i64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            FieldValue::Int(n) => Some(*n as f64),
            FieldValue::Time(ms) => Some(*ms as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON value from an admin merge request.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CoreError> {
        match value {
            serde_json::Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FieldValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(FieldValue::Num(f))
                } else {
                    Err(CoreError::invalid(format!("unrepresentable number {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(FieldValue::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(FieldValue::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::List),
            other => Err(CoreError::invalid(format!(
                "unsupported field value {other}"
            ))),
        }
    }
}

/// Flat view of an instrument: wire field name to typed value.
pub type FieldMap = BTreeMap<&'static str, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondFields {
    pub price: f64,
    #[serde(rename = "yield")]
    pub yield_to_maturity: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub coupon: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub maturity_date: DateTime<Utc>,
    pub duration: f64,
    pub convexity: f64,
    pub credit_spread: f64,
    pub last_trade_price: f64,
    pub last_trade_size: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_trade_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapFields {
    pub swap_rate: f64,
    pub bid_rate: f64,
    pub ask_rate: f64,
    pub notional: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub maturity_date: DateTime<Utc>,
    pub fixed_dv01: f64,
    pub floating_dv01: f64,
    pub last_trade_price: f64,
    pub last_trade_size: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_trade_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FutureFields {
    pub price: f64,
    pub implied_rate: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub contract_month: String,
    pub open_interest: i64,
    pub volume: i64,
    pub last_trade_price: f64,
    pub last_trade_size: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_trade_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionFields {
    pub premium: f64,
    pub strike_price: f64,
    pub option_type: OptionType,
    pub underlying_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiry_date: DateTime<Utc>,
    pub implied_vol: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub intrinsic_value: f64,
    pub time_value: f64,
    pub last_trade_price: f64,
    pub last_trade_size: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_trade_time: DateTime<Utc>,
}

impl OptionFields {
    /// Recompute intrinsic and time value against the underlying's mark.
    pub fn recompute_value(&mut self, underlying_mark: f64) {
        self.intrinsic_value = match self.option_type {
            OptionType::Call => (underlying_mark - self.strike_price).max(0.0),
            OptionType::Put => (self.strike_price - underlying_mark).max(0.0),
        };
        self.time_value = (self.premium - self.intrinsic_value).max(0.0);
    }

    /// Clamp delta to the conventional range for the option type.
    pub fn clamp_delta(&mut self) {
        self.delta = match self.option_type {
            OptionType::Call => self.delta.clamp(0.0, 1.0),
            OptionType::Put => self.delta.clamp(-1.0, 0.0),
        };
    }
}

/// Kind-specific payload, tagged by `securityType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "securityType")]
pub enum KindFields {
    Bond(BondFields),
    Swap(SwapFields),
    Future(FutureFields),
    Option(OptionFields),
}

/// An instrument record. `Clone` is the snapshot operation: both the
/// `published` baseline and the `initial-data` payloads are clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    #[serde(rename = "instrumentId")]
    pub id: String,
    pub description: String,
    pub currency: Currency,
    pub sector: Sector,
    pub rating: Rating,
    pub status: InstrumentStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: KindFields,
}

impl Instrument {
    pub fn security_type(&self) -> SecurityType {
        match self.kind {
            KindFields::Bond(_) => SecurityType::Bond,
            KindFields::Swap(_) => SecurityType::Swap,
            KindFields::Future(_) => SecurityType::Future,
            KindFields::Option(_) => SecurityType::Option,
        }
    }

    /// Advance `lastUpdate` to `now`, keeping it strictly monotonic even if
    /// two mutations land within the same millisecond.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_update {
            self.last_update = now;
        } else {
            self.last_update = self.last_update + chrono::Duration::milliseconds(1);
        }
    }

    /// Flatten into the wire-named field map used by the delta engine and
    /// the filter evaluator.
    pub fn field_map(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("instrumentId", FieldValue::Text(self.id.clone()));
        map.insert("description", FieldValue::Text(self.description.clone()));
        map.insert(
            "securityType",
            FieldValue::Text(self.security_type().as_str().to_string()),
        );
        map.insert("currency", FieldValue::Text(self.currency.as_str().to_string()));
        map.insert("sector", FieldValue::Text(self.sector.as_str().to_string()));
        map.insert("rating", FieldValue::Text(self.rating.as_str().to_string()));
        map.insert("status", FieldValue::Text(self.status.as_str().to_string()));
        map.insert(
            "lastUpdate",
            FieldValue::Time(self.last_update.timestamp_millis()),
        );

        match &self.kind {
            KindFields::Bond(b) => {
                map.insert("price", FieldValue::Num(b.price));
                map.insert("yield", FieldValue::Num(b.yield_to_maturity));
                map.insert("bidPrice", FieldValue::Num(b.bid_price));
                map.insert("askPrice", FieldValue::Num(b.ask_price));
                map.insert("coupon", FieldValue::Num(b.coupon));
                map.insert(
                    "maturityDate",
                    FieldValue::Time(b.maturity_date.timestamp_millis()),
                );
                map.insert("duration", FieldValue::Num(b.duration));
                map.insert("convexity", FieldValue::Num(b.convexity));
                map.insert("creditSpread", FieldValue::Num(b.credit_spread));
                map.insert("lastTradePrice", FieldValue::Num(b.last_trade_price));
                map.insert("lastTradeSize", FieldValue::Num(b.last_trade_size));
                map.insert(
                    "lastTradeTime",
                    FieldValue::Time(b.last_trade_time.timestamp_millis()),
                );
            }
            KindFields::Swap(s) => {
                map.insert("swapRate", FieldValue::Num(s.swap_rate));
                map.insert("bidRate", FieldValue::Num(s.bid_rate));
                map.insert("askRate", FieldValue::Num(s.ask_rate));
                map.insert("notional", FieldValue::Num(s.notional));
                map.insert(
                    "maturityDate",
                    FieldValue::Time(s.maturity_date.timestamp_millis()),
                );
                map.insert("fixedDv01", FieldValue::Num(s.fixed_dv01));
                map.insert("floatingDv01", FieldValue::Num(s.floating_dv01));
                map.insert("lastTradePrice", FieldValue::Num(s.last_trade_price));
                map.insert("lastTradeSize", FieldValue::Num(s.last_trade_size));
                map.insert(
                    "lastTradeTime",
                    FieldValue::Time(s.last_trade_time.timestamp_millis()),
                );
            }
            KindFields::Future(f) => {
                map.insert("price", FieldValue::Num(f.price));
                map.insert("impliedRate", FieldValue::Num(f.implied_rate));
                map.insert("bidPrice", FieldValue::Num(f.bid_price));
                map.insert("askPrice", FieldValue::Num(f.ask_price));
                map.insert(
                    "contractMonth",
                    FieldValue::Text(f.contract_month.clone()),
                );
                map.insert("openInterest", FieldValue::Int(f.open_interest));
                map.insert("volume", FieldValue::Int(f.volume));
                map.insert("lastTradePrice", FieldValue::Num(f.last_trade_price));
                map.insert("lastTradeSize", FieldValue::Num(f.last_trade_size));
                map.insert(
                    "lastTradeTime",
                    FieldValue::Time(f.last_trade_time.timestamp_millis()),
                );
            }
            KindFields::Option(o) => {
                map.insert("premium", FieldValue::Num(o.premium));
                map.insert("strikePrice", FieldValue::Num(o.strike_price));
                map.insert(
                    "optionType",
                    FieldValue::Text(o.option_type.as_str().to_string()),
                );
                map.insert("underlyingId", FieldValue::Text(o.underlying_id.clone()));
                map.insert(
                    "expiryDate",
                    FieldValue::Time(o.expiry_date.timestamp_millis()),
                );
                map.insert("impliedVol", FieldValue::Num(o.implied_vol));
                map.insert("delta", FieldValue::Num(o.delta));
                map.insert("gamma", FieldValue::Num(o.gamma));
                map.insert("theta", FieldValue::Num(o.theta));
                map.insert("vega", FieldValue::Num(o.vega));
                map.insert("intrinsicValue", FieldValue::Num(o.intrinsic_value));
                map.insert("timeValue", FieldValue::Num(o.time_value));
                map.insert("lastTradePrice", FieldValue::Num(o.last_trade_price));
                map.insert("lastTradeSize", FieldValue::Num(o.last_trade_size));
                map.insert(
                    "lastTradeTime",
                    FieldValue::Time(o.last_trade_time.timestamp_millis()),
                );
            }
        }
        map
    }

    /// Assign one field by wire name. Used by admin merge updates and by the
    /// delta round-trip property: applying an emitted delta to the previous
    /// published snapshot reproduces the current state.
    pub fn apply_field(&mut self, name: &str, value: &FieldValue) -> Result<(), CoreError> {
        match name {
            "instrumentId" | "securityType" => {
                return Err(CoreError::invalid(format!("field {name} is immutable")));
            }
            "description" => {
                self.description = require_text(name, value)?.to_string();
                return Ok(());
            }
            "currency" => {
                let raw = require_text(name, value)?;
                self.currency = Currency::parse(raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown currency '{raw}'")))?;
                return Ok(());
            }
            "sector" => {
                let raw = require_text(name, value)?;
                self.sector = Sector::parse(raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown sector '{raw}'")))?;
                return Ok(());
            }
            "rating" => {
                let raw = require_text(name, value)?;
                self.rating = Rating::parse(raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown rating '{raw}'")))?;
                return Ok(());
            }
            "status" => {
                let raw = require_text(name, value)?;
                self.status = InstrumentStatus::parse(raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown status '{raw}'")))?;
                return Ok(());
            }
            "lastUpdate" => {
                self.last_update = require_time(name, value)?;
                return Ok(());
            }
            _ => {}
        }

        match &mut self.kind {
            KindFields::Bond(b) => match name {
                "price" => b.price = require_non_negative(name, value)?,
                "yield" => b.yield_to_maturity = require_num(name, value)?,
                "bidPrice" => b.bid_price = require_non_negative(name, value)?,
                "askPrice" => b.ask_price = require_non_negative(name, value)?,
                "coupon" => b.coupon = require_num(name, value)?,
                "maturityDate" => b.maturity_date = require_time(name, value)?,
                "duration" => b.duration = require_num(name, value)?,
                "convexity" => b.convexity = require_num(name, value)?,
                "creditSpread" => b.credit_spread = require_num(name, value)?,
                "lastTradePrice" => b.last_trade_price = require_non_negative(name, value)?,
                "lastTradeSize" => b.last_trade_size = require_non_negative(name, value)?,
                "lastTradeTime" => b.last_trade_time = require_time(name, value)?,
                _ => return Err(unknown_field(name, SecurityType::Bond)),
            },
            KindFields::Swap(s) => match name {
                "swapRate" => s.swap_rate = require_num(name, value)?,
                "bidRate" => s.bid_rate = require_num(name, value)?,
                "askRate" => s.ask_rate = require_num(name, value)?,
                "notional" => s.notional = require_non_negative(name, value)?,
                "maturityDate" => s.maturity_date = require_time(name, value)?,
                "fixedDv01" => s.fixed_dv01 = require_num(name, value)?,
                "floatingDv01" => s.floating_dv01 = require_num(name, value)?,
                "lastTradePrice" => s.last_trade_price = require_non_negative(name, value)?,
                "lastTradeSize" => s.last_trade_size = require_non_negative(name, value)?,
                "lastTradeTime" => s.last_trade_time = require_time(name, value)?,
                _ => return Err(unknown_field(name, SecurityType::Swap)),
            },
            KindFields::Future(f) => match name {
                "price" => f.price = require_non_negative(name, value)?,
                "impliedRate" => f.implied_rate = require_num(name, value)?,
                "bidPrice" => f.bid_price = require_non_negative(name, value)?,
                "askPrice" => f.ask_price = require_non_negative(name, value)?,
                "contractMonth" => f.contract_month = require_text(name, value)?.to_string(),
                "openInterest" => f.open_interest = require_int(name, value)?,
                "volume" => f.volume = require_int(name, value)?,
                "lastTradePrice" => f.last_trade_price = require_non_negative(name, value)?,
                "lastTradeSize" => f.last_trade_size = require_non_negative(name, value)?,
                "lastTradeTime" => f.last_trade_time = require_time(name, value)?,
                _ => return Err(unknown_field(name, SecurityType::Future)),
            },
            KindFields::Option(o) => match name {
                "premium" => {
                    let premium = require_num(name, value)?;
                    if premium <= 0.0 {
                        return Err(CoreError::invalid("premium must be positive"));
                    }
                    o.premium = premium;
                }
                "strikePrice" => o.strike_price = require_non_negative(name, value)?,
                "optionType" => {
                    let raw = require_text(name, value)?;
                    o.option_type = OptionType::parse(raw).ok_or_else(|| {
                        CoreError::invalid(format!("unknown option type '{raw}'"))
                    })?;
                }
                "underlyingId" => o.underlying_id = require_text(name, value)?.to_string(),
                "expiryDate" => o.expiry_date = require_time(name, value)?,
                "impliedVol" => {
                    let vol = require_num(name, value)?;
                    if vol <= 0.0 {
                        return Err(CoreError::invalid("impliedVol must be positive"));
                    }
                    o.implied_vol = vol;
                }
                "delta" => o.delta = require_num(name, value)?,
                "gamma" => o.gamma = require_num(name, value)?,
                "theta" => o.theta = require_num(name, value)?,
                "vega" => o.vega = require_num(name, value)?,
                "intrinsicValue" => o.intrinsic_value = require_non_negative(name, value)?,
                "timeValue" => o.time_value = require_non_negative(name, value)?,
                "lastTradePrice" => o.last_trade_price = require_non_negative(name, value)?,
                "lastTradeSize" => o.last_trade_size = require_non_negative(name, value)?,
                "lastTradeTime" => o.last_trade_time = require_time(name, value)?,
                _ => return Err(unknown_field(name, SecurityType::Option)),
            },
        }
        Ok(())
    }

    /// Merge a JSON object from an admin update. All-or-nothing: applied to
    /// a scratch copy first so a bad field leaves the record untouched.
    pub fn merge_json(
        &mut self,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CoreError> {
        if fields.is_empty() {
            return Err(CoreError::invalid("empty update"));
        }
        let mut updated = self.clone();
        for (name, raw) in fields {
            let value = FieldValue::from_json(raw)?;
            updated.apply_field(name, &value)?;
        }
        *self = updated;
        Ok(())
    }
}

fn unknown_field(name: &str, kind: SecurityType) -> CoreError {
    CoreError::invalid(format!("unknown field '{name}' for {}", kind.as_str()))
}

fn require_num(name: &str, value: &FieldValue) -> Result<f64, CoreError> {
    value
        .as_f64()
        .ok_or_else(|| CoreError::invalid(format!("field {name} expects a number")))
}

fn require_non_negative(name: &str, value: &FieldValue) -> Result<f64, CoreError> {
    let n = require_num(name, value)?;
    if n < 0.0 {
        return Err(CoreError::invalid(format!("field {name} must be >= 0")));
    }
    Ok(n)
}

fn require_int(name: &str, value: &FieldValue) -> Result<i64, CoreError> {
    match value {
        FieldValue::Int(i) => Ok(*i),
        FieldValue::Num(n) if n.fract() == 0.0 => Ok(*n as i64),
        _ => Err(CoreError::invalid(format!("field {name} expects an integer"))),
    }
}

fn require_text<'v>(name: &str, value: &'v FieldValue) -> Result<&'v str, CoreError> {
    value
        .as_str()
        .ok_or_else(|| CoreError::invalid(format!("field {name} expects a string")))
}

fn require_time(name: &str, value: &FieldValue) -> Result<DateTime<Utc>, CoreError> {
    let ms = match value {
        FieldValue::Time(ms) => *ms,
        FieldValue::Int(ms) => *ms,
        FieldValue::Num(n) if n.fract() == 0.0 => *n as i64,
        _ => {
            return Err(CoreError::invalid(format!(
                "field {name} expects epoch milliseconds"
            )))
        }
    };
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CoreError::invalid(format!("field {name}: bad timestamp {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::seed;

    #[test]
    fn test_field_map_round_trips_through_apply() {
        let bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        let mut blank = seed::treasury_bond("US10Y", "US Treasury 10Y", 50.0, 1.0);
        for (name, value) in bond.field_map() {
            if matches!(name, "instrumentId" | "securityType") {
                continue;
            }
            blank.apply_field(name, &value).unwrap();
        }
        assert_eq!(blank, bond);
    }

    #[test]
    fn test_security_type_tag_on_wire() {
        let bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        let json = serde_json::to_value(&bond).unwrap();
        assert_eq!(json["securityType"], "Bond");
        assert_eq!(json["instrumentId"], "US10Y");
        assert_eq!(json["status"], "ACTIVE");
        // Dates serialize as epoch-ms integers.
        assert!(json["maturityDate"].is_i64());
        assert!(json["lastUpdate"].is_i64());
    }

    #[test]
    fn test_instrument_json_round_trip() {
        let future = seed::bond_future("ZN-U25", "10Y Note Future Sep25", 111.5, "SEP25");
        let json = serde_json::to_string(&future).unwrap();
        let back: Instrument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, future);
    }

    #[test]
    fn test_apply_unknown_field_is_rejected() {
        let mut bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        let err = bond
            .apply_field("swapRate", &FieldValue::Num(4.0))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_apply_rejects_negative_price() {
        let mut bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        assert!(bond.apply_field("price", &FieldValue::Num(-1.0)).is_err());
    }

    #[test]
    fn test_merge_json_is_all_or_nothing() {
        let mut bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        let before = bond.clone();
        let fields = serde_json::json!({ "price": 99.0, "rating": "JUNK" });
        let err = bond.merge_json(fields.as_object().unwrap()).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert_eq!(bond, before);
    }

    #[test]
    fn test_option_intrinsic_value() {
        let mut option = seed::future_option(
            "ZN-U25-C112",
            "ZN Sep25 112 Call",
            "ZN-U25",
            OptionType::Call,
            112.0,
            0.8,
        );
        if let KindFields::Option(o) = &mut option.kind {
            o.recompute_value(113.5);
            assert_eq!(o.intrinsic_value, 1.5);
            assert!(o.time_value >= 0.0);
            o.recompute_value(110.0);
            assert_eq!(o.intrinsic_value, 0.0);
        } else {
            panic!("expected option");
        }
    }

    #[test]
    fn test_put_delta_clamped_to_negative_range() {
        let mut option = seed::future_option(
            "ZN-U25-P110",
            "ZN Sep25 110 Put",
            "ZN-U25",
            OptionType::Put,
            110.0,
            0.6,
        );
        if let KindFields::Option(o) = &mut option.kind {
            o.delta = 0.4;
            o.clamp_delta();
            assert_eq!(o.delta, 0.0);
            o.delta = -1.7;
            o.clamp_delta();
            assert_eq!(o.delta, -1.0);
        } else {
            panic!("expected option");
        }
    }

    #[test]
    fn test_touch_is_strictly_monotonic() {
        let mut bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        let first = bond.last_update;
        bond.touch(first); // same instant: must still advance
        assert!(bond.last_update > first);
    }
}
