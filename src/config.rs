//! Process configuration from environment variables.
//!
//! All knobs have defaults so `ratefeed` starts with zero configuration.
//! A variable that is present but unparseable or out of range aborts
//! startup; a missing variable falls back to its default.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Market regime driven by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Normal,
    HighVol,
    TrendingUp,
    TrendingDown,
    FlashEvent,
}

impl Scenario {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Scenario::Normal),
            "high_vol" => Some(Scenario::HighVol),
            "trending_up" => Some(Scenario::TrendingUp),
            "trending_down" => Some(Scenario::TrendingDown),
            "flash_event" => Some(Scenario::FlashEvent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Normal => "normal",
            Scenario::HighVol => "high_vol",
            Scenario::TrendingUp => "trending_up",
            Scenario::TrendingDown => "trending_down",
            Scenario::FlashEvent => "flash_event",
        }
    }
}

/// Session of the trading day, used to shape volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    MarketOpen,
    Morning,
    Lunch,
    Afternoon,
    MarketClose,
    AfterHours,
}

impl TimeOfDay {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market_open" => Some(TimeOfDay::MarketOpen),
            "morning" => Some(TimeOfDay::Morning),
            "lunch" => Some(TimeOfDay::Lunch),
            "afternoon" => Some(TimeOfDay::Afternoon),
            "market_close" => Some(TimeOfDay::MarketClose),
            "after_hours" => Some(TimeOfDay::AfterHours),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDay::MarketOpen => "market_open",
            TimeOfDay::Morning => "morning",
            TimeOfDay::Lunch => "lunch",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::MarketClose => "market_close",
            TimeOfDay::AfterHours => "after_hours",
        }
    }

    /// Bucket a UTC hour into a trading-day session (US rates hours).
    pub fn from_utc_hour(hour: u32) -> Self {
        match hour {
            13 => TimeOfDay::MarketOpen,
            14 | 15 => TimeOfDay::Morning,
            16 => TimeOfDay::Lunch,
            17..=19 => TimeOfDay::Afternoon,
            20 => TimeOfDay::MarketClose,
            _ => TimeOfDay::AfterHours,
        }
    }
}

/// Either a fixed session or derive it from the wall clock each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDayMode {
    Auto,
    Fixed(TimeOfDay),
}

impl TimeOfDayMode {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "auto" {
            return Some(TimeOfDayMode::Auto);
        }
        TimeOfDay::parse(s).map(TimeOfDayMode::Fixed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDayMode::Auto => "auto",
            TimeOfDayMode::Fixed(tod) => tod.as_str(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Tick cadence in milliseconds.
    pub update_frequency_ms: u64,
    /// Base volatility, 0..=1.
    pub volatility_factor: f64,
    /// Correlation strength, 0..=1.
    pub correlation_strength: f64,
    pub scenario: Scenario,
    pub time_of_day: TimeOfDayMode,
    pub flash_event_probability: f64,
    pub flash_event_magnitude: f64,
    /// Default per-subscriber refill rate, tokens/second.
    pub max_updates_per_second: f64,
    /// Per-subscriber token bucket capacity.
    pub bucket_size: f64,
    /// Per-session outbound queue depth before deltas are dropped.
    pub outbound_queue_size: usize,
    /// Seed the example catalog at startup.
    pub seed_instruments: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            update_frequency_ms: 500,
            volatility_factor: 0.2,
            correlation_strength: 0.7,
            scenario: Scenario::Normal,
            time_of_day: TimeOfDayMode::Auto,
            flash_event_probability: 0.001,
            flash_event_magnitude: 3.0,
            max_updates_per_second: 10.0,
            bucket_size: 20.0,
            outbound_queue_size: 256,
            seed_instruments: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Config::default();

        let port = env_parsed("PORT", defaults.port)?;
        let update_frequency_ms = env_parsed("UPDATE_FREQUENCY_MS", defaults.update_frequency_ms)?;
        if update_frequency_ms == 0 {
            bail!("UPDATE_FREQUENCY_MS must be positive");
        }

        let volatility_factor = env_fraction("VOLATILITY_FACTOR", defaults.volatility_factor)?;
        let correlation_strength =
            env_fraction("CORRELATION_STRENGTH", defaults.correlation_strength)?;
        let flash_event_probability =
            env_fraction("FLASH_EVENT_PROBABILITY", defaults.flash_event_probability)?;

        let flash_event_magnitude: f64 =
            env_parsed("FLASH_EVENT_MAGNITUDE", defaults.flash_event_magnitude)?;
        if flash_event_magnitude <= 0.0 {
            bail!("FLASH_EVENT_MAGNITUDE must be positive");
        }

        let scenario = match std::env::var("SCENARIO") {
            Ok(raw) => Scenario::parse(raw.trim())
                .with_context(|| format!("unknown SCENARIO '{raw}'"))?,
            Err(_) => defaults.scenario,
        };

        let time_of_day = match std::env::var("TIME_OF_DAY") {
            Ok(raw) => TimeOfDayMode::parse(raw.trim())
                .with_context(|| format!("unknown TIME_OF_DAY '{raw}'"))?,
            Err(_) => defaults.time_of_day,
        };

        let max_updates_per_second: f64 =
            env_parsed("MAX_UPDATES_PER_SECOND", defaults.max_updates_per_second)?;
        if max_updates_per_second <= 0.0 {
            bail!("MAX_UPDATES_PER_SECOND must be positive");
        }

        let bucket_size: f64 = env_parsed("BUCKET_SIZE", defaults.bucket_size)?;
        if bucket_size < 1.0 {
            bail!("BUCKET_SIZE must be at least 1");
        }

        let outbound_queue_size =
            env_parsed("OUTBOUND_QUEUE_SIZE", defaults.outbound_queue_size)?;
        if outbound_queue_size == 0 {
            bail!("OUTBOUND_QUEUE_SIZE must be positive");
        }

        let seed_instruments = match std::env::var("SEED_INSTRUMENTS") {
            Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"),
            Err(_) => defaults.seed_instruments,
        };

        Ok(Self {
            port,
            update_frequency_ms,
            volatility_factor,
            correlation_strength,
            scenario,
            time_of_day,
            flash_event_probability,
            flash_event_magnitude,
            max_updates_per_second,
            bucket_size,
            outbound_queue_size,
            seed_instruments,
        })
    }
}

/// Runtime-adjustable slice of the simulator configuration, shared between
/// the ticker task and the admin API.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub enabled: bool,
    pub scenario: Scenario,
    pub time_of_day: TimeOfDayMode,
    pub volatility_factor: f64,
    pub flash_event_probability: f64,
    pub flash_event_magnitude: f64,
}

impl SimulationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: true,
            scenario: config.scenario,
            time_of_day: config.time_of_day,
            volatility_factor: config.volatility_factor,
            flash_event_probability: config.flash_event_probability,
            flash_event_magnitude: config.flash_event_magnitude,
        }
    }
}

fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {name} '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_fraction(name: &str, default: f64) -> Result<f64> {
    let value: f64 = env_parsed(name, default)?;
    if !(0.0..=1.0).contains(&value) {
        bail!("{name} must be in 0..=1, got {value}");
    }
    Ok(value)
}
