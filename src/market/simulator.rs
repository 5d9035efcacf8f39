//! Stochastic tick generator.
//!
//! One ticker task advances every instrument once per tick. The effective
//! volatility per instrument combines the base factor with time-of-day and
//! scenario multipliers plus rare flash excursions; the primary move adds a
//! correlated term driven by the latest percentage changes of neighbors in
//! the correlation graph (read in visitation order, no tick barrier).
//! Deltas are emitted immediately per instrument. A failing instrument is
//! logged and skipped; the tick continues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::app::ServiceStats;
use crate::config::{Config, Scenario, SimulationSettings, TimeOfDay, TimeOfDayMode};
use crate::delta::{Delta, DeltaEngine};
use crate::error::CoreError;
use crate::instruments::store::InstrumentStore;
use crate::instruments::{now_millis, Instrument, InstrumentStatus, KindFields};
use crate::market::correlation::CorrelationGraph;

pub struct TickGenerator {
    store: Arc<InstrumentStore>,
    graph: Arc<RwLock<CorrelationGraph>>,
    settings: Arc<RwLock<SimulationSettings>>,
    engine: DeltaEngine,
    stats: Arc<ServiceStats>,
    cadence: Duration,
    /// Latest percentage price change per instrument, feeding the
    /// correlated term of subsequent moves.
    price_changes: HashMap<String, f64>,
    rng: StdRng,
}

impl TickGenerator {
    pub fn new(
        store: Arc<InstrumentStore>,
        graph: Arc<RwLock<CorrelationGraph>>,
        settings: Arc<RwLock<SimulationSettings>>,
        stats: Arc<ServiceStats>,
        config: &Config,
    ) -> Self {
        Self::with_rng(store, graph, settings, stats, config, StdRng::from_entropy())
    }

    pub fn with_rng(
        store: Arc<InstrumentStore>,
        graph: Arc<RwLock<CorrelationGraph>>,
        settings: Arc<RwLock<SimulationSettings>>,
        stats: Arc<ServiceStats>,
        config: &Config,
        rng: StdRng,
    ) -> Self {
        Self {
            engine: DeltaEngine::new(store.clone()),
            store,
            graph,
            settings,
            stats,
            cadence: Duration::from_millis(config.update_frequency_ms),
            price_changes: HashMap::new(),
            rng,
        }
    }

    /// Drive ticks on the configured cadence until shutdown.
    pub async fn run(mut self, deltas: mpsc::Sender<Delta>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(cadence_ms = self.cadence.as_millis() as u64, "📈 market ticker started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    // A dropped sender means the process is going away.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let settings = self.settings.read().clone();
            if !settings.enabled {
                continue;
            }
            if self.tick(&settings, &deltas).await.is_err() {
                warn!("delta channel closed; stopping ticker");
                break;
            }
        }
        info!("market ticker stopped");
    }

    /// One pass over the catalog. Yields between instruments and never
    /// holds a lock across an await.
    pub async fn tick(
        &mut self,
        settings: &SimulationSettings,
        deltas: &mpsc::Sender<Delta>,
    ) -> Result<(), ()> {
        self.stats.bump_ticks();
        let time_of_day = resolve_time_of_day(settings.time_of_day, Utc::now());
        for id in self.store.ids() {
            match self.advance_instrument(&id, settings, time_of_day) {
                Ok(Some(delta)) => {
                    self.stats.bump_emitted();
                    if deltas.send(delta).await.is_err() {
                        return Err(());
                    }
                }
                Ok(None) => {}
                // A misbehaving or concurrently-removed instrument never
                // halts the tick loop.
                Err(e) => debug!(instrument = %id, error = %e, "tick skipped instrument"),
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn advance_instrument(
        &mut self,
        id: &str,
        settings: &SimulationSettings,
        time_of_day: TimeOfDay,
    ) -> Result<Option<Delta>, CoreError> {
        let current = self
            .store
            .get(id)
            .ok_or_else(|| CoreError::not_found(format!("instrument {id}")))?;
        if current.status != InstrumentStatus::Active {
            return Ok(None);
        }

        let volatility = self.effective_volatility(settings, time_of_day);
        let mut price_delta = (self.rng.gen::<f64>() - 0.5) * volatility;
        match settings.scenario {
            Scenario::TrendingUp => price_delta += 0.1 * volatility,
            Scenario::TrendingDown => price_delta -= 0.1 * volatility,
            _ => {}
        }
        price_delta += self.correlated_move(id);

        // For options, read the underlying outside the slot lock.
        let underlying = match &current.kind {
            KindFields::Option(o) => {
                let mark = self.store.get(&o.underlying_id).map(|u| trade_mark(&u));
                let change = self
                    .price_changes
                    .get(&o.underlying_id)
                    .copied()
                    .unwrap_or(0.0);
                Some(UnderlyingState { mark, change })
            }
            _ => None,
        };

        self.price_changes.insert(id.to_string(), price_delta);

        let now = now_millis();
        let rng = &mut self.rng;
        self.engine.mutate_and_emit(id, |instrument| {
            apply_tick(instrument, price_delta, underlying.as_ref(), now, rng);
        })
    }

    /// Sum of neighbor coefficients times their latest percentage changes.
    fn correlated_move(&self, id: &str) -> f64 {
        let graph = self.graph.read();
        let mut sum = 0.0;
        for (other, coefficient) in graph.neighbors(id) {
            if let Some(change) = self.price_changes.get(&other) {
                sum += coefficient * change;
            }
        }
        0.3 * sum
    }

    fn effective_volatility(&mut self, settings: &SimulationSettings, tod: TimeOfDay) -> f64 {
        let mut v = settings.volatility_factor;
        v *= match tod {
            TimeOfDay::MarketOpen | TimeOfDay::MarketClose => 2.0,
            TimeOfDay::Lunch => 0.5,
            _ => 1.0,
        };
        v *= match settings.scenario {
            Scenario::HighVol => 3.0,
            Scenario::TrendingUp | Scenario::TrendingDown => 1.5,
            // Flash-event regimes carry their excursions through the flash
            // draw below rather than a fixed multiplier.
            Scenario::FlashEvent | Scenario::Normal => 1.0,
        };
        let flash_probability = settings.flash_event_probability.clamp(0.0, 1.0);
        if flash_probability > 0.0 && self.rng.gen_bool(flash_probability) {
            debug!(magnitude = settings.flash_event_magnitude, "⚡ flash excursion");
            v *= settings.flash_event_magnitude;
        }
        v
    }
}

struct UnderlyingState {
    /// Latest trade mark of the underlying, if it exists.
    mark: Option<f64>,
    /// Underlying's latest percentage price change.
    change: f64,
}

fn trade_mark(instrument: &Instrument) -> f64 {
    match &instrument.kind {
        KindFields::Bond(b) => b.last_trade_price,
        KindFields::Swap(s) => s.last_trade_price,
        KindFields::Future(f) => f.last_trade_price,
        KindFields::Option(o) => o.last_trade_price,
    }
}

fn resolve_time_of_day(mode: TimeOfDayMode, now: DateTime<Utc>) -> TimeOfDay {
    match mode {
        TimeOfDayMode::Fixed(tod) => tod,
        TimeOfDayMode::Auto => TimeOfDay::from_utc_hour(now.hour()),
    }
}

fn bid_ask_spread(coefficient: f64, price_delta: f64) -> f64 {
    coefficient * (1.0 + 2.0 * price_delta.abs()).max(0.5)
}

/// Kind-specific state transition for one tick. Trade fields are written
/// only on trade ticks, so non-trade deltas never carry them.
fn apply_tick(
    instrument: &mut Instrument,
    price_delta: f64,
    underlying: Option<&UnderlyingState>,
    now: DateTime<Utc>,
    rng: &mut StdRng,
) {
    match &mut instrument.kind {
        KindFields::Bond(b) => {
            let price = (b.price * (1.0 + price_delta / 100.0)).max(0.1);
            b.price = price;
            // Yield moves inversely to price.
            b.yield_to_maturity -= price_delta * 1.2 / 100.0;
            let spread = bid_ask_spread(0.05, price_delta);
            b.bid_price = price * (1.0 - spread / 200.0);
            b.ask_price = price * (1.0 + spread / 200.0);
            b.duration *= 1.0 + rng.gen_range(-0.005..0.005);
            b.convexity *= 1.0 + rng.gen_range(-0.005..0.005);
            b.credit_spread *= 1.0 + rng.gen_range(-0.01..0.01);
            if rng.gen_bool(0.10) {
                b.last_trade_price = price;
                b.last_trade_size = rng.gen_range(1..=10) as f64 * 1_000_000.0;
                b.last_trade_time = now;
            }
        }
        KindFields::Swap(s) => {
            let rate = (s.swap_rate + price_delta / 100.0).max(0.001);
            s.swap_rate = rate;
            let spread = bid_ask_spread(0.02, price_delta);
            s.bid_rate = rate * (1.0 - spread / 200.0);
            s.ask_rate = rate * (1.0 + spread / 200.0);
            s.fixed_dv01 *= 1.0 + rng.gen_range(-0.005..0.005);
            s.floating_dv01 *= 1.0 + rng.gen_range(-0.005..0.005);
            if rng.gen_bool(0.05) {
                s.last_trade_price = rate;
                s.last_trade_size = rng.gen_range(1..=20) as f64 * 5_000_000.0;
                s.last_trade_time = now;
            }
        }
        KindFields::Future(f) => {
            // Futures move off the latest trade print.
            let price = (f.last_trade_price * (1.0 + price_delta / 100.0)).max(0.01);
            f.price = price;
            f.implied_rate = 100.0 - price;
            let spread = bid_ask_spread(0.01, price_delta);
            f.bid_price = price * (1.0 - spread / 200.0);
            f.ask_price = price * (1.0 + spread / 200.0);
            // Upward-biased open-interest walk.
            f.open_interest =
                (f.open_interest + ((rng.gen::<f64>() - 0.45) * 100.0).floor() as i64).max(0);
            if rng.gen_bool(0.20) {
                let lots = rng.gen_range(1..=50);
                f.last_trade_price = price;
                f.last_trade_size = lots as f64 * 100_000.0;
                f.last_trade_time = now;
                f.volume += lots;
            }
        }
        KindFields::Option(o) => {
            let (mark, underlying_change) = match underlying {
                Some(u) => (u.mark, u.change),
                None => (None, 0.0),
            };
            // Absolute underlying move: percentage change scaled by the
            // underlying's trade mark.
            let u = underlying_change * mark.unwrap_or(0.0) / 100.0;
            let change = o.delta * u + 0.5 * o.gamma * u * u - o.theta / 365.0;
            o.premium = (o.premium + change).max(0.001);
            o.implied_vol = (o.implied_vol + rng.gen_range(-0.005..0.005)).max(0.001);
            o.delta += rng.gen_range(-0.01..0.01);
            o.clamp_delta();
            o.gamma = (o.gamma * (1.0 + rng.gen_range(-0.01..0.01))).max(0.0);
            o.vega = (o.vega * (1.0 + rng.gen_range(-0.01..0.01))).max(0.0);
            o.theta = (o.theta * (1.0 + rng.gen_range(-0.01..0.01))).max(0.0);
            if let Some(mark) = mark {
                o.recompute_value(mark);
            } else {
                o.time_value = (o.premium - o.intrinsic_value).max(0.0);
            }
            if rng.gen_bool(0.05) {
                o.last_trade_price = o.premium;
                o.last_trade_size = rng.gen_range(1..=10) as f64 * 100_000.0;
                o.last_trade_time = now;
            }
        }
    }
    instrument.touch(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::seed;

    fn fixed_settings() -> SimulationSettings {
        SimulationSettings {
            enabled: true,
            scenario: Scenario::Normal,
            time_of_day: TimeOfDayMode::Fixed(TimeOfDay::Morning),
            volatility_factor: 0.2,
            flash_event_probability: 0.0,
            flash_event_magnitude: 3.0,
        }
    }

    fn generator(settings: SimulationSettings, seed_value: u64) -> (TickGenerator, Arc<InstrumentStore>) {
        let store = Arc::new(InstrumentStore::new());
        let graph = Arc::new(RwLock::new(CorrelationGraph::with_rng(
            0.7,
            StdRng::seed_from_u64(seed_value),
        )));
        seed::seed_catalog(&store, &graph);
        let config = Config {
            update_frequency_ms: 50,
            ..Config::default()
        };
        let generator = TickGenerator::with_rng(
            store.clone(),
            graph,
            Arc::new(RwLock::new(settings)),
            Arc::new(ServiceStats::default()),
            &config,
            StdRng::seed_from_u64(seed_value),
        );
        (generator, store)
    }

    #[test]
    fn test_effective_volatility_multipliers() {
        let (mut generator, _store) = generator(fixed_settings(), 1);
        let mut settings = fixed_settings();

        settings.scenario = Scenario::HighVol;
        let v = generator.effective_volatility(&settings, TimeOfDay::Morning);
        assert!((v - 0.2 * 3.0).abs() < 1e-12);

        settings.scenario = Scenario::Normal;
        let v = generator.effective_volatility(&settings, TimeOfDay::Lunch);
        assert!((v - 0.2 * 0.5).abs() < 1e-12);

        settings.scenario = Scenario::TrendingUp;
        let v = generator.effective_volatility(&settings, TimeOfDay::MarketOpen);
        assert!((v - 0.2 * 2.0 * 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_flash_excursion_multiplies_volatility() {
        let (mut generator, _store) = generator(fixed_settings(), 1);
        let mut settings = fixed_settings();
        settings.flash_event_probability = 1.0;
        settings.flash_event_magnitude = 3.0;
        let v = generator.effective_volatility(&settings, TimeOfDay::Morning);
        assert!((v - 0.2 * 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_correlated_move_uses_graph_and_changes() {
        let (mut generator, _store) = generator(fixed_settings(), 2);
        generator.price_changes.insert("US2Y".into(), 1.0);
        let c = generator
            .graph
            .read()
            .coefficient("US10Y", "US2Y")
            .unwrap();
        // Only US2Y has a recorded change, so the sum is exactly c * 1.0.
        let correlated = generator.correlated_move("US10Y");
        assert!((correlated - 0.3 * c).abs() < 1e-12);
        assert_eq!(generator.correlated_move("UNKNOWN"), 0.0);
    }

    #[test]
    fn test_price_floors_hold_under_extreme_moves() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = now_millis();

        let mut bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 0.11, 4.2);
        apply_tick(&mut bond, -10_000.0, None, now, &mut rng);
        if let KindFields::Bond(b) = &bond.kind {
            assert_eq!(b.price, 0.1);
        }

        let mut swap = seed::usd_swap("USD-SWAP-10Y", "USD IRS 10Y", 0.002, 10);
        apply_tick(&mut swap, -10_000.0, None, now, &mut rng);
        if let KindFields::Swap(s) = &swap.kind {
            assert_eq!(s.swap_rate, 0.001);
        }

        let mut future = seed::bond_future("ZN-U25", "10Y Note Future", 0.02, "SEP25");
        apply_tick(&mut future, -10_000.0, None, now, &mut rng);
        if let KindFields::Future(f) = &future.kind {
            assert_eq!(f.price, 0.01);
            assert!(f.open_interest >= 0);
        }

        let mut option = seed::future_option(
            "ZN-U25-C112",
            "ZN 112 Call",
            "ZN-U25",
            crate::instruments::OptionType::Call,
            112.0,
            0.4,
        );
        let state = UnderlyingState {
            mark: Some(111.5),
            change: -10_000.0,
        };
        apply_tick(&mut option, 0.0, Some(&state), now, &mut rng);
        if let KindFields::Option(o) = &option.kind {
            assert!(o.premium >= 0.001);
            assert!(o.intrinsic_value >= 0.0);
            assert!(o.time_value >= 0.0);
            assert!((0.0..=1.0).contains(&o.delta));
            assert!(o.implied_vol > 0.0);
        }
    }

    #[test]
    fn test_trade_fields_move_together_and_not_every_tick() {
        let mut rng = StdRng::seed_from_u64(11);
        let store = InstrumentStore::new();
        store
            .insert(seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2))
            .unwrap();
        let engine = DeltaEngine::new(Arc::new(store).clone());

        let mut with_trade = 0;
        let mut without_trade = 0;
        for _ in 0..200 {
            let now = now_millis();
            let rng_ref = &mut rng;
            let delta = engine
                .mutate_and_emit("US10Y", |instrument| {
                    apply_tick(instrument, 0.05, None, now, rng_ref);
                })
                .unwrap()
                .expect("tick always advances lastUpdate");
            // The trade price tracks the tick price, so it changes on every
            // trade tick; its absence marks a non-trade tick, which must not
            // carry any trade telemetry.
            if delta.fields.contains_key("lastTradePrice") {
                with_trade += 1;
            } else {
                assert!(!delta.fields.contains_key("lastTradeSize"));
                assert!(!delta.fields.contains_key("lastTradeTime"));
                without_trade += 1;
            }
        }
        // 10% trade probability over 200 ticks: both outcomes occur.
        assert!(with_trade > 0);
        assert!(without_trade > 0);
        assert!(without_trade > with_trade);
    }

    #[test]
    fn test_monotonic_last_update_across_ticks() {
        let (mut generator, store) = generator(fixed_settings(), 5);
        let settings = fixed_settings();
        let before = store.get("US10Y").unwrap().last_update;
        generator
            .advance_instrument("US10Y", &settings, TimeOfDay::Morning)
            .unwrap();
        let mid = store.get("US10Y").unwrap().last_update;
        generator
            .advance_instrument("US10Y", &settings, TimeOfDay::Morning)
            .unwrap();
        let after = store.get("US10Y").unwrap().last_update;
        assert!(mid > before);
        assert!(after > mid);
    }

    #[test]
    fn test_suspended_instruments_are_skipped() {
        let (mut generator, store) = generator(fixed_settings(), 6);
        store
            .with_slot("US10Y", |current, published| {
                current.status = InstrumentStatus::Suspended;
                published.status = InstrumentStatus::Suspended;
            })
            .unwrap();
        let settings = fixed_settings();
        let delta = generator
            .advance_instrument("US10Y", &settings, TimeOfDay::Morning)
            .unwrap();
        assert!(delta.is_none());
    }

    #[tokio::test]
    async fn test_tick_emits_delta_per_instrument() {
        let (mut generator, store) = generator(fixed_settings(), 7);
        let (tx, mut rx) = mpsc::channel(256);
        let settings = fixed_settings();
        generator.tick(&settings, &tx).await.unwrap();
        drop(tx);
        let mut seen = std::collections::HashSet::new();
        while let Some(delta) = rx.recv().await {
            assert!(!delta.fields.is_empty());
            seen.insert(delta.instrument_id);
        }
        assert_eq!(seen.len(), store.len());
    }
}
