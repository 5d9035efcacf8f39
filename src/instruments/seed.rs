//! Example catalog for a rates blotter.
//!
//! Seeds treasuries across the curve, a pair of credit names, the USD swap
//! curve, the bond-future strip, and options on the 10Y note future. Also
//! used by tests as the canonical way to build well-formed instruments.

use chrono::Duration;
use parking_lot::RwLock;
use tracing::info;

use crate::instruments::store::InstrumentStore;
use crate::instruments::{
    now_millis, BondFields, Currency, FutureFields, Instrument, InstrumentStatus, KindFields,
    OptionFields, OptionType, Rating, Sector, SwapFields,
};
use crate::market::correlation::{CorrelationGraph, InstrumentTraits};

pub fn treasury_bond(id: &str, description: &str, price: f64, ytm: f64) -> Instrument {
    bond(
        id,
        description,
        price,
        ytm,
        Sector::Government,
        Rating::Aaa,
        0.02,
    )
}

pub fn corporate_bond(
    id: &str,
    description: &str,
    price: f64,
    ytm: f64,
    rating: Rating,
) -> Instrument {
    bond(id, description, price, ytm, Sector::Corporate, rating, 0.85)
}

fn bond(
    id: &str,
    description: &str,
    price: f64,
    ytm: f64,
    sector: Sector,
    rating: Rating,
    credit_spread: f64,
) -> Instrument {
    let now = now_millis();
    Instrument {
        id: id.to_string(),
        description: description.to_string(),
        currency: Currency::Usd,
        sector,
        rating,
        status: InstrumentStatus::Active,
        last_update: now,
        kind: KindFields::Bond(BondFields {
            price,
            yield_to_maturity: ytm,
            bid_price: price * (1.0 - 0.000_25),
            ask_price: price * (1.0 + 0.000_25),
            coupon: (ytm * 4.0).round() / 4.0,
            maturity_date: now + Duration::days(3650),
            duration: 8.5,
            convexity: 0.82,
            credit_spread,
            last_trade_price: price,
            last_trade_size: 5_000_000.0,
            last_trade_time: now,
        }),
    }
}

pub fn usd_swap(id: &str, description: &str, rate: f64, tenor_years: i64) -> Instrument {
    let now = now_millis();
    Instrument {
        id: id.to_string(),
        description: description.to_string(),
        currency: Currency::Usd,
        sector: Sector::Financial,
        rating: Rating::Aa,
        status: InstrumentStatus::Active,
        last_update: now,
        kind: KindFields::Swap(SwapFields {
            swap_rate: rate,
            bid_rate: rate * (1.0 - 0.000_1),
            ask_rate: rate * (1.0 + 0.000_1),
            notional: 100_000_000.0,
            maturity_date: now + Duration::days(365 * tenor_years),
            fixed_dv01: 780.0 * tenor_years as f64,
            floating_dv01: 24.0,
            last_trade_price: rate,
            last_trade_size: 50_000_000.0,
            last_trade_time: now,
        }),
    }
}

pub fn bond_future(id: &str, description: &str, price: f64, contract_month: &str) -> Instrument {
    let now = now_millis();
    Instrument {
        id: id.to_string(),
        description: description.to_string(),
        currency: Currency::Usd,
        sector: Sector::Government,
        rating: Rating::Nr,
        status: InstrumentStatus::Active,
        last_update: now,
        kind: KindFields::Future(FutureFields {
            price,
            implied_rate: 100.0 - price,
            bid_price: price - 0.015_625,
            ask_price: price + 0.015_625,
            contract_month: contract_month.to_string(),
            open_interest: 1_250_000,
            volume: 0,
            last_trade_price: price,
            last_trade_size: 500_000.0,
            last_trade_time: now,
        }),
    }
}

pub fn future_option(
    id: &str,
    description: &str,
    underlying_id: &str,
    option_type: OptionType,
    strike: f64,
    delta: f64,
) -> Instrument {
    let now = now_millis();
    let premium = 0.25 + delta.abs();
    Instrument {
        id: id.to_string(),
        description: description.to_string(),
        currency: Currency::Usd,
        sector: Sector::Government,
        rating: Rating::Nr,
        status: InstrumentStatus::Active,
        last_update: now,
        kind: KindFields::Option(OptionFields {
            premium,
            strike_price: strike,
            option_type,
            underlying_id: underlying_id.to_string(),
            expiry_date: now + Duration::days(60),
            implied_vol: 0.055,
            delta,
            gamma: 0.08,
            // Daily decay magnitude; the simulator subtracts theta/365.
            theta: 0.9,
            vega: 12.0,
            intrinsic_value: 0.0,
            time_value: premium,
            last_trade_price: premium,
            last_trade_size: 250_000.0,
            last_trade_time: now,
        }),
    }
}

/// Seed the example catalog into an empty store, wiring the correlation
/// graph as each instrument is added. Returns the number seeded.
pub fn seed_catalog(store: &InstrumentStore, graph: &RwLock<CorrelationGraph>) -> usize {
    let mut catalog = vec![
        treasury_bond("US2Y", "US Treasury 2Y", 99.1, 4.6),
        treasury_bond("US5Y", "US Treasury 5Y", 98.2, 4.35),
        treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2),
        treasury_bond("US30Y", "US Treasury 30Y", 96.4, 4.45),
        corporate_bond("ACME-28", "ACME Corp 5.5% 2028", 101.2, 5.1, Rating::Bbb),
        corporate_bond("BIGBANK-27", "BigBank 4.9% 2027", 99.7, 4.95, Rating::A),
        usd_swap("USD-SWAP-2Y", "USD IRS 2Y", 4.55, 2),
        usd_swap("USD-SWAP-5Y", "USD IRS 5Y", 4.3, 5),
        usd_swap("USD-SWAP-10Y", "USD IRS 10Y", 4.15, 10),
        usd_swap("USD-SWAP-30Y", "USD IRS 30Y", 4.05, 30),
        bond_future("ZT-U25", "2Y Note Future Sep25", 102.8, "SEP25"),
        bond_future("ZF-U25", "5Y Note Future Sep25", 107.3, "SEP25"),
        bond_future("ZN-U25", "10Y Note Future Sep25", 111.5, "SEP25"),
        bond_future("ZB-U25", "Bond Future Sep25", 117.9, "SEP25"),
        future_option("ZN-U25-C112", "ZN Sep25 112 Call", "ZN-U25", OptionType::Call, 112.0, 0.42),
        future_option("ZN-U25-P110", "ZN Sep25 110 Put", "ZN-U25", OptionType::Put, 110.0, -0.31),
    ];

    // Options start consistent with their underlying's seeded mark.
    for instrument in &mut catalog {
        if let KindFields::Option(o) = &mut instrument.kind {
            o.recompute_value(111.5);
        }
    }

    let mut seeded = 0;
    for instrument in catalog {
        let id = instrument.id.clone();
        let traits = InstrumentTraits::from(&instrument);
        match store.insert(instrument) {
            Ok(()) => {
                graph.write().add_instrument(&id, traits);
                seeded += 1;
            }
            Err(e) => info!(instrument = %id, error = %e, "skipping seed instrument"),
        }
    }
    info!("📈 Seeded {seeded} example instruments");
    seeded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_catalog_populates_store_and_graph() {
        let store = InstrumentStore::new();
        let graph = RwLock::new(CorrelationGraph::new(0.7));
        let seeded = seed_catalog(&store, &graph);
        assert_eq!(seeded, 16);
        assert_eq!(store.len(), 16);
        assert!(store.contains("US10Y"));
        assert!(store.contains("ZN-U25-P110"));
        // Every pair of distinct instruments has a coefficient.
        assert!(graph.read().coefficient("US10Y", "US2Y").is_some());
        assert!(graph.read().coefficient("ZN-U25", "USD-SWAP-10Y").is_some());
    }

    #[test]
    fn test_seeded_options_are_consistent() {
        let option = {
            let store = InstrumentStore::new();
            let graph = RwLock::new(CorrelationGraph::new(0.7));
            seed_catalog(&store, &graph);
            store.get("ZN-U25-C112").unwrap()
        };
        if let KindFields::Option(o) = option.kind {
            assert_eq!(o.intrinsic_value, 0.0); // 111.5 mark, 112 strike call
            assert_eq!(o.time_value, o.premium);
        } else {
            panic!("expected option");
        }
    }
}
