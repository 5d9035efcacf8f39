//! Pairwise correlation graph over the instrument catalog.
//!
//! Coefficients are derived from categorical attributes when an instrument
//! is added, not configured: shared kind, sector, and currency each pull a
//! pair together, plus a small uniform jitter, scaled by the configured
//! correlation strength. The graph is sparse and symmetric; rows are stored
//! in both directions so the ticker's neighbor scan is O(degree).

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::instruments::{Currency, Instrument, Sector, SecurityType};

/// Attribute triple a coefficient is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentTraits {
    pub security_type: SecurityType,
    pub sector: Sector,
    pub currency: Currency,
}

impl From<&Instrument> for InstrumentTraits {
    fn from(instrument: &Instrument) -> Self {
        Self {
            security_type: instrument.security_type(),
            sector: instrument.sector,
            currency: instrument.currency,
        }
    }
}

pub struct CorrelationGraph {
    strength: f64,
    traits: HashMap<String, InstrumentTraits>,
    rows: HashMap<String, HashMap<String, f64>>,
    rng: StdRng,
}

impl CorrelationGraph {
    pub fn new(strength: f64) -> Self {
        Self::with_rng(strength, StdRng::from_entropy())
    }

    pub fn with_rng(strength: f64, rng: StdRng) -> Self {
        Self {
            strength: strength.clamp(0.0, 1.0),
            traits: HashMap::new(),
            rows: HashMap::new(),
            rng,
        }
    }

    /// Add an instrument, computing a coefficient against every existing
    /// instrument. Re-adding an id recomputes its row.
    pub fn add_instrument(&mut self, id: &str, traits: InstrumentTraits) {
        if self.traits.contains_key(id) {
            self.remove_instrument(id);
        }

        let mut row = HashMap::with_capacity(self.traits.len());
        let others: Vec<(String, InstrumentTraits)> = self
            .traits
            .iter()
            .map(|(other, t)| (other.clone(), *t))
            .collect();
        for (other, other_traits) in others {
            let coefficient = self.derive_coefficient(traits, other_traits);
            self.rows
                .entry(other.clone())
                .or_default()
                .insert(id.to_string(), coefficient);
            row.insert(other, coefficient);
        }
        self.rows.insert(id.to_string(), row);
        self.traits.insert(id.to_string(), traits);
    }

    /// Drop an instrument's row and its column in every other row.
    pub fn remove_instrument(&mut self, id: &str) {
        self.traits.remove(id);
        if let Some(row) = self.rows.remove(id) {
            for other in row.keys() {
                if let Some(other_row) = self.rows.get_mut(other) {
                    other_row.remove(id);
                }
            }
        }
    }

    pub fn coefficient(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return None;
        }
        self.rows.get(a)?.get(b).copied()
    }

    /// All neighbors of `id` with their coefficients.
    pub fn neighbors(&self, id: &str) -> Vec<(String, f64)> {
        self.rows
            .get(id)
            .map(|row| row.iter().map(|(other, c)| (other.clone(), *c)).collect())
            .unwrap_or_default()
    }

    pub fn instrument_count(&self) -> usize {
        self.traits.len()
    }

    fn derive_coefficient(&mut self, a: InstrumentTraits, b: InstrumentTraits) -> f64 {
        let mut affinity: f64 = 0.0;
        if a.security_type == b.security_type {
            affinity += 0.3;
        }
        if a.sector == b.sector {
            affinity += 0.4;
        }
        if a.currency == b.currency {
            affinity += 0.2;
        }
        affinity += self.rng.gen_range(-0.1..0.1);
        self.strength * affinity.clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::seed;

    fn graph_with(ids: &[&str]) -> CorrelationGraph {
        let mut graph = CorrelationGraph::with_rng(0.7, StdRng::seed_from_u64(7));
        for id in ids {
            let bond = seed::treasury_bond(id, "test bond", 99.0, 4.0);
            graph.add_instrument(id, InstrumentTraits::from(&bond));
        }
        graph
    }

    #[test]
    fn test_coefficients_are_symmetric_and_bounded() {
        let graph = graph_with(&["US2Y", "US10Y", "US30Y"]);
        for a in ["US2Y", "US10Y", "US30Y"] {
            for b in ["US2Y", "US10Y", "US30Y"] {
                if a == b {
                    assert_eq!(graph.coefficient(a, b), None);
                    continue;
                }
                let ab = graph.coefficient(a, b).unwrap();
                let ba = graph.coefficient(b, a).unwrap();
                assert_eq!(ab, ba);
                assert!((-1.0..=1.0).contains(&ab));
            }
        }
    }

    #[test]
    fn test_same_attributes_correlate_positively() {
        // Same kind, sector, and currency: affinity 0.9 plus jitter in
        // (-0.1, 0.1), scaled by 0.7, so it is strictly positive.
        let graph = graph_with(&["US2Y", "US10Y", "US30Y"]);
        assert!(graph.coefficient("US2Y", "US10Y").unwrap() > 0.0);
    }

    #[test]
    fn test_remove_erases_rows_and_columns() {
        let mut graph = graph_with(&["US2Y", "US10Y", "US30Y"]);
        graph.remove_instrument("US10Y");
        assert_eq!(graph.instrument_count(), 2);
        assert_eq!(graph.coefficient("US2Y", "US10Y"), None);
        assert_eq!(graph.coefficient("US10Y", "US30Y"), None);
        assert!(graph.coefficient("US2Y", "US30Y").is_some());
        assert!(graph
            .neighbors("US2Y")
            .iter()
            .all(|(other, _)| other != "US10Y"));
    }

    #[test]
    fn test_strength_scales_coefficients() {
        let bond_a = seed::treasury_bond("A", "a", 99.0, 4.0);
        let bond_b = seed::treasury_bond("B", "b", 99.0, 4.0);
        let mut graph = CorrelationGraph::with_rng(0.0, StdRng::seed_from_u64(3));
        graph.add_instrument("A", InstrumentTraits::from(&bond_a));
        graph.add_instrument("B", InstrumentTraits::from(&bond_b));
        assert_eq!(graph.coefficient("A", "B"), Some(0.0));
    }
}
