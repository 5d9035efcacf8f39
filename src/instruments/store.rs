//! In-memory instrument store.
//!
//! The catalog map is guarded by one lock held only while the map shape is
//! read or changed; each instrument lives behind its own lock carrying the
//! `current` state and the `published` baseline, so mutating one instrument
//! never blocks readers of another beyond an O(1) critical section.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CoreError;
use crate::instruments::{Currency, Instrument, InstrumentStatus, Rating, SecurityType};

struct Slot {
    current: Instrument,
    published: Instrument,
}

/// Catalog listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct CatalogQuery {
    pub security_type: Option<SecurityType>,
    pub currency: Option<Currency>,
    pub status: Option<InstrumentStatus>,
    pub rating: Option<Rating>,
}

impl CatalogQuery {
    fn matches(&self, instrument: &Instrument) -> bool {
        self.security_type
            .map_or(true, |t| instrument.security_type() == t)
            && self.currency.map_or(true, |c| instrument.currency == c)
            && self.status.map_or(true, |s| instrument.status == s)
            && self.rating.map_or(true, |r| instrument.rating == r)
    }
}

#[derive(Default)]
pub struct InstrumentStore {
    slots: RwLock<HashMap<String, Arc<RwLock<Slot>>>>,
}

impl InstrumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new instrument. The published baseline starts equal to the
    /// current state, so the first delta is computed against creation state.
    pub fn insert(&self, instrument: Instrument) -> Result<(), CoreError> {
        let mut slots = self.slots.write();
        if slots.contains_key(&instrument.id) {
            return Err(CoreError::AlreadyExists(instrument.id));
        }
        let slot = Slot {
            published: instrument.clone(),
            current: instrument,
        };
        slots.insert(slot.current.id.clone(), Arc::new(RwLock::new(slot)));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Instrument, CoreError> {
        let slot = self
            .slots
            .write()
            .remove(id)
            .ok_or_else(|| CoreError::not_found(format!("instrument {id}")))?;
        let slot = slot.read();
        Ok(slot.current.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().contains_key(id)
    }

    /// Snapshot of the current state.
    pub fn get(&self, id: &str) -> Option<Instrument> {
        let slot = self.slots.read().get(id).cloned()?;
        let slot = slot.read();
        Some(slot.current.clone())
    }

    /// Snapshot of the last published state.
    pub fn get_published(&self, id: &str) -> Option<Instrument> {
        let slot = self.slots.read().get(id).cloned()?;
        let slot = slot.read();
        Some(slot.published.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn list(&self) -> Vec<Instrument> {
        self.query(&CatalogQuery::default())
    }

    /// List instruments matching the filter. Each snapshot is taken under
    /// its own lock, so the listing is consistent per instrument.
    pub fn query(&self, query: &CatalogQuery) -> Vec<Instrument> {
        let slots: Vec<Arc<RwLock<Slot>>> = self.slots.read().values().cloned().collect();
        let mut instruments: Vec<Instrument> = slots
            .iter()
            .map(|slot| slot.read().current.clone())
            .filter(|instrument| query.matches(instrument))
            .collect();
        instruments.sort_by(|a, b| a.id.cmp(&b.id));
        instruments
    }

    /// Run `f` against one instrument's current state and published
    /// baseline under its slot lock. The delta engine builds its
    /// mutate-diff-publish cycle on top of this; the store itself never
    /// computes deltas.
    pub fn with_slot<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Instrument, &mut Instrument) -> R,
    ) -> Result<R, CoreError> {
        let slot = self
            .slots
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("instrument {id}")))?;
        let mut slot = slot.write();
        let Slot { current, published } = &mut *slot;
        Ok(f(current, published))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::seed;

    #[test]
    fn test_insert_duplicate_fails() {
        let store = InstrumentStore::new();
        let bond = seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        store.insert(bond.clone()).unwrap();
        let err = store.insert(bond).unwrap_err();
        assert_eq!(err.kind(), "already_exists");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let store = InstrumentStore::new();
        assert_eq!(store.remove("US10Y").unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_published_starts_equal_to_current() {
        let store = InstrumentStore::new();
        store
            .insert(seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2))
            .unwrap();
        assert_eq!(store.get("US10Y"), store.get_published("US10Y"));
    }

    #[test]
    fn test_query_filters_by_kind_and_rating() {
        let store = InstrumentStore::new();
        store
            .insert(seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2))
            .unwrap();
        store
            .insert(seed::corporate_bond(
                "ACME-28",
                "ACME Corp 5.5% 2028",
                101.2,
                5.1,
                Rating::Bbb,
            ))
            .unwrap();
        store
            .insert(seed::usd_swap("USD-SWAP-10Y", "USD IRS 10Y", 4.15, 10))
            .unwrap();

        let bonds = store.query(&CatalogQuery {
            security_type: Some(SecurityType::Bond),
            ..Default::default()
        });
        assert_eq!(bonds.len(), 2);

        let bbb = store.query(&CatalogQuery {
            rating: Some(Rating::Bbb),
            ..Default::default()
        });
        assert_eq!(bbb.len(), 1);
        assert_eq!(bbb[0].id, "ACME-28");
    }

    #[test]
    fn test_with_slot_mutates_current_only() {
        let store = InstrumentStore::new();
        store
            .insert(seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2))
            .unwrap();
        store
            .with_slot("US10Y", |current, _published| {
                if let crate::instruments::KindFields::Bond(b) = &mut current.kind {
                    b.price = 99.0;
                }
            })
            .unwrap();
        let current = store.get("US10Y").unwrap();
        let published = store.get_published("US10Y").unwrap();
        assert_ne!(current, published);
    }
}
