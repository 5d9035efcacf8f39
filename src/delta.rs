//! Field-level delta engine.
//!
//! Compares an instrument's current state against its published baseline
//! over the flat field-map view and emits only the fields whose values
//! changed. Equality is exact: epoch-ms integers for timestamps, `==` for
//! floats (no epsilon), element-wise for lists. An empty diff emits nothing
//! and leaves the published baseline untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::CoreError;
use crate::instruments::store::InstrumentStore;
use crate::instruments::{now_millis, FieldValue, Instrument};

/// Minimal change set for one instrument.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub instrument_id: String,
    /// Emission time, epoch milliseconds.
    pub timestamp: i64,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Pure diff of two snapshots. Returns `None` when nothing changed.
pub fn diff_snapshots(published: &Instrument, current: &Instrument) -> Option<Delta> {
    let previous = published.field_map();
    let mut fields = BTreeMap::new();
    for (name, value) in current.field_map() {
        if previous.get(name) != Some(&value) {
            fields.insert(name.to_string(), value);
        }
    }
    if fields.is_empty() {
        return None;
    }
    Some(Delta {
        instrument_id: current.id.clone(),
        timestamp: now_millis().timestamp_millis(),
        fields,
    })
}

/// Couples mutation, diffing, and the published-baseline swap into one
/// critical section per instrument. Both the ticker and admin merge
/// updates emit through this type.
#[derive(Clone)]
pub struct DeltaEngine {
    store: Arc<InstrumentStore>,
}

impl DeltaEngine {
    pub fn new(store: Arc<InstrumentStore>) -> Self {
        Self { store }
    }

    /// Apply `mutate` to the current state; if any field changed, emit the
    /// delta and atomically advance the published baseline.
    pub fn mutate_and_emit(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Instrument),
    ) -> Result<Option<Delta>, CoreError> {
        self.store.with_slot(id, |current, published| {
            mutate(current);
            let delta = diff_snapshots(published, current);
            if delta.is_some() {
                *published = current.clone();
            }
            delta
        })
    }

    /// Like [`mutate_and_emit`], for fallible mutations. A failed mutation
    /// emits nothing; the caller guarantees it left `current` untouched.
    ///
    /// [`mutate_and_emit`]: Self::mutate_and_emit
    pub fn try_mutate_and_emit(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Instrument) -> Result<(), CoreError>,
    ) -> Result<Option<Delta>, CoreError> {
        self.store.with_slot(id, |current, published| {
            mutate(current)?;
            let delta = diff_snapshots(published, current);
            if delta.is_some() {
                *published = current.clone();
            }
            Ok(delta)
        })?
    }
}
