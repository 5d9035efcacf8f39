//! Admin CRUD and control endpoints.
//!
//! Instrument catalog management, runtime simulation control, and service
//! stats. Validation failures surface as structured 4xx JSON via
//! `CoreError`; a successful merge update feeds the same delta pipeline
//! the ticker does, so subscribers see admin edits as `instrument_update`
//! messages.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::{AppState, StatsSnapshot};
use crate::config::{Scenario, TimeOfDayMode};
use crate::error::CoreError;
use crate::instruments::store::CatalogQuery;
use crate::instruments::{Currency, Instrument, InstrumentStatus, Rating, SecurityType};
use crate::market::correlation::InstrumentTraits;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "📡 ratefeed operational"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentListQuery {
    pub security_type: Option<String>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub rating: Option<String>,
}

impl InstrumentListQuery {
    fn into_catalog_query(self) -> Result<CatalogQuery, CoreError> {
        let mut query = CatalogQuery::default();
        if let Some(raw) = self.security_type {
            query.security_type = Some(
                SecurityType::parse(&raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown securityType '{raw}'")))?,
            );
        }
        if let Some(raw) = self.currency {
            query.currency = Some(
                Currency::parse(&raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown currency '{raw}'")))?,
            );
        }
        if let Some(raw) = self.status {
            query.status = Some(
                InstrumentStatus::parse(&raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown status '{raw}'")))?,
            );
        }
        if let Some(raw) = self.rating {
            query.rating = Some(
                Rating::parse(&raw)
                    .ok_or_else(|| CoreError::invalid(format!("unknown rating '{raw}'")))?,
            );
        }
        Ok(query)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentListResponse {
    pub instruments: Vec<Instrument>,
    pub count: usize,
    pub timestamp: String,
}

/// List instruments with optional catalog filters.
pub async fn list_instruments(
    Query(params): Query<InstrumentListQuery>,
    State(state): State<AppState>,
) -> Result<Json<InstrumentListResponse>, CoreError> {
    let query = params.into_catalog_query()?;
    let instruments = state.store.query(&query);
    Ok(Json(InstrumentListResponse {
        count: instruments.len(),
        instruments,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

pub async fn get_instrument(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Instrument>, CoreError> {
    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| CoreError::not_found(format!("instrument {id}")))
}

/// Insert a new instrument and wire it into the correlation graph.
pub async fn create_instrument(
    State(state): State<AppState>,
    Json(instrument): Json<Instrument>,
) -> Result<(StatusCode, Json<Instrument>), CoreError> {
    if instrument.id.trim().is_empty() {
        return Err(CoreError::invalid("instrumentId must not be empty"));
    }
    let id = instrument.id.clone();
    let traits = InstrumentTraits::from(&instrument);
    state.store.insert(instrument.clone())?;
    state.correlation.write().add_instrument(&id, traits);
    info!(instrument = %id, kind = instrument.security_type().as_str(), "instrument added");
    Ok((StatusCode::CREATED, Json(instrument)))
}

/// Merge-update fields on an instrument. Changes flow to subscribers as a
/// regular delta.
pub async fn update_instrument(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Instrument>, CoreError> {
    let fields = body
        .as_object()
        .ok_or_else(|| CoreError::invalid("update body must be a JSON object"))?;

    let delta = state
        .delta_engine
        .try_mutate_and_emit(&id, |instrument| instrument.merge_json(fields))?;

    if let Some(delta) = delta {
        if state.delta_tx.send(delta).await.is_err() {
            warn!(instrument = %id, "delta pipeline closed; admin update not fanned out");
        }
    }

    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| CoreError::not_found(format!("instrument {id}")))
}

/// Remove an instrument and erase its correlation rows.
pub async fn delete_instrument(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, CoreError> {
    state.store.remove(&id)?;
    state.correlation.write().remove_instrument(&id);
    info!(instrument = %id, "instrument removed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationView {
    pub enabled: bool,
    pub scenario: String,
    pub time_of_day: String,
    pub volatility_factor: f64,
    pub flash_event_probability: f64,
    pub flash_event_magnitude: f64,
}

impl SimulationView {
    fn from_state(state: &AppState) -> Self {
        let settings = state.simulation.read();
        Self {
            enabled: settings.enabled,
            scenario: settings.scenario.as_str().to_string(),
            time_of_day: settings.time_of_day.as_str().to_string(),
            volatility_factor: settings.volatility_factor,
            flash_event_probability: settings.flash_event_probability,
            flash_event_magnitude: settings.flash_event_magnitude,
        }
    }
}

pub async fn get_simulation(State(state): State<AppState>) -> Json<SimulationView> {
    Json(SimulationView::from_state(&state))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationUpdate {
    pub enabled: Option<bool>,
    pub scenario: Option<String>,
    pub time_of_day: Option<String>,
    pub volatility_factor: Option<f64>,
    pub flash_event_probability: Option<f64>,
    pub flash_event_magnitude: Option<f64>,
}

/// Adjust the running simulation. The ticker re-reads settings each tick.
pub async fn update_simulation(
    State(state): State<AppState>,
    Json(update): Json<SimulationUpdate>,
) -> Result<Json<SimulationView>, CoreError> {
    let scenario = update
        .scenario
        .as_deref()
        .map(|raw| {
            Scenario::parse(raw)
                .ok_or_else(|| CoreError::invalid(format!("unknown scenario '{raw}'")))
        })
        .transpose()?;
    let time_of_day = update
        .time_of_day
        .as_deref()
        .map(|raw| {
            TimeOfDayMode::parse(raw)
                .ok_or_else(|| CoreError::invalid(format!("unknown timeOfDay '{raw}'")))
        })
        .transpose()?;
    if let Some(v) = update.volatility_factor {
        if !(0.0..=1.0).contains(&v) {
            return Err(CoreError::invalid("volatilityFactor must be in 0..=1"));
        }
    }
    if let Some(p) = update.flash_event_probability {
        if !(0.0..=1.0).contains(&p) {
            return Err(CoreError::invalid("flashEventProbability must be in 0..=1"));
        }
    }
    if let Some(m) = update.flash_event_magnitude {
        if m <= 0.0 {
            return Err(CoreError::invalid("flashEventMagnitude must be positive"));
        }
    }

    {
        let mut settings = state.simulation.write();
        if let Some(enabled) = update.enabled {
            settings.enabled = enabled;
        }
        if let Some(scenario) = scenario {
            settings.scenario = scenario;
        }
        if let Some(time_of_day) = time_of_day {
            settings.time_of_day = time_of_day;
        }
        if let Some(v) = update.volatility_factor {
            settings.volatility_factor = v;
        }
        if let Some(p) = update.flash_event_probability {
            settings.flash_event_probability = p;
        }
        if let Some(m) = update.flash_event_magnitude {
            settings.flash_event_magnitude = m;
        }
        info!(
            enabled = settings.enabled,
            scenario = settings.scenario.as_str(),
            "simulation settings updated"
        );
    }

    Ok(Json(SimulationView::from_state(&state)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub instruments: usize,
    pub sessions: usize,
    pub subscriptions: usize,
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub timestamp: String,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        instruments: state.store.len(),
        sessions: state.registry.session_count(),
        subscriptions: state.registry.subscription_count(),
        counters: state.stats.snapshot(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
