//! Growth-phase state machine for grows and zones.
//!
//! Transitions go through the store's atomic `update_grow_phase`, and every
//! transition on one entity is serialized by a per-entity async lock, so the
//! "exactly one open phase interval" history invariant holds under concurrent
//! callers. Reads of the current phase are plain store reads.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::{DurationRange, GrowthPhase, PhaseCatalog},
    error::PhaseError,
    rules::Severity,
    store::{Grow, NewAlert, Store},
};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceVerdict {
    NotYet,
    Recommended,
    Required,
}

/// Result of [`PhaseManager::should_advance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceRecommendation {
    pub verdict: AdvanceVerdict,
    pub reason: String,
    pub days_in_phase: i64,
}

impl AdvanceRecommendation {
    pub fn should_advance(&self) -> bool {
        self.verdict != AdvanceVerdict::NotYet
    }
}

/// A completed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    pub grow_id: Uuid,
    pub from: GrowthPhase,
    pub to: GrowthPhase,
    pub days_in_phase: i64,
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingDays {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrowStatus {
    // ---
    pub grow_id: Uuid,
    pub zone_id: Uuid,
    pub name: String,
    pub strain: Option<String>,
    pub current_phase: GrowthPhase,
    pub phase_started: DateTime<Utc>,
    pub days_in_phase: i64,
    pub total_days: i64,
    pub remaining_days: RemainingDays,
    pub next_phase: Option<GrowthPhase>,
    pub recommendation: AdvanceRecommendation,
}

/// Active grows per phase, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSummaryEntry {
    pub phase: GrowthPhase,
    pub active_grows: usize,
    pub expected_duration_days: Option<[u32; 2]>,
    pub grow_names: Vec<String>,
}

/// Outcome of one periodic review pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReviewReport {
    pub grows_reviewed: usize,
    pub zones_synced: usize,
    pub alerts_raised: usize,
}

/// Whole days elapsed since `started`; never negative.
pub fn days_since(started: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - started).num_days().max(0)
}

// ---

pub struct PhaseManager {
    // ---
    store: Arc<dyn Store>,
    catalog: Arc<PhaseCatalog>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Grows already alerted as overdue in their current phase.
    overdue: Mutex<HashSet<(Uuid, GrowthPhase)>>,
}

impl PhaseManager {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<PhaseCatalog>) -> Self {
        Self {
            store,
            catalog,
            locks: Mutex::new(HashMap::new()),
            overdue: Mutex::new(HashSet::new()),
        }
    }

    /// Lock serializing transitions on one grow or zone.
    fn entity_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(id)
            .or_default()
            .clone()
    }

    fn duration(&self, phase: GrowthPhase) -> DurationRange {
        self.catalog.duration(phase).unwrap_or(DurationRange {
            min_days: 0,
            max_days: 0,
        })
    }

    fn active_grow(grow: Option<Grow>, id: Uuid) -> Result<Grow, PhaseError> {
        // ---
        let grow = grow.ok_or(PhaseError::GrowNotFound(id))?;
        if !grow.is_active {
            return Err(PhaseError::GrowInactive(id));
        }
        Ok(grow)
    }

    // --- transitions

    /// Move a grow to the next phase in sequence.
    ///
    /// Without `force` the current phase's minimum duration must have elapsed.
    pub async fn advance_grow(
        &self,
        grow_id: Uuid,
        notes: Option<&str>,
        force: bool,
    ) -> Result<PhaseTransition, PhaseError> {
        // ---
        let lock = self.entity_lock(grow_id);
        let _guard = lock.lock().await;

        let grow = Self::active_grow(self.store.get_grow(grow_id).await?, grow_id)?;
        let current: GrowthPhase = grow.current_phase.parse()?;
        let next = current.next().ok_or(PhaseError::NoNextPhase(current))?;
        let days = days_since(grow.phase_started, Utc::now());

        if !force {
            let min_days = self.duration(current).min_days;
            if days < i64::from(min_days) {
                return Err(PhaseError::MinimumDurationNotMet {
                    phase: current,
                    days,
                    min_days,
                });
            }
        }

        self.store.update_grow_phase(grow_id, next, notes).await?;
        info!(grow = %grow_id, from = %current, to = %next, days, force, "Grow phase advanced");

        Ok(PhaseTransition {
            grow_id,
            from: current,
            to: next,
            days_in_phase: days,
            forced: force,
        })
    }

    /// Set any phase on an active grow, ignoring sequence and duration.
    pub async fn set_grow_phase(
        &self,
        grow_id: Uuid,
        phase: GrowthPhase,
        notes: Option<&str>,
    ) -> Result<PhaseTransition, PhaseError> {
        // ---
        let lock = self.entity_lock(grow_id);
        let _guard = lock.lock().await;

        let grow = Self::active_grow(self.store.get_grow(grow_id).await?, grow_id)?;
        let from: GrowthPhase = grow.current_phase.parse()?;
        let days = days_since(grow.phase_started, Utc::now());

        self.store.update_grow_phase(grow_id, phase, notes).await?;
        info!(grow = %grow_id, %from, to = %phase, "Grow phase set");

        Ok(PhaseTransition {
            grow_id,
            from,
            to: phase,
            days_in_phase: days,
            forced: true,
        })
    }

    pub async fn set_zone_phase(&self, zone_id: Uuid, phase: GrowthPhase) -> Result<(), PhaseError> {
        // ---
        let lock = self.entity_lock(zone_id);
        let _guard = lock.lock().await;

        self.store
            .get_zone(zone_id)
            .await?
            .ok_or(PhaseError::ZoneNotFound(zone_id))?;
        self.store.update_zone_phase(zone_id, phase).await?;
        info!(zone = %zone_id, %phase, "Zone phase set");
        Ok(())
    }

    /// Align the zone's phase with its oldest active grow. Returns the zone's
    /// phase, or `None` when the zone has no active grows.
    pub async fn sync_zone_phase(&self, zone_id: Uuid) -> Result<Option<GrowthPhase>, PhaseError> {
        // ---
        let lock = self.entity_lock(zone_id);
        let _guard = lock.lock().await;

        let zone = self
            .store
            .get_zone(zone_id)
            .await?
            .ok_or(PhaseError::ZoneNotFound(zone_id))?;

        let grows = self.store.list_active_grows(Some(zone_id)).await?;
        let Some(oldest) = grows.iter().min_by_key(|g| g.grow_started) else {
            return Ok(None);
        };
        let phase: GrowthPhase = oldest.current_phase.parse()?;

        if zone.current_phase.as_deref() != Some(phase.as_str()) {
            self.store.update_zone_phase(zone_id, phase).await?;
            info!(zone = %zone_id, %phase, grow = %oldest.id, "Zone phase synced");
        }
        Ok(Some(phase))
    }

    // --- queries

    /// Recommendation for a phase entered at `started_at`, as of now.
    pub fn should_advance(
        &self,
        phase: GrowthPhase,
        started_at: DateTime<Utc>,
    ) -> AdvanceRecommendation {
        self.should_advance_at(phase, started_at, Utc::now())
    }

    pub fn should_advance_at(
        &self,
        phase: GrowthPhase,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AdvanceRecommendation {
        // ---
        let DurationRange { min_days, max_days } = self.duration(phase);
        let days = days_since(started_at, now);

        let (verdict, reason) = if days < i64::from(min_days) {
            (
                AdvanceVerdict::NotYet,
                format!("minimum duration not reached ({days}/{min_days} days)"),
            )
        } else if days >= i64::from(max_days) {
            (
                AdvanceVerdict::Required,
                format!("maximum duration reached ({days}/{max_days} days)"),
            )
        } else {
            (
                AdvanceVerdict::Recommended,
                format!("minimum duration reached ({days} days), transition possible"),
            )
        };

        AdvanceRecommendation {
            verdict,
            reason,
            days_in_phase: days,
        }
    }

    pub fn remaining_days(
        &self,
        phase: GrowthPhase,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RemainingDays {
        // ---
        let range = self.duration(phase);
        let days = days_since(started_at, now);
        RemainingDays {
            min: (i64::from(range.min_days) - days).max(0),
            max: (i64::from(range.max_days) - days).max(0),
        }
    }

    /// The zone's current phase. An unparseable stored phase reads as `None`.
    pub async fn current_zone_phase(&self, zone_id: Uuid) -> Result<Option<GrowthPhase>, PhaseError> {
        // ---
        let zone = self
            .store
            .get_zone(zone_id)
            .await?
            .ok_or(PhaseError::ZoneNotFound(zone_id))?;

        Ok(zone.current_phase.as_deref().and_then(|raw| match raw.parse() {
            Ok(phase) => Some(phase),
            Err(_) => {
                warn!(zone = %zone_id, phase = raw, "Zone has an unknown phase");
                None
            }
        }))
    }

    fn status_of(&self, grow: &Grow, now: DateTime<Utc>) -> Result<GrowStatus, PhaseError> {
        // ---
        let phase: GrowthPhase = grow.current_phase.parse()?;
        Ok(GrowStatus {
            grow_id: grow.id,
            zone_id: grow.zone_id,
            name: grow.name.clone(),
            strain: grow.strain.clone(),
            current_phase: phase,
            phase_started: grow.phase_started,
            days_in_phase: days_since(grow.phase_started, now),
            total_days: days_since(grow.grow_started, now),
            remaining_days: self.remaining_days(phase, grow.phase_started, now),
            next_phase: phase.next(),
            recommendation: self.should_advance_at(phase, grow.phase_started, now),
        })
    }

    pub async fn grow_status(&self, grow_id: Uuid) -> Result<Option<GrowStatus>, PhaseError> {
        // ---
        match self.store.get_grow(grow_id).await? {
            Some(grow) => Ok(Some(self.status_of(&grow, Utc::now())?)),
            None => Ok(None),
        }
    }

    pub async fn phase_summary(&self) -> Result<Vec<PhaseSummaryEntry>, PhaseError> {
        // ---
        let grows = self.store.list_active_grows(None).await?;

        Ok(GrowthPhase::SEQUENCE
            .iter()
            .map(|&phase| {
                let names: Vec<String> = grows
                    .iter()
                    .filter(|g| g.current_phase == phase.as_str())
                    .map(|g| g.name.clone())
                    .collect();
                PhaseSummaryEntry {
                    phase,
                    active_grows: names.len(),
                    expected_duration_days: self.catalog.duration(phase).map(Into::into),
                    grow_names: names,
                }
            })
            .collect())
    }

    /// Periodic job: sync every zone with active grows and raise an INFO alert
    /// for each grow that has outstayed its phase's maximum duration.
    ///
    /// A grow is alerted once per phase. It is alerted again only after it
    /// has left the overdue state and come back to it.
    pub async fn review_active_grows(&self) -> Result<ReviewReport, PhaseError> {
        // ---
        let now = Utc::now();
        let grows = self.store.list_active_grows(None).await?;
        let mut report = ReviewReport {
            grows_reviewed: grows.len(),
            ..Default::default()
        };

        let mut zones: Vec<Uuid> = grows.iter().map(|g| g.zone_id).collect();
        zones.sort();
        zones.dedup();
        for zone_id in zones {
            match self.sync_zone_phase(zone_id).await {
                Ok(Some(_)) => report.zones_synced += 1,
                Ok(None) => {}
                Err(err) => warn!(zone = %zone_id, error = %err, "Zone phase sync failed"),
            }
        }

        let notified = self.overdue.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut still_overdue = HashSet::new();

        for grow in &grows {
            let status = match self.status_of(grow, now) {
                Ok(status) => status,
                Err(err) => {
                    warn!(grow = %grow.id, error = %err, "Skipping grow in review");
                    continue;
                }
            };
            if status.recommendation.verdict != AdvanceVerdict::Required {
                continue;
            }

            let key = (grow.id, status.current_phase);
            if notified.contains(&key) {
                still_overdue.insert(key);
                continue;
            }

            let alert = NewAlert {
                alert_type: "phase".to_string(),
                message: format!(
                    "Grow '{}' should leave {}: {}",
                    grow.name, status.current_phase, status.recommendation.reason
                ),
                severity: Severity::Info,
                zone_id: Some(grow.zone_id),
                device_id: None,
                sensor_type: None,
                value: Some(status.days_in_phase as f64),
                threshold_min: None,
                threshold_max: self
                    .catalog
                    .duration(status.current_phase)
                    .map(|d| f64::from(d.max_days)),
            };
            self.store.create_alert(&alert).await?;
            still_overdue.insert(key);
            report.alerts_raised += 1;
        }
        *self.overdue.lock().unwrap_or_else(|p| p.into_inner()) = still_overdue;

        info!(
            grows = report.grows_reviewed,
            zones = report.zones_synced,
            alerts = report.alerts_raised,
            "Phase review complete"
        );
        Ok(report)
    }
}
