//! Phase catalog: the ordered growth-phase sequence, per-phase duration bounds
//! and environmental/nutrient target ranges, plus the global alert thresholds.
//!
//! The catalog is static reference data. It is loaded once at startup (from
//! the built-in JSON document or a file override), validated, and then shared
//! read-only behind an `Arc`.

use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, PhaseError};

/// Built-in catalog shipped with the crate.
const BUILTIN_CATALOG: &str = include_str!("../data/phases.json");

// ---

/// One stage of a cultivation cycle. Declaration order is the sequence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPhase {
    Germination,
    Seedling,
    VegetativeEarly,
    VegetativeLate,
    Transition,
    FloweringEarly,
    FloweringMid,
    FloweringLate,
    Flush,
    Drying,
    Curing,
}

impl GrowthPhase {
    /// The full sequence, first to terminal.
    pub const SEQUENCE: [GrowthPhase; 11] = [
        GrowthPhase::Germination,
        GrowthPhase::Seedling,
        GrowthPhase::VegetativeEarly,
        GrowthPhase::VegetativeLate,
        GrowthPhase::Transition,
        GrowthPhase::FloweringEarly,
        GrowthPhase::FloweringMid,
        GrowthPhase::FloweringLate,
        GrowthPhase::Flush,
        GrowthPhase::Drying,
        GrowthPhase::Curing,
    ];

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            GrowthPhase::Germination => "germination",
            GrowthPhase::Seedling => "seedling",
            GrowthPhase::VegetativeEarly => "vegetative_early",
            GrowthPhase::VegetativeLate => "vegetative_late",
            GrowthPhase::Transition => "transition",
            GrowthPhase::FloweringEarly => "flowering_early",
            GrowthPhase::FloweringMid => "flowering_mid",
            GrowthPhase::FloweringLate => "flowering_late",
            GrowthPhase::Flush => "flush",
            GrowthPhase::Drying => "drying",
            GrowthPhase::Curing => "curing",
        }
    }

    fn position(self) -> usize {
        Self::SEQUENCE
            .iter()
            .position(|p| *p == self)
            .unwrap_or_default()
    }

    /// Phase that follows this one, `None` at curing.
    pub fn next(self) -> Option<GrowthPhase> {
        Self::SEQUENCE.get(self.position() + 1).copied()
    }

    /// Phase that precedes this one, `None` at germination.
    pub fn previous(self) -> Option<GrowthPhase> {
        self.position()
            .checked_sub(1)
            .and_then(|i| Self::SEQUENCE.get(i).copied())
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for GrowthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthPhase {
    type Err = PhaseError;

    /// Accepts `flowering_mid`, `flowering-mid` and any letter case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::SEQUENCE
            .iter()
            .copied()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| PhaseError::UnknownPhase(s.to_string()))
    }
}

// ---

/// Inclusive `[low, high]` range, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct TargetRange {
    pub low: f64,
    pub high: f64,
}

impl TargetRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }

    /// Absolute distance of `value` outside the range, zero when inside.
    pub fn deviation(&self, value: f64) -> f64 {
        // ---
        if value < self.low {
            self.low - value
        } else if value > self.high {
            value - self.high
        } else {
            0.0
        }
    }
}

impl From<[f64; 2]> for TargetRange {
    fn from(pair: [f64; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }
}

impl From<TargetRange> for [f64; 2] {
    fn from(range: TargetRange) -> Self {
        [range.low, range.high]
    }
}

impl fmt::Display for TargetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// Expected phase length in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct DurationRange {
    pub min_days: u32,
    pub max_days: u32,
}

impl From<[u32; 2]> for DurationRange {
    fn from(pair: [u32; 2]) -> Self {
        Self {
            min_days: pair[0],
            max_days: pair[1],
        }
    }
}

impl From<DurationRange> for [u32; 2] {
    fn from(range: DurationRange) -> Self {
        [range.min_days, range.max_days]
    }
}

/// Environmental targets for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTargets {
    // ---
    #[serde(default)]
    pub temperature_day_c: Option<TargetRange>,
    #[serde(default)]
    pub temperature_night_c: Option<TargetRange>,
    /// Single temperature band for dark phases (drying, curing).
    #[serde(default)]
    pub temperature_c: Option<TargetRange>,
    pub humidity_percent: TargetRange,
    #[serde(default)]
    pub vpd_kpa: Option<TargetRange>,
    #[serde(default)]
    pub co2_ppm: Option<TargetRange>,
    #[serde(default)]
    pub light_ppfd: Option<TargetRange>,
    #[serde(default)]
    pub light_schedule: Option<String>,
}

impl EnvironmentTargets {
    /// Daytime temperature band, or the constant band for dark phases.
    pub fn temperature(&self) -> Option<TargetRange> {
        self.temperature_day_c.or(self.temperature_c)
    }
}

/// Nutrient solution targets for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientTargets {
    // ---
    #[serde(default)]
    pub ec_ms: Option<TargetRange>,
    #[serde(default)]
    pub ph: Option<TargetRange>,
    #[serde(default)]
    pub npk_ratio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    // ---
    pub duration_days: DurationRange,
    #[serde(default)]
    pub description: String,
    pub environment: EnvironmentTargets,
    #[serde(default)]
    pub nutrients: Option<NutrientTargets>,
}

/// Absolute alert thresholds, independent of phase. A missing or zero value
/// means the threshold is not configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    // ---
    pub temperature_max_c: Option<f64>,
    pub temperature_min_c: Option<f64>,
    pub humidity_max_percent: Option<f64>,
    pub humidity_min_percent: Option<f64>,
    pub vpd_max_kpa: Option<f64>,
    pub vpd_min_kpa: Option<f64>,
    pub ph_max: Option<f64>,
    pub ph_min: Option<f64>,
    pub ec_max_ms: Option<f64>,

    pub temperature_high_c: Option<f64>,
    pub temperature_low_c: Option<f64>,
    pub humidity_high_percent: Option<f64>,
    pub humidity_low_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub critical: AlertThresholds,
    pub warning: AlertThresholds,
}

// ---

/// Validated, read-only phase catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCatalog {
    // ---
    pub version: u32,
    phases: HashMap<GrowthPhase, PhaseDefinition>,
    pub alerts: AlertConfig,
}

impl PhaseCatalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Parse and validate a JSON catalog document.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        // ---
        let catalog: PhaseCatalog = serde_json::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load from `path` when given, otherwise fall back to the built-in catalog.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        // ---
        let Some(path) = path else {
            return Self::builtin();
        };

        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            version = catalog.version,
            "Loaded phase catalog override"
        );
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        // ---
        for phase in GrowthPhase::SEQUENCE {
            let def = self
                .phases
                .get(&phase)
                .ok_or(CatalogError::MissingPhase(phase))?;

            let env = &def.environment;
            let nutrients = def.nutrients.as_ref();
            let ranges = [
                ("temperature_day_c", env.temperature_day_c),
                ("temperature_night_c", env.temperature_night_c),
                ("temperature_c", env.temperature_c),
                ("humidity_percent", Some(env.humidity_percent)),
                ("vpd_kpa", env.vpd_kpa),
                ("co2_ppm", env.co2_ppm),
                ("light_ppfd", env.light_ppfd),
                ("ec_ms", nutrients.and_then(|n| n.ec_ms)),
                ("ph", nutrients.and_then(|n| n.ph)),
            ];
            for (field, range) in ranges {
                if matches!(range, Some(r) if r.low > r.high) {
                    return Err(CatalogError::InvertedRange { phase, field });
                }
            }
            if def.duration_days.min_days > def.duration_days.max_days {
                return Err(CatalogError::InvertedRange {
                    phase,
                    field: "duration_days",
                });
            }
        }
        Ok(())
    }

    pub fn phase(&self, phase: GrowthPhase) -> Option<&PhaseDefinition> {
        self.phases.get(&phase)
    }

    /// Look a phase up by its textual name; unknown names yield `None`.
    pub fn get_phase(&self, name: &str) -> Option<&PhaseDefinition> {
        name.parse::<GrowthPhase>()
            .ok()
            .and_then(|phase| self.phase(phase))
    }

    pub fn duration(&self, phase: GrowthPhase) -> Option<DurationRange> {
        self.phase(phase).map(|def| def.duration_days)
    }

    pub fn alert_thresholds(&self) -> &AlertConfig {
        &self.alerts
    }
}

/// Vapour pressure deficit in kPa using the Tetens approximation, with the
/// leaf assumed `leaf_offset_c` cooler than the air.
pub fn calculate_vpd(temperature_c: f64, humidity_percent: f64, leaf_offset_c: f64) -> f64 {
    // ---
    let svp = |t: f64| 0.6108 * ((17.27 * t) / (t + 237.3)).exp();
    let actual = svp(temperature_c) * (humidity_percent / 100.0);
    let vpd = svp(temperature_c - leaf_offset_c) - actual;
    (vpd * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_sequence_is_total_and_terminal() {
        // ---
        assert_eq!(GrowthPhase::Germination.next(), Some(GrowthPhase::Seedling));
        assert_eq!(GrowthPhase::Drying.next(), Some(GrowthPhase::Curing));
        assert_eq!(GrowthPhase::Curing.next(), None);
        assert!(GrowthPhase::Curing.is_terminal());
        assert_eq!(GrowthPhase::Germination.previous(), None);
        assert_eq!(
            GrowthPhase::FloweringEarly.previous(),
            Some(GrowthPhase::Transition)
        );

        let mut phase = GrowthPhase::Germination;
        let mut steps = 0;
        while let Some(next) = phase.next() {
            assert!(next > phase);
            phase = next;
            steps += 1;
        }
        assert_eq!(steps, 10);
    }

    #[test]
    fn test_phase_name_parsing() {
        // ---
        assert_eq!(
            "flowering_mid".parse::<GrowthPhase>().unwrap(),
            GrowthPhase::FloweringMid
        );
        assert_eq!(
            "Vegetative-Early".parse::<GrowthPhase>().unwrap(),
            GrowthPhase::VegetativeEarly
        );
        assert!("blooming".parse::<GrowthPhase>().is_err());
    }

    #[test]
    fn test_builtin_catalog_is_complete() {
        // ---
        let catalog = PhaseCatalog::builtin().unwrap();
        for phase in GrowthPhase::SEQUENCE {
            assert!(catalog.phase(phase).is_some(), "missing {phase}");
        }

        let mid = catalog.get_phase("flowering_mid").unwrap();
        assert_eq!(mid.environment.humidity_percent, TargetRange::new(40.0, 50.0));
        assert_eq!(mid.environment.temperature(), Some(TargetRange::new(20.0, 26.0)));

        // Dark phases fall back to the constant band
        let drying = catalog.phase(GrowthPhase::Drying).unwrap();
        assert_eq!(drying.environment.temperature(), Some(TargetRange::new(18.0, 21.0)));

        assert!(catalog.get_phase("unknown").is_none());
    }

    #[test]
    fn test_inverted_range_rejected() {
        // ---
        let mut doc: serde_json::Value = serde_json::from_str(BUILTIN_CATALOG).unwrap();
        doc["phases"]["seedling"]["environment"]["humidity_percent"] = serde_json::json!([80, 60]);

        let err = PhaseCatalog::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::InvertedRange {
                phase: GrowthPhase::Seedling,
                field: "humidity_percent"
            }
        ));
    }

    #[test]
    fn test_missing_phase_rejected() {
        // ---
        let mut doc: serde_json::Value = serde_json::from_str(BUILTIN_CATALOG).unwrap();
        doc["phases"].as_object_mut().unwrap().remove("curing");

        let err = PhaseCatalog::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, CatalogError::MissingPhase(GrowthPhase::Curing)));
    }

    #[test]
    fn test_range_deviation() {
        // ---
        let range = TargetRange::new(40.0, 50.0);
        assert_eq!(range.deviation(38.0), 2.0);
        assert_eq!(range.deviation(45.0), 0.0);
        assert_eq!(range.deviation(61.0), 11.0);
        assert!(range.contains(40.0) && range.contains(50.0));
    }

    #[test]
    fn test_vpd_calculation() {
        // ---
        // 25°C at 60% with a 2°C cooler leaf lands around 0.91 kPa
        let vpd = calculate_vpd(25.0, 60.0, 2.0);
        assert!((vpd - 0.91).abs() < 0.03, "got {vpd}");
        assert!(calculate_vpd(25.0, 90.0, 2.0) < vpd);
    }
}
