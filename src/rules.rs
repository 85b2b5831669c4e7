//! Rule engine: threshold rules per sensor kind and phase-target evaluation.
//!
//! Evaluation is pure: it reads the rule registry and the phase catalog and
//! returns [`RuleResult`]s. Side effects happen only in [`RuleEngine::execute_actions`],
//! which routes each triggered result to the handlers registered for its
//! [`RuleAction`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    catalog::{AlertThresholds, PhaseCatalog, PhaseDefinition, TargetRange},
    error::ActionError,
    models::SensorKind,
};

/// Minimum spacing between dispatches of one rule for one zone.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    InRange,
    OutOfRange,
}

/// Scalar or `[low, high]` threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Scalar(f64),
    Range(f64, f64),
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Scalar(v) => write!(f, "{v}"),
            Threshold::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

impl From<TargetRange> for Threshold {
    fn from(range: TargetRange) -> Self {
        Threshold::Range(range.low, range.high)
    }
}

/// What happens when a rule triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Alert,
    Log,
    Actuator,
    Webhook,
}

// ---

/// A named threshold check against one sensor kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    // ---
    pub name: String,
    pub sensor_kind: SensorKind,
    pub operator: Operator,
    pub threshold: Threshold,
    pub severity: Severity,
    /// Supports `{sensor_type}`, `{value}` and `{threshold}` placeholders.
    pub message_template: String,
    pub action: RuleAction,
    pub action_params: serde_json::Value,
    pub enabled: bool,
    #[serde(skip)]
    pub cooldown: Duration,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        sensor_kind: SensorKind,
        operator: Operator,
        threshold: Threshold,
    ) -> Self {
        // ---
        Self {
            name: name.into(),
            sensor_kind,
            operator,
            threshold,
            severity: Severity::Warning,
            message_template: "{sensor_type} value {value} (threshold {threshold})".to_string(),
            action: RuleAction::Alert,
            action_params: serde_json::Value::Null,
            enabled: true,
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message_template = template.into();
        self
    }

    pub fn with_action(mut self, action: RuleAction, params: serde_json::Value) -> Self {
        self.action = action;
        self.action_params = params;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Whether `value` satisfies the operator. A threshold shape that does not
    /// fit the operator never triggers.
    pub fn matches(&self, value: f64) -> bool {
        // ---
        match (self.operator, self.threshold) {
            (Operator::Lt, Threshold::Scalar(t)) => value < t,
            (Operator::Le, Threshold::Scalar(t)) => value <= t,
            (Operator::Gt, Threshold::Scalar(t)) => value > t,
            (Operator::Ge, Threshold::Scalar(t)) => value >= t,
            (Operator::Eq, Threshold::Scalar(t)) => value == t,
            (Operator::Ne, Threshold::Scalar(t)) => value != t,
            (Operator::InRange, Threshold::Range(lo, hi)) => lo <= value && value <= hi,
            (Operator::OutOfRange, Threshold::Range(lo, hi)) => value < lo || value > hi,
            _ => false,
        }
    }

    /// Evaluate against one value. Disabled rules never trigger.
    pub fn evaluate(&self, value: f64) -> RuleResult {
        // ---
        let triggered = self.enabled && self.matches(value);
        let message = if triggered {
            self.message_template
                .replace("{sensor_type}", self.sensor_kind.as_str())
                .replace("{value}", &value.to_string())
                .replace("{threshold}", &self.threshold.to_string())
        } else {
            String::new()
        };

        RuleResult {
            rule_name: self.name.clone(),
            sensor_kind: self.sensor_kind.clone(),
            triggered,
            severity: self.severity,
            message,
            value,
            threshold: self.threshold,
            action: self.action,
            action_params: self.action_params.clone(),
            cooldown: self.cooldown,
        }
    }
}

/// Outcome of one rule evaluation. Produced per call, never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    // ---
    pub rule_name: String,
    pub sensor_kind: SensorKind,
    pub triggered: bool,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: Threshold,
    pub action: RuleAction,
    pub action_params: serde_json::Value,
    #[serde(skip)]
    pub cooldown: Duration,
}

/// Where a result came from, passed to action handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionContext {
    pub zone_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub device_key: Option<String>,
}

/// Handler for one [`RuleAction`] tag, registered at startup.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &ActionContext, result: &RuleResult) -> Result<(), ActionError>;
}

// ---

/// Phase-target check for one sensor kind.
struct PhaseCheck {
    kind: SensorKind,
    rule_name: &'static str,
    label: &'static str,
    unit: &'static str,
    /// Deviation beyond the range above which a violation is critical.
    critical_margin: Option<f64>,
    action: RuleAction,
    target: fn(&PhaseDefinition) -> Option<TargetRange>,
}

fn phase_checks() -> [PhaseCheck; 7] {
    // ---
    [
        PhaseCheck {
            kind: SensorKind::Temperature,
            rule_name: "phase_temperature",
            label: "Temperature",
            unit: "°C",
            critical_margin: Some(5.0),
            action: RuleAction::Alert,
            target: |p| p.environment.temperature(),
        },
        PhaseCheck {
            kind: SensorKind::Humidity,
            rule_name: "phase_humidity",
            label: "Humidity",
            unit: "%",
            critical_margin: Some(10.0),
            action: RuleAction::Alert,
            target: |p| Some(p.environment.humidity_percent),
        },
        PhaseCheck {
            kind: SensorKind::Vpd,
            rule_name: "phase_vpd",
            label: "VPD",
            unit: " kPa",
            critical_margin: None,
            action: RuleAction::Alert,
            target: |p| p.environment.vpd_kpa,
        },
        PhaseCheck {
            kind: SensorKind::Co2,
            rule_name: "phase_co2",
            label: "CO2",
            unit: " ppm",
            critical_margin: None,
            action: RuleAction::Log,
            target: |p| p.environment.co2_ppm,
        },
        PhaseCheck {
            kind: SensorKind::LightPpfd,
            rule_name: "phase_light_ppfd",
            label: "Light",
            unit: " µmol/m²/s",
            critical_margin: None,
            action: RuleAction::Alert,
            target: |p| p.environment.light_ppfd,
        },
        PhaseCheck {
            kind: SensorKind::Ph,
            rule_name: "phase_ph",
            label: "pH",
            unit: "",
            critical_margin: None,
            action: RuleAction::Alert,
            target: |p| p.nutrients.as_ref().and_then(|n| n.ph),
        },
        PhaseCheck {
            kind: SensorKind::Ec,
            rule_name: "phase_ec",
            label: "EC",
            unit: " mS/cm",
            critical_margin: None,
            action: RuleAction::Alert,
            target: |p| p.nutrients.as_ref().and_then(|n| n.ec_ms),
        },
    ]
}

/// Rule registry plus the action-handler table.
pub struct RuleEngine {
    // ---
    catalog: Arc<PhaseCatalog>,
    rules: RwLock<BTreeMap<String, Rule>>,
    handlers: RwLock<HashMap<RuleAction, Vec<Arc<dyn ActionHandler>>>>,
    last_dispatch: Mutex<HashMap<(String, Option<Uuid>), Instant>>,
    actions: TaskTracker,
}

impl RuleEngine {
    /// Build the engine with one rule per configured catalog threshold.
    pub fn new(catalog: Arc<PhaseCatalog>) -> Self {
        // ---
        let engine = Self::empty(catalog);
        for rule in default_rules(&engine.catalog.alerts.critical, &engine.catalog.alerts.warning) {
            engine.add_rule(rule);
        }
        info!(count = engine.rules().len(), "Default rules loaded");
        engine
    }

    /// Engine with no rules; phase evaluation still uses `catalog`.
    pub fn empty(catalog: Arc<PhaseCatalog>) -> Self {
        Self {
            catalog,
            rules: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            last_dispatch: Mutex::new(HashMap::new()),
            actions: TaskTracker::new(),
        }
    }

    fn read_rules(&self) -> RwLockReadGuard<'_, BTreeMap<String, Rule>> {
        self.rules.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_rules(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Rule>> {
        self.rules.write().unwrap_or_else(|p| p.into_inner())
    }

    // --- rule management

    /// Insert a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: Rule) {
        debug!(name = %rule.name, "Rule added");
        self.write_rules().insert(rule.name.clone(), rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        // ---
        let removed = self.write_rules().remove(name).is_some();
        if removed {
            debug!(name, "Rule removed");
        }
        removed
    }

    pub fn get_rule(&self, name: &str) -> Option<Rule> {
        self.read_rules().get(name).cloned()
    }

    /// All rules in name order.
    pub fn rules(&self) -> Vec<Rule> {
        self.read_rules().values().cloned().collect()
    }

    pub fn rules_for(&self, kind: &SensorKind) -> Vec<Rule> {
        self.read_rules()
            .values()
            .filter(|r| &r.sensor_kind == kind)
            .cloned()
            .collect()
    }

    pub fn enable_rule(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable_rule(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        // ---
        match self.write_rules().get_mut(name) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    // --- evaluation

    /// Results for every enabled rule on `kind` that triggers for `value`.
    pub fn evaluate(&self, kind: &SensorKind, value: f64) -> Vec<RuleResult> {
        // ---
        let results: Vec<RuleResult> = self
            .read_rules()
            .values()
            .filter(|r| r.enabled && &r.sensor_kind == kind)
            .map(|r| r.evaluate(value))
            .filter(|res| res.triggered)
            .collect();

        for result in &results {
            info!(
                rule = %result.rule_name,
                value,
                severity = %result.severity,
                "Rule triggered"
            );
        }
        results
    }

    /// Evaluate a reading set against the target ranges of `phase_name`.
    ///
    /// Out-of-range values are WARNING unless they deviate beyond the kind's
    /// critical margin. An unknown phase yields no results.
    pub fn evaluate_phase(
        &self,
        phase_name: &str,
        readings: &HashMap<SensorKind, f64>,
    ) -> Vec<RuleResult> {
        // ---
        let Some(phase) = self.catalog.get_phase(phase_name) else {
            warn!(phase = phase_name, "Unknown phase, skipping target evaluation");
            return Vec::new();
        };

        let mut results = Vec::new();
        for check in phase_checks() {
            let (Some(&value), Some(target)) = (readings.get(&check.kind), (check.target)(phase))
            else {
                continue;
            };
            if target.contains(value) {
                continue;
            }

            let severity = match check.critical_margin {
                Some(margin) if target.deviation(value) > margin => Severity::Critical,
                _ => Severity::Warning,
            };
            let unit = check.unit;
            results.push(RuleResult {
                rule_name: check.rule_name.to_string(),
                sensor_kind: check.kind.clone(),
                triggered: true,
                severity,
                message: format!(
                    "{} {value}{unit} outside phase target ({}-{}{unit})",
                    check.label, target.low, target.high
                ),
                value,
                threshold: target.into(),
                action: check.action,
                action_params: serde_json::Value::Null,
                cooldown: DEFAULT_COOLDOWN,
            });
        }
        results
    }

    // --- action dispatch

    pub fn register_handler(&self, action: RuleAction, handler: Arc<dyn ActionHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(action)
            .or_default()
            .push(handler);
    }

    /// Record a dispatch of `result` for `zone`, returning false when the rule
    /// already fired for that zone within its cooldown.
    fn claim_dispatch(&self, result: &RuleResult, zone: Option<Uuid>) -> bool {
        // ---
        let now = Instant::now();
        let mut last = self.last_dispatch.lock().unwrap_or_else(|p| p.into_inner());
        let key = (result.rule_name.clone(), zone);
        match last.get(&key) {
            Some(at) if now.duration_since(*at) < result.cooldown => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    /// Hand each triggered result to its registered handlers and return the
    /// number of results dispatched. Handlers run as detached tasks, so a
    /// slow handler never holds up the caller; a failing or panicking handler
    /// is logged and does not affect the others. `wait_for_actions` waits for
    /// everything dispatched so far.
    pub fn execute_actions(&self, ctx: &ActionContext, results: &[RuleResult]) -> usize {
        // ---
        let mut dispatched = 0;

        for result in results.iter().filter(|r| r.triggered) {
            if !self.claim_dispatch(result, ctx.zone_id) {
                debug!(rule = %result.rule_name, "Rule in cooldown, not dispatched");
                continue;
            }
            dispatched += 1;

            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(&result.action)
                .cloned()
                .unwrap_or_default();

            for handler in handlers {
                let ctx = ctx.clone();
                let result = result.clone();
                let action = result.action;
                let rule = result.rule_name.clone();

                self.actions.spawn(async move {
                    // Inner task so a panicking handler surfaces as a JoinError
                    let run = tokio::spawn(async move { handler.handle(&ctx, &result).await });
                    match run.await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(?action, %rule, error = %err, "Action handler failed"),
                        Err(err) => error!(?action, %rule, error = %err, "Action handler panicked"),
                    }
                });
            }
        }
        dispatched
    }

    /// Wait until every handler dispatched so far has finished.
    pub async fn wait_for_actions(&self) {
        // ---
        self.actions.close();
        self.actions.wait().await;
        self.actions.reopen();
    }
}

/// Materialize one rule per non-zero catalog threshold.
fn default_rules(critical: &AlertThresholds, warning: &AlertThresholds) -> Vec<Rule> {
    // ---
    use Operator::{Gt, Lt};
    use Severity::{Critical, Warning};

    let specs: [(&str, SensorKind, Operator, Option<f64>, Severity, &str); 13] = [
        (
            "critical_temp_high",
            SensorKind::Temperature,
            Gt,
            critical.temperature_max_c,
            Critical,
            "CRITICAL: temperature {value}°C exceeds maximum of {threshold}°C",
        ),
        (
            "critical_temp_low",
            SensorKind::Temperature,
            Lt,
            critical.temperature_min_c,
            Critical,
            "CRITICAL: temperature {value}°C below minimum of {threshold}°C",
        ),
        (
            "warning_temp_high",
            SensorKind::Temperature,
            Gt,
            warning.temperature_high_c,
            Warning,
            "WARNING: temperature {value}°C is high (warning level {threshold}°C)",
        ),
        (
            "warning_temp_low",
            SensorKind::Temperature,
            Lt,
            warning.temperature_low_c,
            Warning,
            "WARNING: temperature {value}°C is low (warning level {threshold}°C)",
        ),
        (
            "critical_humidity_high",
            SensorKind::Humidity,
            Gt,
            critical.humidity_max_percent,
            Critical,
            "CRITICAL: humidity {value}% exceeds maximum of {threshold}%",
        ),
        (
            "critical_humidity_low",
            SensorKind::Humidity,
            Lt,
            critical.humidity_min_percent,
            Critical,
            "CRITICAL: humidity {value}% below minimum of {threshold}%",
        ),
        (
            "warning_humidity_high",
            SensorKind::Humidity,
            Gt,
            warning.humidity_high_percent,
            Warning,
            "WARNING: humidity {value}% is high (warning level {threshold}%)",
        ),
        (
            "warning_humidity_low",
            SensorKind::Humidity,
            Lt,
            warning.humidity_low_percent,
            Warning,
            "WARNING: humidity {value}% is low (warning level {threshold}%)",
        ),
        (
            "critical_vpd_high",
            SensorKind::Vpd,
            Gt,
            critical.vpd_max_kpa,
            Critical,
            "CRITICAL: VPD {value} kPa exceeds maximum of {threshold} kPa",
        ),
        (
            "critical_vpd_low",
            SensorKind::Vpd,
            Lt,
            critical.vpd_min_kpa,
            Critical,
            "CRITICAL: VPD {value} kPa below minimum of {threshold} kPa",
        ),
        (
            "critical_ph_high",
            SensorKind::Ph,
            Gt,
            critical.ph_max,
            Critical,
            "CRITICAL: pH {value} exceeds maximum of {threshold}",
        ),
        (
            "critical_ph_low",
            SensorKind::Ph,
            Lt,
            critical.ph_min,
            Critical,
            "CRITICAL: pH {value} below minimum of {threshold}",
        ),
        (
            "critical_ec_high",
            SensorKind::Ec,
            Gt,
            critical.ec_max_ms,
            Critical,
            "CRITICAL: EC {value} mS/cm exceeds maximum of {threshold} mS/cm",
        ),
    ];

    specs
        .into_iter()
        .filter_map(|(name, kind, op, threshold, severity, template)| {
            let value = threshold.filter(|v| *v != 0.0)?;
            Some(
                Rule::new(name, kind, op, Threshold::Scalar(value))
                    .with_severity(severity)
                    .with_message(template),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> RuleEngine {
        RuleEngine::new(Arc::new(PhaseCatalog::builtin().unwrap()))
    }

    fn readings(pairs: &[(SensorKind, f64)]) -> HashMap<SensorKind, f64> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_range_operators() {
        // ---
        let inside = Rule::new("in", SensorKind::Ph, Operator::InRange, Threshold::Range(5.8, 6.5));
        let outside = Rule::new("out", SensorKind::Ph, Operator::OutOfRange, Threshold::Range(5.8, 6.5));

        for v in [5.0, 5.8, 6.0, 6.5, 7.0] {
            let lo_hi = (5.8..=6.5).contains(&v);
            assert_eq!(inside.evaluate(v).triggered, lo_hi, "in_range {v}");
            assert_eq!(outside.evaluate(v).triggered, !lo_hi, "out_of_range {v}");
        }
    }

    #[test]
    fn test_scalar_operators() {
        // ---
        let t = Threshold::Scalar(10.0);
        let rule = |op| Rule::new("r", SensorKind::Co2, op, t);

        assert!(rule(Operator::Lt).matches(9.0) && !rule(Operator::Lt).matches(10.0));
        assert!(rule(Operator::Le).matches(10.0) && !rule(Operator::Le).matches(10.5));
        assert!(rule(Operator::Gt).matches(11.0) && !rule(Operator::Gt).matches(10.0));
        assert!(rule(Operator::Ge).matches(10.0) && !rule(Operator::Ge).matches(9.5));
        assert!(rule(Operator::Eq).matches(10.0) && !rule(Operator::Eq).matches(10.1));
        assert!(rule(Operator::Ne).matches(10.1) && !rule(Operator::Ne).matches(10.0));
    }

    #[test]
    fn test_mismatched_threshold_never_triggers() {
        // ---
        let scalar_range = Rule::new("a", SensorKind::Ph, Operator::InRange, Threshold::Scalar(6.0));
        let range_scalar = Rule::new("b", SensorKind::Ph, Operator::Gt, Threshold::Range(1.0, 2.0));

        for v in [-100.0, 0.0, 6.0, 100.0] {
            assert!(!scalar_range.evaluate(v).triggered);
            assert!(!range_scalar.evaluate(v).triggered);
        }
    }

    #[test]
    fn test_default_rules_from_catalog() {
        // ---
        let engine = engine();
        let names: Vec<String> = engine.rules().into_iter().map(|r| r.name).collect();

        assert_eq!(names.len(), 13);
        assert!(names.contains(&"critical_ec_high".to_string()));
        assert!(names.contains(&"warning_humidity_low".to_string()));
    }

    #[test]
    fn test_zero_threshold_is_skipped() {
        // ---
        let critical = AlertThresholds {
            temperature_max_c: Some(0.0),
            ph_max: Some(7.5),
            ..Default::default()
        };
        let rules = default_rules(&critical, &AlertThresholds::default());

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "critical_ph_high");
    }

    #[test]
    fn test_evaluate_matches_kind_and_renders_message() {
        // ---
        let engine = engine();

        let hot = engine.evaluate(&SensorKind::Temperature, 36.0);
        let names: Vec<&str> = hot.iter().map(|r| r.rule_name.as_str()).collect();
        assert_eq!(names, vec!["critical_temp_high", "warning_temp_high"]);
        assert_eq!(
            hot[0].message,
            "CRITICAL: temperature 36°C exceeds maximum of 35°C"
        );

        assert!(engine.evaluate(&SensorKind::Temperature, 24.0).is_empty());
        assert!(engine.evaluate(&SensorKind::Co2, 5000.0).is_empty());
    }

    #[test]
    fn test_disabled_rule_never_triggers() {
        // ---
        let engine = RuleEngine::empty(Arc::new(PhaseCatalog::builtin().unwrap()));
        engine.add_rule(Rule::new("any", SensorKind::Ec, Operator::Ge, Threshold::Scalar(f64::MIN)));

        assert_eq!(engine.evaluate(&SensorKind::Ec, 1.0).len(), 1);
        assert!(engine.disable_rule("any"));
        for v in [f64::MIN, -1.0, 0.0, 1.0, f64::MAX] {
            assert!(engine.evaluate(&SensorKind::Ec, v).is_empty());
        }
        assert!(engine.enable_rule("any"));
        assert_eq!(engine.evaluate(&SensorKind::Ec, 1.0).len(), 1);
        assert!(!engine.disable_rule("missing"));
    }

    #[test]
    fn test_add_replaces_and_remove() {
        // ---
        let engine = RuleEngine::empty(Arc::new(PhaseCatalog::builtin().unwrap()));
        engine.add_rule(Rule::new("x", SensorKind::Ph, Operator::Gt, Threshold::Scalar(7.0)));
        engine.add_rule(Rule::new("x", SensorKind::Ph, Operator::Gt, Threshold::Scalar(8.0)));

        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.get_rule("x").unwrap().threshold, Threshold::Scalar(8.0));
        assert_eq!(engine.rules_for(&SensorKind::Ph).len(), 1);
        assert!(engine.remove_rule("x"));
        assert!(!engine.remove_rule("x"));
        assert!(engine.get_rule("x").is_none());
    }

    #[test]
    fn test_phase_humidity_warning() {
        // ---
        let engine = engine();
        let results = engine.evaluate_phase(
            "flowering_mid",
            &readings(&[(SensorKind::Humidity, 38.0)]),
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Warning);
        assert_eq!(results[0].threshold, Threshold::Range(40.0, 50.0));
        assert_eq!(
            results[0].message,
            "Humidity 38% outside phase target (40-50%)"
        );
    }

    #[test]
    fn test_phase_temperature_critical() {
        // ---
        let engine = engine();
        let results = engine.evaluate_phase(
            "flowering_mid",
            &readings(&[(SensorKind::Temperature, 45.0), (SensorKind::Humidity, 45.0)]),
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_name, "phase_temperature");
        assert_eq!(results[0].severity, Severity::Critical);
        assert_eq!(results[0].action, RuleAction::Alert);
    }

    #[test]
    fn test_phase_margin_boundaries() {
        // ---
        let engine = engine();
        // [20,26] + 5 = 31 is still a warning, beyond it is critical
        let at_margin = engine.evaluate_phase("flowering_mid", &readings(&[(SensorKind::Temperature, 31.0)]));
        assert_eq!(at_margin[0].severity, Severity::Warning);

        let humid = engine.evaluate_phase("flowering_mid", &readings(&[(SensorKind::Humidity, 61.0)]));
        assert_eq!(humid[0].severity, Severity::Critical);

        // No margin for VPD, always a warning
        let vpd = engine.evaluate_phase("flowering_mid", &readings(&[(SensorKind::Vpd, 9.0)]));
        assert_eq!(vpd[0].severity, Severity::Warning);
    }

    #[test]
    fn test_phase_co2_is_logged_and_nutrients_checked() {
        // ---
        let engine = engine();
        let results = engine.evaluate_phase(
            "vegetative_late",
            &readings(&[
                (SensorKind::Co2, 300.0),
                (SensorKind::Ph, 7.0),
                (SensorKind::Ec, 1.4),
            ]),
        );

        let names: Vec<&str> = results.iter().map(|r| r.rule_name.as_str()).collect();
        assert_eq!(names, vec!["phase_co2", "phase_ph"]);
        assert_eq!(results[0].action, RuleAction::Log);
    }

    #[test]
    fn test_unknown_phase_is_empty() {
        // ---
        let engine = engine();
        let results = engine.evaluate_phase("blooming", &readings(&[(SensorKind::Temperature, 99.0)]));
        assert!(results.is_empty());
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ActionHandler for Counting {
        async fn handle(&self, _: &ActionContext, _: &RuleResult) -> Result<(), ActionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ActionHandler for Failing {
        async fn handle(&self, _: &ActionContext, _: &RuleResult) -> Result<(), ActionError> {
            Err(ActionError::MissingParam("device_id"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ActionHandler for Panicking {
        async fn handle(&self, _: &ActionContext, _: &RuleResult) -> Result<(), ActionError> {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        // ---
        let engine = engine();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        engine.register_handler(RuleAction::Alert, Arc::new(Failing));
        engine.register_handler(RuleAction::Alert, Arc::new(Panicking));
        engine.register_handler(RuleAction::Alert, counter.clone());

        let results = engine.evaluate(&SensorKind::Temperature, 40.0);
        let dispatched = engine.execute_actions(&ActionContext::default(), &results);
        engine.wait_for_actions().await;

        assert_eq!(dispatched, 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeat_dispatch() {
        // ---
        let engine = engine();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        engine.register_handler(RuleAction::Alert, counter.clone());

        let zone = ActionContext {
            zone_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let other_zone = ActionContext {
            zone_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let results = engine.evaluate(&SensorKind::Ph, 8.0);

        assert_eq!(engine.execute_actions(&zone, &results), 1);
        assert_eq!(engine.execute_actions(&zone, &results), 0);
        assert_eq!(engine.execute_actions(&other_zone, &results), 1);

        tokio::time::advance(DEFAULT_COOLDOWN).await;
        assert_eq!(engine.execute_actions(&zone, &results), 1);
        engine.wait_for_actions().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }
}
