//! Sensor data models: transport payload shapes and the normalized reading.
//!
//! Devices publish either the verbose JSON shape or the compact shape used by
//! memory-constrained boards. Both decode into the same [`SensorBatch`], which
//! the ingestion coordinator turns into [`Reading`] records once the device
//! and zone keys are resolved.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PayloadError;

/// Maximum length of the device and zone keys in a payload.
const MAX_KEY_LEN: usize = 100;

// ---

/// Kind of measurement. Unknown kinds are kept verbatim (lower-cased).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Co2,
    LightPpfd,
    Ph,
    Ec,
    Vpd,
    WaterTemperature,
    WaterLevel,
    Other(String),
}

impl SensorKind {
    pub fn as_str(&self) -> &str {
        // ---
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Co2 => "co2",
            SensorKind::LightPpfd => "light_ppfd",
            SensorKind::Ph => "ph",
            SensorKind::Ec => "ec",
            SensorKind::Vpd => "vpd",
            SensorKind::WaterTemperature => "water_temperature",
            SensorKind::WaterLevel => "water_level",
            SensorKind::Other(name) => name,
        }
    }

    /// Unit a device is expected to report this kind in.
    pub fn default_unit(&self) -> &'static str {
        // ---
        match self {
            SensorKind::Temperature | SensorKind::WaterTemperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::Co2 => "ppm",
            SensorKind::LightPpfd => "µmol/m²/s",
            SensorKind::Ph => "pH",
            SensorKind::Ec => "mS/cm",
            SensorKind::Vpd => "kPa",
            SensorKind::WaterLevel => "cm",
            SensorKind::Other(_) => "",
        }
    }

    /// Code table of the compact payload shape. Unknown codes pass through
    /// lower-cased with an empty unit.
    pub fn from_compact_code(code: &str) -> (SensorKind, String) {
        // ---
        let kind = match code {
            "T" => SensorKind::Temperature,
            "H" => SensorKind::Humidity,
            "C" => SensorKind::Co2,
            "L" => SensorKind::LightPpfd,
            "P" => SensorKind::Ph,
            "E" => SensorKind::Ec,
            "V" => SensorKind::Vpd,
            "W" => SensorKind::WaterTemperature,
            other => return (SensorKind::from(other), String::new()),
        };
        let unit = kind.default_unit().to_string();
        (kind, unit)
    }
}

impl From<&str> for SensorKind {
    fn from(raw: &str) -> Self {
        // ---
        match raw.trim().to_lowercase().as_str() {
            "temperature" => SensorKind::Temperature,
            "humidity" => SensorKind::Humidity,
            "co2" => SensorKind::Co2,
            "light_ppfd" => SensorKind::LightPpfd,
            "ph" => SensorKind::Ph,
            "ec" => SensorKind::Ec,
            "vpd" => SensorKind::Vpd,
            "water_temperature" => SensorKind::WaterTemperature,
            "water_level" => SensorKind::WaterLevel,
            other => SensorKind::Other(other.to_string()),
        }
    }
}

impl From<String> for SensorKind {
    fn from(raw: String) -> Self {
        SensorKind::from(raw.as_str())
    }
}

impl From<SensorKind> for String {
    fn from(kind: SensorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for SensorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SensorKind::from(s))
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a device reports alongside its readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
    Error,
    Calibrating,
}

// ---

/// One measurement inside a payload, before identity resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    // ---
    #[serde(rename = "type")]
    pub kind: SensorKind,
    pub value: f64,
    pub unit: String,
    #[serde(default = "default_quality")]
    pub quality: u8,
}

fn default_quality() -> u8 {
    100
}

/// Verbose payload shape.
#[derive(Debug, Deserialize)]
struct VerbosePayload {
    // ---
    device_id: String,
    zone_id: String,
    #[serde(default)]
    timestamp: Option<String>,
    readings: Vec<VerboseReading>,
    #[serde(default)]
    status: DeviceStatus,
    #[serde(default)]
    firmware_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseReading {
    #[serde(rename = "type")]
    kind: String,
    value: f64,
    unit: String,
    #[serde(default)]
    quality: Option<i64>,
}

/// Compact payload shape: `{"d":..,"z":..,"t":unix,"r":[["T",24.5],..]}`.
#[derive(Debug, Deserialize)]
struct CompactPayload {
    // ---
    d: String,
    z: String,
    #[serde(default)]
    t: Option<i64>,
    r: Vec<(String, f64)>,
}

/// Normalized form of one inbound message, whichever shape it arrived in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorBatch {
    // ---
    pub device_id: String,
    pub zone_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub readings: Vec<SensorValue>,
    pub status: DeviceStatus,
    pub firmware_version: Option<String>,
}

impl SensorBatch {
    /// Decode a raw transport payload. A document carrying both `d` and `r` is
    /// treated as the compact shape, anything else as the verbose shape.
    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        // ---
        let doc: serde_json::Value = serde_json::from_slice(payload)?;
        let is_compact = doc.get("d").is_some() && doc.get("r").is_some();

        let batch = if is_compact {
            let compact: CompactPayload = serde_json::from_value(doc)?;
            Self::from_compact(compact)?
        } else {
            let verbose: VerbosePayload = serde_json::from_value(doc)?;
            Self::from_verbose(verbose)?
        };

        batch.validate()?;
        Ok(batch)
    }

    fn from_verbose(raw: VerbosePayload) -> Result<Self, PayloadError> {
        // ---
        let timestamp = raw.timestamp.as_deref().map(parse_timestamp).transpose()?;

        let readings = raw
            .readings
            .into_iter()
            .map(|r| {
                let quality = match r.quality {
                    None => default_quality(),
                    Some(q) => u8::try_from(q)
                        .ok()
                        .filter(|q| *q <= 100)
                        .ok_or_else(|| PayloadError::Invalid {
                            field: "quality",
                            reason: format!("{q} is outside 0..=100"),
                        })?,
                };
                Ok(SensorValue {
                    kind: SensorKind::from(r.kind),
                    value: r.value,
                    unit: r.unit,
                    quality,
                })
            })
            .collect::<Result<Vec<_>, PayloadError>>()?;

        Ok(SensorBatch {
            device_id: raw.device_id,
            zone_id: raw.zone_id,
            timestamp,
            readings,
            status: raw.status,
            firmware_version: raw.firmware_version,
        })
    }

    fn from_compact(raw: CompactPayload) -> Result<Self, PayloadError> {
        // ---
        let timestamp = raw
            .t
            .map(|secs| {
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| PayloadError::Timestamp(secs.to_string()))
            })
            .transpose()?;

        let readings = raw
            .r
            .into_iter()
            .map(|(code, value)| {
                let (kind, unit) = SensorKind::from_compact_code(&code);
                SensorValue {
                    kind,
                    value,
                    unit,
                    quality: default_quality(),
                }
            })
            .collect();

        Ok(SensorBatch {
            device_id: raw.d,
            zone_id: raw.z,
            timestamp,
            readings,
            status: DeviceStatus::Online,
            firmware_version: None,
        })
    }

    fn validate(&self) -> Result<(), PayloadError> {
        // ---
        for (field, key) in [("device_id", &self.device_id), ("zone_id", &self.zone_id)] {
            if key.is_empty() || key.chars().count() > MAX_KEY_LEN {
                return Err(PayloadError::Invalid {
                    field,
                    reason: format!("length must be 1..={MAX_KEY_LEN}"),
                });
            }
        }
        if self.readings.is_empty() {
            return Err(PayloadError::Invalid {
                field: "readings",
                reason: "at least one reading is required".to_string(),
            });
        }
        if let Some(bad) = self.readings.iter().find(|r| !r.value.is_finite()) {
            return Err(PayloadError::Invalid {
                field: "value",
                reason: format!("{} value is not finite", bad.kind),
            });
        }
        Ok(())
    }

    /// First reading of the given kind, if present.
    pub fn get_reading(&self, kind: &SensorKind) -> Option<&SensorValue> {
        self.readings.iter().find(|r| &r.kind == kind)
    }
}

/// Accepts RFC 3339 (`2024-01-15T14:30:00Z`) or a naive ISO timestamp, which
/// is taken to be UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PayloadError> {
    // ---
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| PayloadError::Timestamp(raw.to_string()))
}

// ---

/// A normalized, resolved reading. Immutable once built; owned by the batch
/// writer until flushed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    // ---
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub zone_id: Uuid,
    pub kind: SensorKind,
    pub value: f64,
    pub unit: String,
    pub quality: u8,
}

impl Reading {
    /// Build the records for a resolved batch; readings without their own
    /// timestamp take `received_at`.
    pub fn from_batch(
        batch: &SensorBatch,
        device_id: Uuid,
        zone_id: Uuid,
        received_at: DateTime<Utc>,
    ) -> Vec<Reading> {
        // ---
        let time = batch.timestamp.unwrap_or(received_at);
        batch
            .readings
            .iter()
            .map(|r| Reading {
                time,
                device_id,
                zone_id,
                kind: r.kind.clone(),
                value: r.value,
                unit: r.unit.clone(),
                quality: r.quality,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_compact_payload_normalization() {
        // ---
        let raw = br#"{"d":"esp01","z":"main","t":1705329000,"r":[["T",24.5],["H",65.2]]}"#;
        let batch = SensorBatch::decode(raw).unwrap();

        assert_eq!(batch.device_id, "esp01");
        assert_eq!(batch.zone_id, "main");
        assert_eq!(
            batch.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap())
        );
        assert_eq!(batch.readings.len(), 2);
        assert_eq!(batch.readings[0].kind, SensorKind::Temperature);
        assert_eq!(batch.readings[0].value, 24.5);
        assert_eq!(batch.readings[0].unit, "°C");
        assert_eq!(batch.readings[1].kind, SensorKind::Humidity);
        assert_eq!(batch.readings[1].value, 65.2);
        assert_eq!(batch.readings[1].unit, "%");
        assert_eq!(batch.readings[1].quality, 100);
    }

    #[test]
    fn test_verbose_and_compact_shapes_are_equivalent() {
        // ---
        let verbose = r#"{
            "device_id": "esp01",
            "zone_id": "main",
            "timestamp": "2024-01-15T14:30:00Z",
            "readings": [
                {"type": "temperature", "value": 24.5, "unit": "°C"},
                {"type": "humidity", "value": 65.2, "unit": "%"},
                {"type": "co2", "value": 850, "unit": "ppm"}
            ]
        }"#
        .as_bytes();
        let compact = br#"{"d":"esp01","z":"main","t":1705329000,"r":[["T",24.5],["H",65.2],["C",850]]}"#;

        let a = SensorBatch::decode(verbose).unwrap();
        let b = SensorBatch::decode(compact).unwrap();
        assert_eq!(a, b);

        let device = Uuid::new_v4();
        let zone = Uuid::new_v4();
        let now = Utc::now();
        assert_eq!(
            Reading::from_batch(&a, device, zone, now),
            Reading::from_batch(&b, device, zone, now)
        );
    }

    #[test]
    fn test_unknown_compact_code_passes_through() {
        // ---
        let raw = br#"{"d":"esp01","z":"main","r":[["X",1.0],["W",19.0]]}"#;
        let batch = SensorBatch::decode(raw).unwrap();

        assert_eq!(batch.readings[0].kind, SensorKind::Other("x".to_string()));
        assert_eq!(batch.readings[0].unit, "");
        assert_eq!(batch.readings[1].kind, SensorKind::WaterTemperature);
        assert!(batch.timestamp.is_none());
    }

    #[test]
    fn test_verbose_type_is_normalized() {
        // ---
        let raw = r#"{"device_id":"a","zone_id":"b","readings":[{"type":" Temperature ","value":21,"unit":"°C","quality":80}],"status":"calibrating"}"#
            .as_bytes();
        let batch = SensorBatch::decode(raw).unwrap();

        assert_eq!(batch.readings[0].kind, SensorKind::Temperature);
        assert_eq!(batch.readings[0].quality, 80);
        assert_eq!(batch.status, DeviceStatus::Calibrating);
        assert!(batch.get_reading(&SensorKind::Temperature).is_some());
        assert!(batch.get_reading(&SensorKind::Humidity).is_none());
    }

    #[test]
    fn test_naive_timestamp_taken_as_utc() {
        // ---
        let raw = br#"{"device_id":"a","zone_id":"b","timestamp":"2024-01-15T14:30:00","readings":[{"type":"ph","value":6.1,"unit":"pH"}]}"#;
        let batch = SensorBatch::decode(raw).unwrap();
        assert_eq!(
            batch.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_payloads_rejected() {
        // ---
        // Not JSON
        assert!(matches!(
            SensorBatch::decode(b"not json"),
            Err(PayloadError::Json(_))
        ));

        // No readings
        let empty = br#"{"device_id":"a","zone_id":"b","readings":[]}"#;
        assert!(matches!(
            SensorBatch::decode(empty),
            Err(PayloadError::Invalid { field: "readings", .. })
        ));

        // Quality out of range
        let quality = br#"{"device_id":"a","zone_id":"b","readings":[{"type":"ph","value":6,"unit":"pH","quality":150}]}"#;
        assert!(matches!(
            SensorBatch::decode(quality),
            Err(PayloadError::Invalid { field: "quality", .. })
        ));

        // Empty device key
        let device = br#"{"d":"","z":"b","r":[["T",20]]}"#;
        assert!(matches!(
            SensorBatch::decode(device),
            Err(PayloadError::Invalid { field: "device_id", .. })
        ));

        // Garbage timestamp
        let ts = br#"{"device_id":"a","zone_id":"b","timestamp":"yesterday","readings":[{"type":"ph","value":6,"unit":"pH"}]}"#;
        assert!(matches!(
            SensorBatch::decode(ts),
            Err(PayloadError::Timestamp(_))
        ));
    }

    #[test]
    fn test_reading_defaults_to_receipt_time() {
        // ---
        let raw = br#"{"d":"esp01","z":"main","r":[["T",24.5]]}"#;
        let batch = SensorBatch::decode(raw).unwrap();
        let received = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();

        let readings = Reading::from_batch(&batch, Uuid::new_v4(), Uuid::new_v4(), received);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].time, received);
    }
}
