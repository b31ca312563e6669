//! Enrichment: derives the contextual signal bundle for one transaction.
//!
//! This component:
//!   1. Classifies the source IP against the high-risk and known-safe ranges
//!   2. Profiles the device from the leading token of its id
//!   3. Infers geo country/city/coordinates from a "city, COUNTRY" string
//!   4. Builds a per-user behavioral baseline from the user's segment
//!   5. Assembles signals, derived features and explanations
//!
//! Pure function of (transaction, reference tables). Lookup misses degrade
//! to fixed defaults and never fail.
//!
//! DETERMINISM: the behavioral baseline is seeded by user id and is
//! reproducible. `location_change_speed` is drawn from the thread RNG when
//! the caller does not supply it, and is NOT reproducible.

use crate::{
    event::TransactionPayload,
    reference_data::{
        infer_segment, GeoPoint, ReferenceData, SegmentProfile, UNKNOWN_IP_REPUTATION,
        UNKNOWN_IP_RISK,
    },
    rng::KeyedRng,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

const UNKNOWN_DEVICE_TYPE: &str = "Unknown";
const UNKNOWN_DEVICE_RISK: &str = "medium";
const DEVICE_ID_SEPARATOR: char = '_';
/// IPs above this risk count as an IP change.
const IP_CHANGE_RISK: f64 = 0.7;
const LOCATION_SPEED_RANGE: std::ops::Range<f64> = 0.1..1.5;

/// Used only if a loaded reference file lacks the inferred segment.
const FALLBACK_SEGMENT: SegmentProfile = SegmentProfile {
    avg_amount: 150.0,
    txn_per_day: 3,
    velocity_limit: 8,
};

// ── Bundle types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpSignal {
    pub reputation: String,
    pub risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSignal {
    pub device_type: String,
    pub device_risk_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralBaseline {
    pub segment: String,
    pub avg_transaction_amount: f64,
    pub transaction_frequency: i64,
    pub days_since_last_transaction: i64,
    pub velocity_flag: bool,
}

/// Raw lookups grouped by category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    pub ip: IpSignal,
    pub device: DeviceSignal,
    pub behavioral: BehavioralBaseline,
}

/// Numeric features consumed by rules and by the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedFeatures {
    pub avg_transaction_amount: f64,
    pub transaction_frequency: i64,
    pub days_since_last_transaction: i64,
    pub velocity_flag: bool,
    pub device_change: bool,
    pub ip_change: bool,
    pub location_change_speed: f64,
}

/// One human-readable sentence per signal category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanations {
    pub ip: String,
    pub device: String,
    pub behavior: String,
    pub geo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentContext {
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub geo_coordinates: Option<GeoPoint>,
    pub device_type: String,
    pub device_risk_level: String,
    pub ip_reputation: String,
    pub ip_risk_score: f64,
    pub user_segment: String,
    pub signals: Signals,
    pub derived_features: DerivedFeatures,
    pub explanations: Explanations,
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnrichmentEngine {
    reference: ReferenceData,
}

impl EnrichmentEngine {
    pub fn new(reference: ReferenceData) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    pub fn enrich(&self, txn: &TransactionPayload) -> EnrichmentContext {
        let ip = self.lookup_ip(&txn.ip_address);
        let device = self.profile_device(&txn.device_id);
        let (geo_country, geo_city, geo_coordinates) = self.infer_geo(&txn.location);
        let behavioral = self.build_baseline(txn);

        let derived_features = DerivedFeatures {
            avg_transaction_amount: behavioral.avg_transaction_amount,
            transaction_frequency: behavioral.transaction_frequency,
            days_since_last_transaction: behavioral.days_since_last_transaction,
            velocity_flag: behavioral.velocity_flag,
            device_change: txn
                .device_change
                .unwrap_or(device.device_risk_level == "high"),
            ip_change: txn.ip_change.unwrap_or(ip.risk_score > IP_CHANGE_RISK),
            location_change_speed: txn
                .location_change_speed
                .unwrap_or_else(|| rand::thread_rng().gen_range(LOCATION_SPEED_RANGE)),
        };

        let explanations = Explanations {
            ip: format!("IP reputation classified as {}", ip.reputation),
            device: format!(
                "Device type {} risk {}",
                device.device_type, device.device_risk_level
            ),
            behavior: format!(
                "User segment {} baseline velocity {}/day",
                behavioral.segment, behavioral.transaction_frequency
            ),
            geo: match (&geo_city, &geo_country) {
                (Some(city), Some(country)) => format!("Transaction located in {city}, {country}"),
                _ => "No location supplied".to_string(),
            },
        };

        log::debug!(
            "enriched txn={} ip={} device={} segment={} velocity={}",
            txn.transaction_id,
            ip.reputation,
            device.device_type,
            behavioral.segment,
            behavioral.velocity_flag
        );

        EnrichmentContext {
            geo_country,
            geo_city,
            geo_coordinates,
            device_type: device.device_type.clone(),
            device_risk_level: device.device_risk_level.clone(),
            ip_reputation: ip.reputation.clone(),
            ip_risk_score: ip.risk_score,
            user_segment: behavioral.segment.clone(),
            signals: Signals { ip, device, behavioral },
            derived_features,
            explanations,
        }
    }

    fn lookup_ip(&self, ip_address: &str) -> IpSignal {
        match self.reference.ip_profile(ip_address) {
            Some(p) => IpSignal {
                reputation: p.reputation.clone(),
                risk_score: p.risk_score,
            },
            None => IpSignal {
                reputation: UNKNOWN_IP_REPUTATION.to_string(),
                risk_score: UNKNOWN_IP_RISK,
            },
        }
    }

    fn profile_device(&self, device_id: &str) -> DeviceSignal {
        let lowered = device_id.trim().to_lowercase();
        let family = lowered.split(DEVICE_ID_SEPARATOR).next().unwrap_or_default();
        match self.reference.device_profile(family) {
            Some(p) => DeviceSignal {
                device_type: p.device_type.clone(),
                device_risk_level: p.risk.clone(),
            },
            None => DeviceSignal {
                device_type: UNKNOWN_DEVICE_TYPE.to_string(),
                device_risk_level: UNKNOWN_DEVICE_RISK.to_string(),
            },
        }
    }

    /// "Tashkent, Uzbekistan" → (UZBEKISTAN, Tashkent, coords or (0,0)).
    /// A string with no comma is treated as both city and country.
    fn infer_geo(&self, location: &str) -> (Option<String>, Option<String>, Option<GeoPoint>) {
        if location.trim().is_empty() {
            return (None, None, None);
        }
        let parts: Vec<&str> = location.split(',').collect();
        let city = parts.first().map(|c| c.trim()).unwrap_or_default().to_string();
        let country = parts.last().map(|c| c.trim()).unwrap_or_default().to_uppercase();
        let coords = self
            .reference
            .coordinates(&country)
            .unwrap_or(GeoPoint { lat: 0.0, lon: 0.0 });
        (Some(country), Some(city), Some(coords))
    }

    fn build_baseline(&self, txn: &TransactionPayload) -> BehavioralBaseline {
        let segment = infer_segment(&txn.user_id);
        let profile = match self.reference.segment_profile(segment) {
            Some(p) => p.clone(),
            None => {
                log::warn!("segment '{segment}' missing from reference data; using fallback profile");
                FALLBACK_SEGMENT
            }
        };

        // Always draw all three values so the stream position never depends
        // on which fields the caller supplied.
        let mut rng = KeyedRng::for_key(&txn.user_id);
        let avg_draw = profile.avg_amount * rng.uniform(0.9, 1.1);
        let freq_draw = profile.txn_per_day + rng.range_inclusive(-1, 2);
        let days_draw = rng.range_inclusive(0, 5);

        let raw_frequency = txn.transaction_frequency.unwrap_or(freq_draw);
        BehavioralBaseline {
            segment: segment.to_string(),
            avg_transaction_amount: txn
                .avg_transaction_amount
                .unwrap_or_else(|| round2(avg_draw)),
            transaction_frequency: raw_frequency.max(1),
            days_since_last_transaction: txn.days_since_last_transaction.unwrap_or(days_draw),
            velocity_flag: txn
                .velocity_flag
                .unwrap_or(raw_frequency > profile.velocity_limit),
        }
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EnrichmentEngine {
        EnrichmentEngine::new(ReferenceData::builtin())
    }

    fn txn(user: &str, ip: &str, device: &str, location: &str) -> TransactionPayload {
        let mut t = TransactionPayload::new("tx-1", user, 250.0);
        t.ip_address = ip.into();
        t.device_id = device.into();
        t.location = location.into();
        t
    }

    #[test]
    fn risky_ip_sets_ip_change() {
        let ctx = engine().enrich(&txn("alice", "45.10.0.1", "iphone_1", "Paris, France"));
        assert_eq!(ctx.ip_reputation, "botnet");
        assert_eq!(ctx.ip_risk_score, 0.92);
        assert!(ctx.derived_features.ip_change);
    }

    #[test]
    fn unknown_ip_gets_neutral_defaults() {
        let ctx = engine().enrich(&txn("alice", "8.8.8.8", "iphone_1", ""));
        assert_eq!(ctx.ip_reputation, "unknown");
        assert_eq!(ctx.ip_risk_score, 0.35);
        assert!(!ctx.derived_features.ip_change);
    }

    #[test]
    fn device_family_from_leading_token() {
        let ctx = engine().enrich(&txn("alice", "8.8.8.8", "JailBreak_x9", ""));
        assert_eq!(ctx.device_type, "Mobile");
        assert_eq!(ctx.device_risk_level, "high");
        assert!(ctx.derived_features.device_change);

        let ctx = engine().enrich(&txn("alice", "8.8.8.8", "toaster_1", ""));
        assert_eq!(ctx.device_type, "Unknown");
        assert_eq!(ctx.device_risk_level, "medium");
    }

    #[test]
    fn geo_is_parsed_and_uppercased() {
        let ctx = engine().enrich(&txn("alice", "", "", "Dubai, uae"));
        assert_eq!(ctx.geo_country.as_deref(), Some("UAE"));
        assert_eq!(ctx.geo_city.as_deref(), Some("Dubai"));
        let point = ctx.geo_coordinates.unwrap();
        assert!((point.lat - 23.4241).abs() < 1e-9);

        let ctx = engine().enrich(&txn("alice", "", "", "Tashkent, Uzbekistan"));
        assert_eq!(ctx.geo_coordinates, Some(GeoPoint { lat: 0.0, lon: 0.0 }));

        let ctx = engine().enrich(&txn("alice", "", "", "   "));
        assert!(ctx.geo_country.is_none() && ctx.geo_coordinates.is_none());
    }

    #[test]
    fn baseline_is_reproducible_per_user() {
        let e = engine();
        let a = e.enrich(&txn("vip-7", "", "", ""));
        let b = e.enrich(&txn("vip-7", "", "", ""));
        assert_eq!(a.signals.behavioral, b.signals.behavioral);
        assert_eq!(a.user_segment, "premium");
        let avg = a.signals.behavioral.avg_transaction_amount;
        assert!((540.0..=660.0).contains(&avg), "premium avg out of band: {avg}");
        assert!(a.derived_features.transaction_frequency >= 1);
        assert!((0..=5).contains(&a.derived_features.days_since_last_transaction));
    }

    #[test]
    fn builtin_segments_never_raise_velocity_on_their_own() {
        let e = engine();
        for user in ["alice", "bob", "vip-1", "merchant-1", "x-store", "u999"] {
            let ctx = e.enrich(&txn(user, "", "", ""));
            assert!(!ctx.derived_features.velocity_flag, "{user} flagged");
        }
    }

    #[test]
    fn supplied_behavioral_fields_take_precedence() {
        let mut t = txn("alice", "", "", "");
        t.transaction_frequency = Some(20);
        t.location_change_speed = Some(0.5);
        let ctx = engine().enrich(&t);
        assert_eq!(ctx.derived_features.transaction_frequency, 20);
        assert!(ctx.derived_features.velocity_flag, "20/day exceeds consumer limit of 8");
        assert_eq!(ctx.derived_features.location_change_speed, 0.5);

        t.velocity_flag = Some(false);
        assert!(!engine().enrich(&t).derived_features.velocity_flag);
    }

    #[test]
    fn generated_location_speed_stays_in_range() {
        let ctx = engine().enrich(&txn("alice", "", "", ""));
        let speed = ctx.derived_features.location_change_speed;
        assert!((0.1..1.5).contains(&speed));
    }
}
