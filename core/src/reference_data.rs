//! Static reference tables used by the enrichment layer.
//!
//! Pure, deterministic reads. The tables are loaded once at process start
//! (compiled-in defaults or `data/reference/reference_data.json`) and are
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Risk score assigned to IPs that match neither range table.
pub const UNKNOWN_IP_RISK: f64 = 0.35;
pub const UNKNOWN_IP_REPUTATION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpProfile {
    pub reputation: String,
    pub risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_type: String,
    pub risk: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentProfile {
    pub avg_amount: f64,
    pub txn_per_day: i64,
    pub velocity_limit: i64,
}

/// The full reference dataset. Map keys:
/// - IP tables: leading octet with its dot, e.g. `"45."`
/// - devices: lower-case device family, e.g. `"iphone"`
/// - countries: upper-case country name, e.g. `"UAE"`
/// - segments: `"consumer" | "premium" | "merchant"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    pub high_risk_ip_ranges: BTreeMap<String, IpProfile>,
    pub known_safe_ip_ranges: BTreeMap<String, IpProfile>,
    pub device_profiles: BTreeMap<String, DeviceProfile>,
    pub country_coordinates: BTreeMap<String, GeoPoint>,
    pub user_segments: BTreeMap<String, SegmentProfile>,
}

impl ReferenceData {
    /// High-risk ranges are checked before known-safe ranges.
    pub fn ip_profile(&self, ip_address: &str) -> Option<&IpProfile> {
        let (octet, _) = ip_address.trim().split_once('.')?;
        let prefix = format!("{octet}.");
        self.high_risk_ip_ranges
            .get(&prefix)
            .or_else(|| self.known_safe_ip_ranges.get(&prefix))
    }

    pub fn device_profile(&self, family: &str) -> Option<&DeviceProfile> {
        self.device_profiles.get(family)
    }

    pub fn coordinates(&self, country: &str) -> Option<GeoPoint> {
        self.country_coordinates.get(country).copied()
    }

    pub fn segment_profile(&self, segment: &str) -> Option<&SegmentProfile> {
        self.user_segments.get(segment)
    }

    /// The compiled-in tables. Kept identical to the shipped JSON file.
    pub fn builtin() -> Self {
        fn ip(reputation: &str, risk_score: f64) -> IpProfile {
            IpProfile { reputation: reputation.into(), risk_score }
        }
        fn device(device_type: &str, risk: &str) -> DeviceProfile {
            DeviceProfile { device_type: device_type.into(), risk: risk.into() }
        }
        fn geo(lat: f64, lon: f64) -> GeoPoint {
            GeoPoint { lat, lon }
        }
        fn segment(avg_amount: f64, txn_per_day: i64, velocity_limit: i64) -> SegmentProfile {
            SegmentProfile { avg_amount, txn_per_day, velocity_limit }
        }

        let high_risk_ip_ranges = [
            ("45.", ip("botnet", 0.92)),
            ("91.", ip("anonymous_proxy", 0.84)),
            ("179.", ip("high_chargeback", 0.78)),
            ("203.", ip("suspicious_vpn", 0.71)),
        ];
        let known_safe_ip_ranges = [
            ("66.", ip("trusted_partner", 0.05)),
            ("104.", ip("corporate_network", 0.12)),
        ];
        let device_profiles = [
            ("iphone", device("Mobile", "low")),
            ("android", device("Mobile", "medium")),
            ("desktop", device("Desktop", "low")),
            ("tablet", device("Tablet", "medium")),
            ("laptop", device("Laptop", "low")),
            ("jailbreak", device("Mobile", "high")),
        ];
        let country_coordinates = [
            ("USA", geo(37.0902, -95.7129)),
            ("UK", geo(55.3781, -3.4360)),
            ("FRANCE", geo(46.2276, 2.2137)),
            ("GERMANY", geo(51.1657, 10.4515)),
            ("SPAIN", geo(40.4637, -3.7492)),
            ("JAPAN", geo(36.2048, 138.2529)),
            ("SINGAPORE", geo(1.3521, 103.8198)),
            ("AUSTRALIA", geo(-25.2744, 133.7751)),
            ("CANADA", geo(56.1304, -106.3468)),
            ("BRAZIL", geo(-14.2350, -51.9253)),
            ("INDIA", geo(20.5937, 78.9629)),
            ("UAE", geo(23.4241, 53.8478)),
        ];
        let user_segments = [
            ("consumer", segment(150.0, 3, 8)),
            ("premium", segment(600.0, 6, 12)),
            ("merchant", segment(2200.0, 15, 25)),
        ];

        Self {
            high_risk_ip_ranges: owned(high_risk_ip_ranges),
            known_safe_ip_ranges: owned(known_safe_ip_ranges),
            device_profiles: owned(device_profiles),
            country_coordinates: owned(country_coordinates),
            user_segments: owned(user_segments),
        }
    }
}

fn owned<V, const N: usize>(entries: [(&str, V); N]) -> BTreeMap<String, V> {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Classify a user by id markers: VIP → premium, merchant/store → merchant.
pub fn infer_segment(user_id: &str) -> &'static str {
    if user_id.starts_with("vip") || user_id.ends_with("999") {
        return "premium";
    }
    if user_id.starts_with("merchant") || user_id.contains("store") {
        return "merchant";
    }
    "consumer"
}
