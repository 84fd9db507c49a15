//! Core domain model for cross-network campaign reconciliation.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "adsync-core";

pub const STATUS_OK: &str = "ok";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_ERROR: &str = "error";

/// Ad network or tracking platform a campaign was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceSystem {
    #[serde(rename = "Google Ads")]
    GoogleAds,
    #[serde(rename = "Bing Ads")]
    BingAds,
    #[serde(rename = "RedTrack")]
    RedTrack,
    #[serde(rename = "Matomo")]
    Matomo,
}

impl SourceSystem {
    pub const ALL: [SourceSystem; 4] = [
        SourceSystem::GoogleAds,
        SourceSystem::BingAds,
        SourceSystem::RedTrack,
        SourceSystem::Matomo,
    ];

    /// Persisted `source_system` value.
    pub fn as_str(self) -> &'static str {
        match self {
            SourceSystem::GoogleAds => "Google Ads",
            SourceSystem::BingAds => "Bing Ads",
            SourceSystem::RedTrack => "RedTrack",
            SourceSystem::Matomo => "Matomo",
        }
    }

    /// Lowercase identifier used for status keys, config entries and paths.
    pub fn slug(self) -> &'static str {
        match self {
            SourceSystem::GoogleAds => "google_ads",
            SourceSystem::BingAds => "bing_ads",
            SourceSystem::RedTrack => "redtrack",
            SourceSystem::Matomo => "matomo",
        }
    }

    pub fn fact_table(self) -> FactTable {
        match self {
            SourceSystem::GoogleAds => FactTable {
                name: "google_ads_fact",
                id_kind: CampaignIdKind::BigInt,
                has_network: true,
            },
            SourceSystem::BingAds => FactTable {
                name: "bing_ads_fact",
                id_kind: CampaignIdKind::BigInt,
                has_network: true,
            },
            SourceSystem::RedTrack => FactTable {
                name: "redtrack_fact",
                id_kind: CampaignIdKind::Text,
                has_network: false,
            },
            SourceSystem::Matomo => FactTable {
                name: "matomo_fact",
                id_kind: CampaignIdKind::Text,
                has_network: false,
            },
        }
    }

    /// Sources without a network dimension keep `network = NULL` forever.
    pub fn has_network_dimension(self) -> bool {
        self.fact_table().has_network
    }

    pub fn auth_status_key(self) -> String {
        format!("{}_auth_status", self.slug())
    }

    pub fn last_ingest_key(self) -> String {
        format!("{}_last_ingest_at", self.slug())
    }

    pub fn last_run_status_key(self) -> String {
        format!("{}_last_run_status", self.slug())
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.slug() == slug)
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source system: {0}")]
pub struct UnknownSourceSystem(pub String);

impl FromStr for SourceSystem {
    type Err = UnknownSourceSystem;

    /// Accepts the persisted name ("Google Ads") or the slug ("google_ads").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|candidate| {
                candidate.as_str().eq_ignore_ascii_case(trimmed)
                    || candidate.slug().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| UnknownSourceSystem(trimmed.to_string()))
    }
}

/// Storage representation of a network-native campaign identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignIdKind {
    BigInt,
    Text,
}

/// Physical layout of one network's raw fact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactTable {
    pub name: &'static str,
    pub id_kind: CampaignIdKind,
    pub has_network: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid campaign id {raw:?}: {reason}")]
pub struct InvalidCampaignId {
    pub raw: String,
    pub reason: &'static str,
}

/// Normalizes a campaign id to the form `campaign_id::text` produces in the
/// fact store, so mapping rows and fact rows compare equal as strings.
pub fn normalize_campaign_id(kind: CampaignIdKind, raw: &str) -> Result<String, InvalidCampaignId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidCampaignId {
            raw: raw.to_string(),
            reason: "empty",
        });
    }
    match kind {
        CampaignIdKind::Text => Ok(trimmed.to_string()),
        CampaignIdKind::BigInt => trimmed
            .parse::<i64>()
            .map(|v| v.to_string())
            .map_err(|_| InvalidCampaignId {
                raw: raw.to_string(),
                reason: "not a 64-bit integer",
            }),
    }
}

/// Metric set shared by every raw fact table. Money is kept in micros.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FactMetrics {
    pub impressions: i64,
    pub clicks: i64,
    pub cost_micros: i64,
    pub conversions: f64,
    pub revenue_micros: i64,
}

impl FactMetrics {
    pub fn accumulate(&mut self, other: &FactMetrics) {
        self.impressions += other.impressions;
        self.clicks += other.clicks;
        self.cost_micros += other.cost_micros;
        self.conversions += other.conversions;
        self.revenue_micros += other.revenue_micros;
    }
}

/// One `(campaign, day)` row as reported by a network, ids already normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFactRow {
    pub campaign_id: String,
    pub campaign_name: Option<String>,
    pub date: NaiveDate,
    pub network: Option<String>,
    pub metrics: FactMetrics,
}

/// Distinct campaign ids in a batch, sorted for deterministic upsert order.
pub fn distinct_campaign_ids(rows: &[RawFactRow]) -> Vec<String> {
    rows.iter()
        .map(|r| r.campaign_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Canonical identity record for a network-native campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignMapping {
    pub id: i64,
    pub source_system: SourceSystem,
    pub external_campaign_id: String,
    pub network: Option<String>,
    pub pretty_name: Option<String>,
    pub pretty_network: Option<String>,
    pub pretty_source: Option<String>,
    pub display_order: i32,
    pub superseded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl CampaignMapping {
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn display_name(&self) -> &str {
        self.pretty_name
            .as_deref()
            .unwrap_or(&self.external_campaign_id)
    }

    pub fn display_network(&self) -> Option<&str> {
        self.pretty_network.as_deref().or(self.network.as_deref())
    }

    pub fn display_source(&self) -> &str {
        self.pretty_source
            .as_deref()
            .unwrap_or_else(|| self.source_system.as_str())
    }
}

/// Partial update of dashboard-owned attributes.
///
/// `None` leaves a field unchanged; a blank string clears a text field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayUpdate {
    #[serde(default)]
    pub pretty_name: Option<String>,
    #[serde(default)]
    pub pretty_network: Option<String>,
    #[serde(default)]
    pub pretty_source: Option<String>,
    #[serde(default)]
    pub display_order: Option<i32>,
}

impl DisplayUpdate {
    pub fn is_empty(&self) -> bool {
        self.pretty_name.is_none()
            && self.pretty_network.is_none()
            && self.pretty_source.is_none()
            && self.display_order.is_none()
    }

    /// `None` = untouched, `Some(None)` = clear, `Some(Some(v))` = set.
    pub fn text_change(value: &Option<String>) -> Option<Option<String>> {
        value.as_ref().map(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn apply_to(&self, mapping: &mut CampaignMapping) {
        if let Some(v) = Self::text_change(&self.pretty_name) {
            mapping.pretty_name = v;
        }
        if let Some(v) = Self::text_change(&self.pretty_network) {
            mapping.pretty_network = v;
        }
        if let Some(v) = Self::text_change(&self.pretty_source) {
            mapping.pretty_source = v;
        }
        if let Some(order) = self.display_order {
            mapping.display_order = order;
        }
    }
}

/// Latest value of a process-wide health signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status_key: String,
    pub status_value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("date window start {start} is after end {end}")]
pub struct InvalidDateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Inclusive report date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidDateWindow> {
        if start > end {
            return Err(InvalidDateWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// The `days` complete days ending yesterday relative to `today`.
    pub fn trailing_days(today: NaiveDate, days: u32) -> Self {
        let end = today - Duration::days(1);
        let start = end - Duration::days(i64::from(days.max(1)) - 1);
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Aggregated performance of one network campaign over a date window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignPerformance {
    pub mapping_id: Option<i64>,
    pub source_system: SourceSystem,
    pub external_campaign_id: String,
    pub display_name: String,
    pub campaign_name: Option<String>,
    pub network: Option<String>,
    pub pretty_network: Option<String>,
    pub pretty_source: Option<String>,
    pub display_order: i32,
    #[serde(flatten)]
    pub metrics: FactMetrics,
}

/// A fact-store campaign with no mapping row: a data-integrity violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnmappedCampaign {
    pub source_system: SourceSystem,
    pub external_campaign_id: String,
}

/// Dashboard ordering: `display_order`, then display name, then identity.
pub fn dashboard_order(a: &CampaignPerformance, b: &CampaignPerformance) -> Ordering {
    a.display_order
        .cmp(&b.display_order)
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.source_system.cmp(&b.source_system))
        .then_with(|| a.external_campaign_id.cmp(&b.external_campaign_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn source_system_parses_names_and_slugs() {
        assert_eq!("Google Ads".parse::<SourceSystem>().unwrap(), SourceSystem::GoogleAds);
        assert_eq!("bing_ads".parse::<SourceSystem>().unwrap(), SourceSystem::BingAds);
        assert_eq!(" redtrack ".parse::<SourceSystem>().unwrap(), SourceSystem::RedTrack);
        assert!("Facebook".parse::<SourceSystem>().is_err());
        assert_eq!(SourceSystem::from_slug("matomo"), Some(SourceSystem::Matomo));
    }

    #[test]
    fn source_system_serializes_as_persisted_name() {
        let json = serde_json::to_string(&SourceSystem::GoogleAds).unwrap();
        assert_eq!(json, "\"Google Ads\"");
    }

    #[test]
    fn status_keys_follow_slug_convention() {
        assert_eq!(SourceSystem::GoogleAds.auth_status_key(), "google_ads_auth_status");
        assert_eq!(SourceSystem::Matomo.last_ingest_key(), "matomo_last_ingest_at");
    }

    #[test]
    fn only_paid_search_networks_carry_network_dimension() {
        assert!(SourceSystem::GoogleAds.has_network_dimension());
        assert!(SourceSystem::BingAds.has_network_dimension());
        assert!(!SourceSystem::RedTrack.has_network_dimension());
        assert!(!SourceSystem::Matomo.has_network_dimension());
    }

    #[test]
    fn bigint_ids_normalize_like_a_text_cast() {
        assert_eq!(normalize_campaign_id(CampaignIdKind::BigInt, " 00123 ").unwrap(), "123");
        assert!(normalize_campaign_id(CampaignIdKind::BigInt, "abc").is_err());
        assert_eq!(
            normalize_campaign_id(CampaignIdKind::Text, " spring_sale ").unwrap(),
            "spring_sale"
        );
        assert!(normalize_campaign_id(CampaignIdKind::Text, "   ").is_err());
    }

    #[test]
    fn distinct_ids_are_sorted_and_unique() {
        let row = |id: &str| RawFactRow {
            campaign_id: id.to_string(),
            campaign_name: None,
            date: date(2026, 10, 1),
            network: None,
            metrics: FactMetrics::default(),
        };
        let ids = distinct_campaign_ids(&[row("9"), row("10"), row("9")]);
        assert_eq!(ids, vec!["10".to_string(), "9".to_string()]);
    }

    #[test]
    fn display_update_sets_clears_and_skips() {
        let mut mapping = CampaignMapping {
            id: 1,
            source_system: SourceSystem::GoogleAds,
            external_campaign_id: "123".into(),
            network: Some("Search".into()),
            pretty_name: Some("Old".into()),
            pretty_network: Some("Paid".into()),
            pretty_source: None,
            display_order: 3,
            superseded_by: None,
            created_at: Utc::now(),
        };
        let update = DisplayUpdate {
            pretty_name: Some("  Brand  ".into()),
            pretty_network: Some("".into()),
            pretty_source: None,
            display_order: None,
        };
        update.apply_to(&mut mapping);
        assert_eq!(mapping.pretty_name.as_deref(), Some("Brand"));
        assert_eq!(mapping.pretty_network, None);
        assert_eq!(mapping.display_order, 3);
        assert_eq!(mapping.display_network(), Some("Search"));
        assert_eq!(mapping.display_source(), "Google Ads");
    }

    #[test]
    fn trailing_window_ends_yesterday() {
        let window = DateWindow::trailing_days(date(2026, 10, 19), 7);
        assert_eq!(window.end, date(2026, 10, 18));
        assert_eq!(window.start, date(2026, 10, 12));
        assert_eq!(window.days(), 7);
        assert!(DateWindow::new(date(2026, 10, 2), date(2026, 10, 1)).is_err());
    }

    #[test]
    fn dashboard_order_ranks_order_then_name_then_identity() {
        let row = |source, id: &str, name: &str, order| CampaignPerformance {
            mapping_id: None,
            source_system: source,
            external_campaign_id: id.to_string(),
            display_name: name.to_string(),
            campaign_name: None,
            network: None,
            pretty_network: None,
            pretty_source: None,
            display_order: order,
            metrics: FactMetrics::default(),
        };
        let mut rows = vec![
            row(SourceSystem::Matomo, "z", "Zeta", 0),
            row(SourceSystem::GoogleAds, "9", "Brand", 2),
            row(SourceSystem::BingAds, "7", "Alpha", 0),
            row(SourceSystem::GoogleAds, "8", "Alpha", 0),
        ];
        rows.sort_by(dashboard_order);
        let ids: Vec<_> = rows.iter().map(|r| r.external_campaign_id.as_str()).collect();
        assert_eq!(ids, vec!["8", "7", "z", "9"]);
    }
}
