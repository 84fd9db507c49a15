use adsync_core::{DateWindow, FactMetrics, RawFactRow, SourceSystem};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::values::{cell_text, float_cell, int_cell, non_blank};
use crate::{
    campaign_id, collapse_campaign_days, fact_row, parse_json, parse_report_date, AdapterError,
    FetchedReport, NetworkAdapter,
};

const SOURCE: SourceSystem = SourceSystem::GoogleAds;

#[derive(Debug, Deserialize)]
struct GoogleReport {
    #[serde(default)]
    results: Vec<GoogleRow>,
}

#[derive(Debug, Deserialize)]
struct GoogleRow {
    campaign: GoogleCampaign,
    segments: GoogleSegments,
    #[serde(default)]
    metrics: GoogleMetrics,
}

#[derive(Debug, Deserialize)]
struct GoogleCampaign {
    id: JsonValue,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleSegments {
    date: String,
    #[serde(default)]
    ad_network_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleMetrics {
    impressions: Option<JsonValue>,
    clicks: Option<JsonValue>,
    cost_micros: Option<JsonValue>,
    conversions: Option<JsonValue>,
}

/// Display label for a Google Ads `adNetworkType` enum value.
pub(crate) fn network_label(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let label = match raw.to_ascii_uppercase().as_str() {
        "" | "UNSPECIFIED" | "UNKNOWN" => return None,
        "SEARCH" => "Search",
        "SEARCH_PARTNERS" => "Search Partners",
        "CONTENT" | "DISPLAY" => "Display",
        "YOUTUBE" | "YOUTUBE_SEARCH" | "YOUTUBE_WATCH" => "YouTube",
        "MIXED" => "Cross-network",
        _ => return Some(title_case(raw)),
    };
    Some(label.to_string())
}

fn title_case(raw: &str) -> String {
    raw.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let lower = word.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Google Ads `searchStream`-style campaign report, segmented by day and
/// ad network type.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleAdsAdapter;

impl GoogleAdsAdapter {
    fn convert(row: GoogleRow) -> Result<RawFactRow, AdapterError> {
        let raw_id = cell_text(&row.campaign.id)
            .ok_or_else(|| AdapterError::parse(SOURCE, "campaign.id missing"))?;
        let metrics = FactMetrics {
            impressions: int_cell(row.metrics.impressions.as_ref(), "impressions")
                .map_err(|e| AdapterError::parse(SOURCE, e))?,
            clicks: int_cell(row.metrics.clicks.as_ref(), "clicks")
                .map_err(|e| AdapterError::parse(SOURCE, e))?,
            cost_micros: int_cell(row.metrics.cost_micros.as_ref(), "costMicros")
                .map_err(|e| AdapterError::parse(SOURCE, e))?,
            conversions: float_cell(row.metrics.conversions.as_ref(), "conversions")
                .map_err(|e| AdapterError::parse(SOURCE, e))?,
            revenue_micros: 0,
        };
        Ok(fact_row(
            campaign_id(SOURCE, &raw_id)?,
            non_blank(row.campaign.name.as_deref()),
            parse_report_date(SOURCE, &row.segments.date)?,
            row.segments
                .ad_network_type
                .as_deref()
                .and_then(network_label),
            metrics,
        ))
    }
}

#[async_trait]
impl NetworkAdapter for GoogleAdsAdapter {
    fn source_system(&self) -> SourceSystem {
        SOURCE
    }

    fn report_query(&self, window: &DateWindow) -> Vec<(&'static str, String)> {
        vec![(
            "query",
            format!(
                "SELECT campaign.id, campaign.name, segments.date, segments.ad_network_type, \
                 metrics.impressions, metrics.clicks, metrics.cost_micros, metrics.conversions \
                 FROM campaign WHERE segments.date BETWEEN '{}' AND '{}'",
                window.start, window.end
            ),
        )]
    }

    fn parse_report(&self, report: &FetchedReport) -> Result<Vec<RawFactRow>, AdapterError> {
        let parsed: GoogleReport = parse_json(SOURCE, report)?;
        let rows = parsed
            .results
            .into_iter()
            .map(Self::convert)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collapse_campaign_days(rows))
    }
}
