use adsync_core::{DateWindow, FactMetrics, RawFactRow, SourceSystem};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::values::{cell_text, float_cell, int_cell, money_cell, non_blank};
use crate::{
    campaign_id, collapse_campaign_days, fact_row, parse_json, parse_report_date, AdapterError,
    FetchedReport, NetworkAdapter, TokenPlacement,
};

const SOURCE: SourceSystem = SourceSystem::RedTrack;

#[derive(Debug, Deserialize)]
struct RedTrackReport {
    #[serde(default)]
    items: Vec<RedTrackItem>,
}

#[derive(Debug, Deserialize)]
struct RedTrackItem {
    campaign_id: JsonValue,
    #[serde(default)]
    campaign: Option<String>,
    date: String,
    clicks: Option<JsonValue>,
    conversions: Option<JsonValue>,
    cost: Option<JsonValue>,
    revenue: Option<JsonValue>,
}

/// RedTrack report grouped by campaign and date. Tracker data has no
/// impressions and no ad-network dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedTrackAdapter;

fn convert(item: RedTrackItem) -> Result<RawFactRow, AdapterError> {
    let raw_id = cell_text(&item.campaign_id)
        .ok_or_else(|| AdapterError::parse(SOURCE, "campaign_id missing"))?;
    let cell_err = |e: String| AdapterError::parse(SOURCE, e);
    let metrics = FactMetrics {
        impressions: 0,
        clicks: int_cell(item.clicks.as_ref(), "clicks").map_err(cell_err)?,
        cost_micros: money_cell(item.cost.as_ref(), "cost").map_err(cell_err)?,
        conversions: float_cell(item.conversions.as_ref(), "conversions").map_err(cell_err)?,
        revenue_micros: money_cell(item.revenue.as_ref(), "revenue").map_err(cell_err)?,
    };
    Ok(fact_row(
        campaign_id(SOURCE, &raw_id)?,
        non_blank(item.campaign.as_deref()),
        parse_report_date(SOURCE, &item.date)?,
        None,
        metrics,
    ))
}

#[async_trait]
impl NetworkAdapter for RedTrackAdapter {
    fn source_system(&self) -> SourceSystem {
        SOURCE
    }

    fn token_placement(&self) -> TokenPlacement {
        TokenPlacement::Query("api_key")
    }

    fn report_query(&self, window: &DateWindow) -> Vec<(&'static str, String)> {
        vec![
            ("group", "campaign,date".to_string()),
            ("date_from", window.start.to_string()),
            ("date_to", window.end.to_string()),
        ]
    }

    fn parse_report(&self, report: &FetchedReport) -> Result<Vec<RawFactRow>, AdapterError> {
        let parsed: RedTrackReport = parse_json(SOURCE, report)?;
        let rows = parsed
            .items
            .into_iter()
            .map(convert)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collapse_campaign_days(rows))
    }
}
