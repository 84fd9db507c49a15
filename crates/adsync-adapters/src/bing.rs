use adsync_core::{FactMetrics, RawFactRow, SourceSystem};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::values::{cell_text, float_cell, int_cell, money_cell, non_blank};
use crate::{
    campaign_id, collapse_campaign_days, fact_row, parse_json, parse_report_date, AdapterError,
    FetchedReport, NetworkAdapter,
};

const SOURCE: SourceSystem = SourceSystem::BingAds;

#[derive(Debug, Deserialize)]
struct BingReport {
    #[serde(default)]
    rows: Vec<BingRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BingRow {
    campaign_id: JsonValue,
    #[serde(default)]
    campaign_name: Option<String>,
    time_period: String,
    #[serde(default)]
    network: Option<String>,
    impressions: Option<JsonValue>,
    clicks: Option<JsonValue>,
    spend: Option<JsonValue>,
    conversions: Option<JsonValue>,
}

/// Microsoft Advertising campaign performance report, daily aggregation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BingAdsAdapter;

fn convert(row: BingRow) -> Result<RawFactRow, AdapterError> {
    let raw_id = cell_text(&row.campaign_id)
        .ok_or_else(|| AdapterError::parse(SOURCE, "CampaignId missing"))?;
    let cell_err = |e: String| AdapterError::parse(SOURCE, e);
    let metrics = FactMetrics {
        impressions: int_cell(row.impressions.as_ref(), "Impressions").map_err(cell_err)?,
        clicks: int_cell(row.clicks.as_ref(), "Clicks").map_err(cell_err)?,
        cost_micros: money_cell(row.spend.as_ref(), "Spend").map_err(cell_err)?,
        conversions: float_cell(row.conversions.as_ref(), "Conversions").map_err(cell_err)?,
        revenue_micros: 0,
    };
    Ok(fact_row(
        campaign_id(SOURCE, &raw_id)?,
        non_blank(row.campaign_name.as_deref()),
        parse_report_date(SOURCE, &row.time_period)?,
        non_blank(row.network.as_deref()),
        metrics,
    ))
}

#[async_trait]
impl NetworkAdapter for BingAdsAdapter {
    fn source_system(&self) -> SourceSystem {
        SOURCE
    }

    fn parse_report(&self, report: &FetchedReport) -> Result<Vec<RawFactRow>, AdapterError> {
        let parsed: BingReport = parse_json(SOURCE, report)?;
        let rows = parsed
            .rows
            .into_iter()
            .map(convert)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collapse_campaign_days(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn spend_is_converted_to_micros() {
        let report = FetchedReport {
            source_system: SOURCE,
            origin: "inline".to_string(),
            fetched_at: Utc::now(),
            body: br#"{"rows":[
                {"CampaignId":"555","CampaignName":"Generic","TimePeriod":"3/2/2026",
                 "Network":"Microsoft sites and select traffic","Impressions":"1,200",
                 "Clicks":"31","Spend":"18.07","Conversions":"2"},
                {"CampaignId":555,"TimePeriod":"2026-03-02","Network":"Audience",
                 "Impressions":10,"Clicks":1,"Spend":0.5,"Conversions":0}
            ]}"#
            .to_vec(),
        };

        let rows = BingAdsAdapter.parse_report(&report).expect("parse");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.campaign_id, "555");
        assert_eq!(row.campaign_name.as_deref(), Some("Generic"));
        assert_eq!(row.network.as_deref(), Some(crate::MIXED_NETWORK));
        assert_eq!(row.metrics.impressions, 1_210);
        assert_eq!(row.metrics.cost_micros, 18_570_000);
        assert_eq!(row.metrics.conversions, 2.0);
    }
}
