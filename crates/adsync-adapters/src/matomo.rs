use std::collections::BTreeMap;

use adsync_core::{DateWindow, FactMetrics, RawFactRow, SourceSystem};
use adsync_storage::ReportFetcher;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::values::{float_cell, int_cell, money_cell, non_blank};
use crate::{
    campaign_id, collapse_campaign_days, fact_row, fetch_endpoint, parse_json, parse_report_date,
    AdapterContext, AdapterError, FetchedReport, NetworkAdapter, ReportEndpoint, TokenPlacement,
};

const SOURCE: SourceSystem = SourceSystem::Matomo;

#[derive(Debug, Deserialize)]
struct MatomoCampaignRow {
    label: JsonValue,
    nb_visits: Option<JsonValue>,
    nb_conversions: Option<JsonValue>,
    revenue: Option<JsonValue>,
}

/// Matomo `Referrers.getCampaigns` over a range with `period=day`: an object
/// keyed by date, each holding one row per campaign label.
#[derive(Debug, Clone)]
pub struct MatomoAdapter {
    pub site_id: u32,
}

impl Default for MatomoAdapter {
    fn default() -> Self {
        Self { site_id: 1 }
    }
}

/// Matomo answers bad credentials with HTTP 200 and an error object.
fn api_error(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    if value.get("result").and_then(JsonValue::as_str) != Some("error") {
        return None;
    }
    Some(
        value
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("unspecified Matomo API error")
            .to_string(),
    )
}

/// Matomo's credential failures name `token_auth`, an authentication step,
/// or the missing `view` access right.
fn is_auth_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("token_auth")
        || lower.contains("authenticat")
        || lower.contains("requires 'view' access")
}

fn convert(date: &str, row: MatomoCampaignRow) -> Result<RawFactRow, AdapterError> {
    let label = match &row.label {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        other => return Err(AdapterError::parse(SOURCE, format!("label: {other}"))),
    };
    let cell_err = |e: String| AdapterError::parse(SOURCE, e);
    let metrics = FactMetrics {
        impressions: 0,
        clicks: int_cell(row.nb_visits.as_ref(), "nb_visits").map_err(cell_err)?,
        cost_micros: 0,
        conversions: float_cell(row.nb_conversions.as_ref(), "nb_conversions")
            .map_err(cell_err)?,
        revenue_micros: money_cell(row.revenue.as_ref(), "revenue").map_err(cell_err)?,
    };
    Ok(fact_row(
        campaign_id(SOURCE, &label)?,
        non_blank(Some(label.as_str())),
        parse_report_date(SOURCE, date)?,
        None,
        metrics,
    ))
}

#[async_trait]
impl NetworkAdapter for MatomoAdapter {
    fn source_system(&self) -> SourceSystem {
        SOURCE
    }

    fn token_placement(&self) -> TokenPlacement {
        TokenPlacement::Query("token_auth")
    }

    fn report_query(&self, window: &DateWindow) -> Vec<(&'static str, String)> {
        vec![
            ("module", "API".to_string()),
            ("method", "Referrers.getCampaigns".to_string()),
            ("idSite", self.site_id.to_string()),
            ("period", "day".to_string()),
            ("date", format!("{},{}", window.start, window.end)),
            ("format", "JSON".to_string()),
        ]
    }

    async fn fetch_report(
        &self,
        http: &ReportFetcher,
        ctx: &AdapterContext,
        endpoint: &ReportEndpoint,
    ) -> Result<FetchedReport, AdapterError> {
        let report = fetch_endpoint(
            SOURCE,
            self.token_placement(),
            self.report_query(&ctx.window),
            http,
            ctx,
            endpoint,
        )
        .await?;
        match api_error(&report.body) {
            Some(message) if is_auth_message(&message) => Err(AdapterError::Auth {
                network: SOURCE,
                detail: message,
            }),
            Some(message) => Err(AdapterError::parse(SOURCE, message)),
            None => Ok(report),
        }
    }

    fn parse_report(&self, report: &FetchedReport) -> Result<Vec<RawFactRow>, AdapterError> {
        let by_day: BTreeMap<String, Vec<MatomoCampaignRow>> = parse_json(SOURCE, report)?;
        let mut rows = Vec::new();
        for (date, day_rows) in by_day {
            for row in day_rows {
                rows.push(convert(&date, row)?);
            }
        }
        Ok(collapse_campaign_days(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn report(body: &[u8]) -> FetchedReport {
        FetchedReport {
            source_system: SOURCE,
            origin: "inline".to_string(),
            fetched_at: Utc::now(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn day_keyed_rows_become_facts() {
        let rows = MatomoAdapter::default()
            .parse_report(&report(
                br#"{
                    "2026-03-01":[{"label":"newsletter","nb_visits":12,"nb_conversions":1,"revenue":25}],
                    "2026-03-02":[],
                    "2026-03-03":[{"label":"newsletter","nb_visits":"4","revenue":"0"}]
                }"#,
            ))
            .expect("parse");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].campaign_id, "newsletter");
        assert_eq!(rows[0].metrics.clicks, 12);
        assert_eq!(rows[0].metrics.revenue_micros, 25_000_000);
        assert_eq!(rows[1].metrics.conversions, 0.0);
        assert!(rows.iter().all(|r| r.network.is_none()));
    }

    #[test]
    fn error_payloads_are_classified() {
        let auth = br#"{"result":"error","message":"You can't access this resource as it requires 'view' access. token_auth is invalid"}"#;
        let message = api_error(auth).expect("error payload");
        assert!(is_auth_message(&message));

        let other = br#"{"result":"error","message":"Method 'Nope' does not exist"}"#;
        let message = api_error(other).expect("error payload");
        assert!(!is_auth_message(&message));

        assert_eq!(api_error(b"{\"2026-03-01\":[]}"), None);

        let view_only = "You can't access this resource as it requires 'view' access for the website id = 1.";
        assert!(is_auth_message(view_only));
        assert!(!is_auth_message("Mysql error: database access failure"));
    }
}
