use adsync_core::{SourceSystem, UnmappedCampaign};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

/// Diagnostic kind for a fact campaign that has no active mapping row.
pub const UNMAPPED_CAMPAIGN: &str = "unmapped_campaign";

/// Versioned payload for one logical resource. `data` is always an array,
/// even for single-entity lookups, so consumers can iterate unconditionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub schema_version: u32,
    pub resource: String,
    pub data: Vec<T>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> ApiEnvelope<T> {
    pub fn new(resource: &str, data: Vec<T>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            resource: resource.to_string(),
            data,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub source_system: Option<SourceSystem>,
    #[serde(default)]
    pub external_campaign_id: Option<String>,
}

impl Diagnostic {
    pub fn unmapped(campaign: &UnmappedCampaign) -> Self {
        Self {
            kind: UNMAPPED_CAMPAIGN.to_string(),
            message: format!(
                "{} campaign {} has facts but no active mapping",
                campaign.source_system, campaign.external_campaign_id
            ),
            source_system: Some(campaign.source_system),
            external_campaign_id: Some(campaign.external_campaign_id.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShapeMismatch {
    #[error("payload is not a valid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("envelope is missing `{0}`")]
    MissingField(&'static str),
    #[error("unsupported schema_version {found}")]
    Version { found: u64 },
    #[error("expected resource {expected:?}, got {found:?}")]
    Resource { expected: String, found: String },
    #[error("envelope field `{0}` is not an array")]
    NotArray(&'static str),
}

/// Strict consumer-side decoder: refuses anything but the agreed
/// array-shaped envelope for `resource` instead of guessing at shapes.
pub fn decode_envelope<T: DeserializeOwned>(
    bytes: &[u8],
    resource: &str,
) -> Result<ApiEnvelope<T>, ShapeMismatch> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let JsonValue::Object(map) = &value else {
        return Err(ShapeMismatch::NotAnObject);
    };

    let version = map
        .get("schema_version")
        .and_then(JsonValue::as_u64)
        .ok_or(ShapeMismatch::MissingField("schema_version"))?;
    if version != u64::from(SCHEMA_VERSION) {
        return Err(ShapeMismatch::Version { found: version });
    }

    let found = map
        .get("resource")
        .and_then(JsonValue::as_str)
        .ok_or(ShapeMismatch::MissingField("resource"))?;
    if found != resource {
        return Err(ShapeMismatch::Resource {
            expected: resource.to_string(),
            found: found.to_string(),
        });
    }

    for field in ["data", "diagnostics"] {
        match map.get(field) {
            Some(JsonValue::Array(_)) => {}
            Some(_) => return Err(ShapeMismatch::NotArray(field)),
            None => return Err(ShapeMismatch::MissingField(field)),
        }
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Row {
        id: i64,
    }

    fn bytes(value: JsonValue) -> Vec<u8> {
        serde_json::to_vec(&value).expect("serialize")
    }

    #[test]
    fn accepts_array_envelope() {
        let payload = bytes(json!({
            "schema_version": 1,
            "resource": "mappings",
            "data": [{"id": 1}, {"id": 2}],
            "diagnostics": []
        }));
        let envelope: ApiEnvelope<Row> = decode_envelope(&payload, "mappings").expect("decode");
        assert_eq!(envelope.data, vec![Row { id: 1 }, Row { id: 2 }]);
    }

    #[test]
    fn object_keyed_data_is_rejected() {
        let payload = bytes(json!({
            "schema_version": 1,
            "resource": "mappings",
            "data": {"1": {"id": 1}},
            "diagnostics": []
        }));
        let err = decode_envelope::<Row>(&payload, "mappings").expect_err("object data");
        assert!(matches!(err, ShapeMismatch::NotArray("data")));
    }

    #[test]
    fn version_and_resource_are_checked() {
        let future = bytes(json!({
            "schema_version": 2, "resource": "mappings", "data": [], "diagnostics": []
        }));
        assert!(matches!(
            decode_envelope::<Row>(&future, "mappings"),
            Err(ShapeMismatch::Version { found: 2 })
        ));

        let other = bytes(json!({
            "schema_version": 1, "resource": "status", "data": [], "diagnostics": []
        }));
        assert!(matches!(
            decode_envelope::<Row>(&other, "mappings"),
            Err(ShapeMismatch::Resource { .. })
        ));

        let bare = bytes(json!([{"id": 1}]));
        assert!(matches!(
            decode_envelope::<Row>(&bare, "mappings"),
            Err(ShapeMismatch::NotAnObject)
        ));
    }

    #[test]
    fn unmapped_diagnostic_names_the_pair() {
        let diagnostic = Diagnostic::unmapped(&UnmappedCampaign {
            source_system: SourceSystem::BingAds,
            external_campaign_id: "7003".to_string(),
        });
        assert_eq!(diagnostic.kind, UNMAPPED_CAMPAIGN);
        assert_eq!(diagnostic.external_campaign_id.as_deref(), Some("7003"));
        assert!(diagnostic.message.contains("Bing Ads"));
    }
}
