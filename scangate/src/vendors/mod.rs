use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::adapter::{Project, ProjectId, VendorAdapter};
use crate::config::{EngineConfig, Vendor};
use crate::error::Result;
use crate::http;
use crate::token::TokenCache;

pub mod sast;
pub mod sca;

use sast::SastAdapter;
use sca::ScaAdapter;

/// Build the adapter for the configured vendor, with its own client and token cache.
pub fn create_adapter(config: &EngineConfig) -> Result<Arc<dyn VendorAdapter>> {
    let client = http::build_client(
        config.proxy.as_deref(),
        config.request_timeout(),
        config.insecure_tls,
    )?;
    let tokens = TokenCache::new(client.clone(), config.identity());

    let adapter: Arc<dyn VendorAdapter> = match config.vendor {
        Vendor::Sast => Arc::new(SastAdapter::new(
            client,
            tokens,
            config.api_base(),
            config.web_base(),
            &config.default_team_id,
        )),
        Vendor::Sca => Arc::new(ScaAdapter::new(
            client,
            tokens,
            config.api_base(),
            config.web_base(),
        )),
    };
    Ok(adapter)
}

/// Identifiers arrive as numbers from one vendor and strings from the other.
pub(crate) fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a vendor timestamp. Values without an offset are taken as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A string field, treating `""` as absent.
pub(crate) fn json_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Projects from a listing; entries without an id or name are skipped.
pub(crate) fn project_list(listing: &Value) -> Vec<Project> {
    listing
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            Some(Project {
                id: ProjectId::new(entry.get("id").and_then(json_id)?),
                name: json_str(entry, "name")?.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    use super::*;

    #[test]
    fn ids_accept_numbers_and_strings() {
        assert_eq!(json_id(&json!(42)), Some("42".to_string()));
        assert_eq!(json_id(&json!("9f1c")), Some("9f1c".to_string()));
        assert_eq!(json_id(&json!("")), None);
        assert_eq!(json_id(&json!(null)), None);
    }

    #[test]
    fn timestamps_with_and_without_fraction() {
        let ts = parse_timestamp("2024-03-05T10:20:30.123").unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 3, 5));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (10, 20, 30));

        assert!(parse_timestamp("2024-03-05T10:20:30").is_some());
        assert!(parse_timestamp("2024-03-05T10:20:30.5+02:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn project_list_skips_incomplete_entries() {
        let listing = json!([
            {"id": 12, "name": "payments"},
            {"id": "p-2"},
            {"name": "orphan"},
            {"id": "p-3", "name": "billing", "isPublic": true}
        ]);
        let projects = project_list(&listing);
        let ids: Vec<_> = projects.iter().map(|p| p.id.as_str()).collect();
        let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(ids, ["12", "p-3"]);
        assert_eq!(names, ["payments", "billing"]);
        assert!(project_list(&json!({"error": "nope"})).is_empty());
    }

    #[test]
    fn create_adapter_names_vendor() {
        let config = EngineConfig::from_yaml(
            "vendor: sca\ntenant: acme\nauth_url: https://a\napi_url: https://b/\n",
        )
        .unwrap();
        assert_eq!(create_adapter(&config).unwrap().name(), "SCA");

        let yaml = "vendor: sast\nauth_url: https://a\napi_url: https://b\n";
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(create_adapter(&config).unwrap().name(), "SAST");
    }
}
