//! Rendering of the operator's durable ConfigMap outputs: the public info
//! document, the banner list and the signing/transparency cluster config.
//!
//! All three are regenerated idempotently on every reconcile of the
//! `KonfluxInfo` resource. Key names and enum values are a stable external
//! API consumed by pipeline runs and the UI.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

pub const INFO_CONFIG_MAP_NAME: &str = "konflux-public-info";
pub const INFO_CONFIG_KEY: &str = "info.json";

pub const BANNER_CONFIG_MAP_NAME: &str = "konflux-banner-configmap";
pub const BANNER_CONFIG_KEY: &str = "banner-content.yaml";

pub const CLUSTER_CONFIG_MAP_NAME: &str = "cluster-config";

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
    Staging,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// External systems the cluster is wired up to, surfaced in `info.json`.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_app_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registry_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom_server_url: Option<String>,
}

/// An RBAC role advertised to users in `info.json`.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RbacRole {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A time-windowed banner shown in the UI.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BannerItem {
    pub summary: String,
    #[serde(default, rename = "type")]
    pub banner_type: BannerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BannerType {
    #[default]
    Info,
    Warning,
    Danger,
}

/// Flat signing/transparency endpoint configuration written to the
/// `cluster-config` ConfigMap.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rekor_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cosign_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency_log_url: Option<String>,
}

impl ClusterConfigData {
    /// Endpoint defaults discovered for the given environment; the base layer
    /// of the override-wins merge.
    pub fn defaults_for(environment: Environment) -> Self {
        match environment {
            Environment::Development => ClusterConfigData {
                rekor_url: Some("http://rekor-server.rekor.svc".to_string()),
                tuf_url: Some("http://tuf.tuf-system.svc".to_string()),
                cosign_public_key: None,
                transparency_log_url: Some("http://rekor-server.rekor.svc".to_string()),
            },
            Environment::Production | Environment::Staging => ClusterConfigData {
                rekor_url: Some("https://rekor.sigstore.dev".to_string()),
                tuf_url: Some("https://tuf-repo-cdn.sigstore.dev".to_string()),
                cosign_public_key: None,
                transparency_log_url: Some("https://rekor.sigstore.dev".to_string()),
            },
        }
    }

    /// Merges `self` over `base` into the final flat string map.
    ///
    /// Non-empty keys of the override win, empty or unset keys fall back to
    /// the base, and keys absent in both are omitted from the output map
    /// entirely rather than present as empty strings.
    pub fn merge_over(&self, base: &ClusterConfigData) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for (key, over, fallback) in [
            ("rekor-url", &self.rekor_url, &base.rekor_url),
            ("tuf-url", &self.tuf_url, &base.tuf_url),
            (
                "cosign-public-key",
                &self.cosign_public_key,
                &base.cosign_public_key,
            ),
            (
                "transparency-log-url",
                &self.transparency_log_url,
                &base.transparency_log_url,
            ),
        ] {
            let value = match over {
                Some(v) if !v.is_empty() => Some(v.clone()),
                _ => fallback.clone().filter(|v| !v.is_empty()),
            };
            if let Some(value) = value {
                merged.insert(key.to_string(), value);
            }
        }
        merged
    }
}

#[derive(Serialize)]
struct PublicInfo<'a> {
    environment: Environment,
    visibility: Visibility,
    integrations: &'a Integrations,
    rbac: &'a [RbacRole],
}

/// Renders the `info.json` payload.
pub fn render_info_json(
    environment: Environment,
    visibility: Visibility,
    integrations: &Integrations,
    rbac: &[RbacRole],
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&PublicInfo {
        environment,
        visibility,
        integrations,
        rbac,
    })
}

/// Renders the `banner-content.yaml` payload.
pub fn render_banner_yaml(banners: &[BannerItem]) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(banners)
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    #[test]
    fn override_wins_over_base() {
        let base = ClusterConfigData::defaults_for(Environment::Production);
        let over = ClusterConfigData {
            rekor_url: Some("https://rekor.example.com".to_string()),
            ..ClusterConfigData::default()
        };

        let merged = over.merge_over(&base);
        assert_eq!(
            merged.get("rekor-url"),
            Some(&"https://rekor.example.com".to_string())
        );
        assert_eq!(
            merged.get("tuf-url"),
            Some(&"https://tuf-repo-cdn.sigstore.dev".to_string())
        );
    }

    #[test]
    fn empty_override_falls_back_to_base() {
        let base = ClusterConfigData {
            rekor_url: Some("https://rekor.example.com".to_string()),
            ..ClusterConfigData::default()
        };
        let over = ClusterConfigData {
            rekor_url: Some(String::new()),
            ..ClusterConfigData::default()
        };

        let merged = over.merge_over(&base);
        assert_eq!(
            merged.get("rekor-url"),
            Some(&"https://rekor.example.com".to_string())
        );
    }

    #[test]
    fn keys_absent_in_both_are_omitted() {
        let merged = ClusterConfigData::default().merge_over(&ClusterConfigData::default());
        assert!(merged.is_empty());

        let over = ClusterConfigData {
            cosign_public_key: Some("abc".to_string()),
            ..ClusterConfigData::default()
        };
        let merged = over.merge_over(&ClusterConfigData::default());
        assert_eq!(merged.len(), 1);
        assert!(!merged.contains_key("rekor-url"));
    }

    #[test]
    fn info_json_contains_stable_field_names() {
        let integrations = Integrations {
            github_app_url: Some("https://github.com/apps/konflux".to_string()),
            ..Integrations::default()
        };
        let rbac = vec![RbacRole {
            name: "konflux-admin".to_string(),
            description: Some("Full access".to_string()),
        }];

        let rendered = render_info_json(
            Environment::Staging,
            Visibility::Private,
            &integrations,
            &rbac,
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(parsed["environment"], "staging");
        assert_eq!(parsed["visibility"], "private");
        assert_eq!(
            parsed["integrations"]["githubAppUrl"],
            "https://github.com/apps/konflux"
        );
        assert_eq!(parsed["rbac"][0]["name"], "konflux-admin");
    }

    #[test]
    fn banner_yaml_round_trips_time_windows() {
        let banners = vec![BannerItem {
            summary: "Maintenance window".to_string(),
            banner_type: BannerType::Warning,
            start_time: Some("20:00".to_string()),
            end_time: Some("22:00".to_string()),
            year: Some(2026),
            month: Some(3),
            day_of_week: None,
        }];

        let rendered = render_banner_yaml(&banners).unwrap();
        assert!(rendered.contains("summary: Maintenance window"));
        assert!(rendered.contains("type: warning"));
        assert!(!rendered.contains("dayOfWeek"));

        let parsed: Vec<BannerItem> = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed, banners);
    }

    #[test]
    fn banner_spec_yaml_parses_with_camel_case_keys() {
        let input = indoc! {"
            - summary: Scheduled upgrade
              type: danger
              startTime: '08:00'
              endTime: '09:30'
              dayOfWeek: 1
        "};
        let parsed: Vec<BannerItem> = serde_yaml::from_str(input).unwrap();
        assert_eq!(parsed[0].banner_type, BannerType::Danger);
        assert_eq!(parsed[0].day_of_week, Some(1));
    }
}
