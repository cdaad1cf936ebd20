//! Embedded Kubernetes manifests and the customizations applied to them
//! before they are handed to the tracking client.
//!
//! Each component ships one multi-document YAML file compiled into the
//! binary. Documents are parsed into JSON values so that replica counts,
//! container resources and env vars from the CR spec can be patched in
//! without a typed model per kind.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::{OptionExt, ResultExt, Snafu};

pub const BUILD_SERVICE_MANIFESTS: &str = include_str!("../manifests/build-service.yaml");
pub const INTEGRATION_SERVICE_MANIFESTS: &str =
    include_str!("../manifests/integration-service.yaml");
pub const RELEASE_SERVICE_MANIFESTS: &str = include_str!("../manifests/release-service.yaml");
pub const UI_MANIFESTS: &str = include_str!("../manifests/ui.yaml");
pub const IMAGE_CONTROLLER_MANIFESTS: &str = include_str!("../manifests/image-controller.yaml");
pub const RBAC_MANIFESTS: &str = include_str!("../manifests/rbac.yaml");

/// All embedded manifest sets, used by the `dump-manifests` subcommand.
pub const ALL_MANIFEST_SETS: &[(&str, &str)] = &[
    ("build-service", BUILD_SERVICE_MANIFESTS),
    ("integration-service", INTEGRATION_SERVICE_MANIFESTS),
    ("release-service", RELEASE_SERVICE_MANIFESTS),
    ("ui", UI_MANIFESTS),
    ("image-controller", IMAGE_CONTROLLER_MANIFESTS),
    ("rbac", RBAC_MANIFESTS),
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse embedded manifest document"))]
    ParseManifest { source: serde_yaml::Error },

    #[snafu(display("manifest document is missing apiVersion, kind or metadata.name"))]
    IncompleteDocument,

    #[snafu(display("override targets unknown Deployment {name:?}"))]
    UnknownDeployment { name: String },

    #[snafu(display("override targets unknown container {container:?} of Deployment {name:?}"))]
    UnknownContainer { name: String, container: String },
}

/// Per-Deployment customization carried in every component CR spec, keyed by
/// Deployment name.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerOverride>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceValues>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

/// Parses a multi-document YAML string into JSON documents, skipping empty
/// documents. Every document must carry apiVersion, kind and metadata.name.
pub fn parse_manifests(raw: &str) -> Result<Vec<Value>, Error> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = Value::deserialize(document).context(ParseManifestSnafu)?;
        if value.is_null() {
            continue;
        }
        snafu::ensure!(
            value.get("apiVersion").and_then(Value::as_str).is_some()
                && value.get("kind").and_then(Value::as_str).is_some()
                && value
                    .pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .is_some(),
            IncompleteDocumentSnafu
        );
        docs.push(value);
    }
    Ok(docs)
}

/// Applies the spec customizations to the parsed manifest documents.
///
/// An override naming a Deployment or container that does not exist in the
/// manifest set is a structural error and fails the reconcile.
pub fn apply_deployment_overrides(
    docs: &mut [Value],
    overrides: &BTreeMap<String, DeploymentOverride>,
) -> Result<(), Error> {
    for (name, deployment_override) in overrides {
        let doc = docs
            .iter_mut()
            .find(|doc| {
                doc.get("kind").and_then(Value::as_str) == Some("Deployment")
                    && doc.pointer("/metadata/name").and_then(Value::as_str)
                        == Some(name.as_str())
            })
            .context(UnknownDeploymentSnafu { name: name.as_str() })?;

        if let Some(replicas) = deployment_override.replicas {
            doc["spec"]["replicas"] = json!(replicas);
        }

        for container_override in &deployment_override.containers {
            let containers = doc
                .pointer_mut("/spec/template/spec/containers")
                .and_then(Value::as_array_mut)
                .context(UnknownContainerSnafu {
                    name: name.as_str(),
                    container: container_override.name.as_str(),
                })?;
            let container = containers
                .iter_mut()
                .find(|c| {
                    c.get("name").and_then(Value::as_str)
                        == Some(container_override.name.as_str())
                })
                .context(UnknownContainerSnafu {
                    name: name.as_str(),
                    container: container_override.name.as_str(),
                })?;

            if let Some(image) = &container_override.image {
                container["image"] = json!(image);
            }
            if let Some(resources) = &container_override.resources {
                apply_resources(container, resources);
            }
            for env in &container_override.env {
                upsert_env(container, env);
            }
        }
    }
    Ok(())
}

fn apply_resources(container: &mut Value, resources: &ResourceSpec) {
    for (field, values) in [
        ("requests", &resources.requests),
        ("limits", &resources.limits),
    ] {
        let Some(values) = values else { continue };
        if let Some(cpu) = &values.cpu {
            container["resources"][field]["cpu"] = json!(cpu);
        }
        if let Some(memory) = &values.memory {
            container["resources"][field]["memory"] = json!(memory);
        }
    }
}

fn upsert_env(container: &mut Value, env: &EnvEntry) {
    if !container["env"].is_array() {
        container["env"] = json!([]);
    }
    let Some(entries) = container["env"].as_array_mut() else {
        return;
    };
    match entries
        .iter_mut()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(env.name.as_str()))
    {
        Some(existing) => existing["value"] = json!(env.value),
        None => entries.push(json!({ "name": env.name, "value": env.value })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    const SAMPLE: &str = indoc! {r#"
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: build-service-controller-manager
          namespace: konflux-build-service
        spec:
          replicas: 1
          template:
            spec:
              containers:
              - name: manager
                image: quay.io/konflux-ci/build-service:latest
                env:
                - name: LOG_LEVEL
                  value: info
        ---
        apiVersion: v1
        kind: Service
        metadata:
          name: build-service-metrics
          namespace: konflux-build-service
        ---
    "#};

    fn overrides(
        deployment: &str,
        deployment_override: DeploymentOverride,
    ) -> BTreeMap<String, DeploymentOverride> {
        BTreeMap::from([(deployment.to_string(), deployment_override)])
    }

    #[test]
    fn parses_multi_document_yaml_and_skips_empty_docs() {
        let docs = parse_manifests(SAMPLE).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "Service");
    }

    #[test]
    fn all_embedded_manifest_sets_parse() {
        for (component, raw) in ALL_MANIFEST_SETS {
            let docs = parse_manifests(raw)
                .unwrap_or_else(|e| panic!("manifests for {component} failed to parse: {e}"));
            assert!(!docs.is_empty(), "manifest set {component} is empty");
        }
    }

    #[test]
    fn replicas_and_env_are_patched() {
        let mut docs = parse_manifests(SAMPLE).unwrap();
        let o = overrides(
            "build-service-controller-manager",
            DeploymentOverride {
                replicas: Some(3),
                containers: vec![ContainerOverride {
                    name: "manager".to_string(),
                    image: None,
                    resources: None,
                    env: vec![
                        EnvEntry {
                            name: "LOG_LEVEL".to_string(),
                            value: "debug".to_string(),
                        },
                        EnvEntry {
                            name: "FEATURE_FLAG".to_string(),
                            value: "on".to_string(),
                        },
                    ],
                }],
            },
        );

        apply_deployment_overrides(&mut docs, &o).unwrap();

        assert_eq!(docs[0]["spec"]["replicas"], 3);
        let env = docs[0]["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0]["value"], "debug");
        assert_eq!(env[1]["name"], "FEATURE_FLAG");
    }

    #[test]
    fn resources_and_image_are_patched() {
        let mut docs = parse_manifests(SAMPLE).unwrap();
        let o = overrides(
            "build-service-controller-manager",
            DeploymentOverride {
                replicas: None,
                containers: vec![ContainerOverride {
                    name: "manager".to_string(),
                    image: Some("quay.io/konflux-ci/build-service:v1.2.3".to_string()),
                    resources: Some(ResourceSpec {
                        requests: Some(ResourceValues {
                            cpu: Some("100m".to_string()),
                            memory: Some("256Mi".to_string()),
                        }),
                        limits: Some(ResourceValues {
                            cpu: None,
                            memory: Some("512Mi".to_string()),
                        }),
                    }),
                    env: vec![],
                }],
            },
        );

        apply_deployment_overrides(&mut docs, &o).unwrap();

        let container = &docs[0]["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "quay.io/konflux-ci/build-service:v1.2.3");
        assert_eq!(container["resources"]["requests"]["cpu"], "100m");
        assert_eq!(container["resources"]["limits"]["memory"], "512Mi");
        assert!(container["resources"]["limits"]["cpu"].is_null());
    }

    #[test]
    fn override_for_unknown_deployment_fails() {
        let mut docs = parse_manifests(SAMPLE).unwrap();
        let o = overrides("no-such-deployment", DeploymentOverride::default());

        let err = apply_deployment_overrides(&mut docs, &o).unwrap_err();
        assert!(matches!(err, Error::UnknownDeployment { .. }));
    }

    #[test]
    fn override_for_unknown_container_fails() {
        let mut docs = parse_manifests(SAMPLE).unwrap();
        let o = overrides(
            "build-service-controller-manager",
            DeploymentOverride {
                replicas: None,
                containers: vec![ContainerOverride {
                    name: "sidecar".to_string(),
                    ..ContainerOverride::default()
                }],
            },
        );

        let err = apply_deployment_overrides(&mut docs, &o).unwrap_err();
        assert!(matches!(err, Error::UnknownContainer { .. }));
    }
}
