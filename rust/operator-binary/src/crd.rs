//! This file contains the definition of all the custom resources that this
//! operator manages: the `Konflux` umbrella resource and one singleton
//! resource per platform component.
//!
//! All resources are cluster-scoped and must be named [`SINGLETON_NAME`];
//! a resource with any other name is rejected during reconciliation.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    cluster_info::{BannerItem, ClusterConfigData, Environment, Integrations, RbacRole, Visibility},
    manifests::DeploymentOverride,
    pipelines::PipelineSettings,
};

pub const API_GROUP: &str = "konflux.dev";
pub const API_VERSION: &str = "v1alpha1";

/// The only accepted name for every resource defined here.
pub const SINGLETON_NAME: &str = "konflux";

/// Status shared by all resources in this file: a plain condition list,
/// carrying at least the `Ready` condition.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KonfluxComponentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Umbrella resource: creates and deletes the per-component singletons and
/// aggregates their readiness.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "Konflux",
    plural = "konfluxes",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxSpec {
    /// Which platform components to deploy.
    #[serde(default)]
    pub components: ComponentToggles,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentToggles {
    #[serde(default)]
    pub build_service: ComponentToggle,
    #[serde(default)]
    pub integration_service: ComponentToggle,
    #[serde(default)]
    pub release_service: ComponentToggle,
    #[serde(default)]
    pub ui: ComponentToggle,
    #[serde(default)]
    pub image_controller: ComponentToggle,
    #[serde(default)]
    pub rbac: ComponentToggle,
    #[serde(default)]
    pub info: ComponentToggle,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentToggle {
    pub enabled: bool,
}

impl Default for ComponentToggle {
    fn default() -> Self {
        ComponentToggle { enabled: true }
    }
}

/// The build service: Tekton-based image builds plus the pipeline
/// configuration consumed by pipeline runs.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxBuildService",
    plural = "konfluxbuildservices",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxBuildServiceSpec {
    #[serde(flatten)]
    pub pipeline_settings: PipelineSettings,
    /// Per-Deployment customization, keyed by Deployment name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, DeploymentOverride>,
}

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxIntegrationService",
    plural = "konfluxintegrationservices",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxIntegrationServiceSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, DeploymentOverride>,
}

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxReleaseService",
    plural = "konfluxreleaseservices",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxReleaseServiceSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, DeploymentOverride>,
}

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxUi",
    plural = "konfluxuis",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxUiSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, DeploymentOverride>,
}

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxImageController",
    plural = "konfluximagecontrollers",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxImageControllerSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, DeploymentOverride>,
}

/// Cluster RBAC for platform users. Ships no Deployments, only roles and
/// bindings.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxRbac",
    plural = "konfluxrbacs",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxRbacSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, DeploymentOverride>,
}

/// Cluster metadata surfaced to users: the public info document, UI banners
/// and the signing/transparency endpoint configuration.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "konflux.dev",
    version = "v1alpha1",
    kind = "KonfluxInfo",
    plural = "konfluxinfos",
    status = "KonfluxComponentStatus"
)]
pub struct KonfluxInfoSpec {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub integrations: Integrations,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rbac: Vec<RbacRole>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub banners: Vec<BannerItem>,
    /// Overrides layered on top of the environment defaults.
    #[serde(default)]
    pub cluster_config: ClusterConfigData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_service_spec_flattens_pipeline_settings() {
        let spec: KonfluxBuildServiceSpec = serde_yaml::from_str(
            "
            removeDefaults: true
            pipelines:
              - name: custom
                bundle: quay.io/acme/pipeline-custom:1
            defaultPipelineName: custom
            deployments:
              build-service-controller-manager:
                replicas: 2
            ",
        )
        .unwrap();

        assert!(spec.pipeline_settings.remove_defaults);
        assert_eq!(spec.pipeline_settings.pipelines.len(), 1);
        assert_eq!(
            spec.pipeline_settings.default_pipeline_name.as_deref(),
            Some("custom")
        );
        assert_eq!(
            spec.deployments["build-service-controller-manager"].replicas,
            Some(2)
        );
    }

    #[test]
    fn empty_specs_deserialize_with_defaults() {
        let konflux: KonfluxSpec = serde_yaml::from_str("{}").unwrap();
        assert!(konflux.components.build_service.enabled);
        assert!(konflux.components.info.enabled);

        let ui: KonfluxUiSpec = serde_yaml::from_str("{}").unwrap();
        assert!(ui.deployments.is_empty());

        let info: KonfluxInfoSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(info.environment, Environment::Production);
        assert_eq!(info.visibility, Visibility::Public);
    }

    #[test]
    fn component_toggles_parse_explicit_values() {
        let spec: KonfluxSpec = serde_yaml::from_str(
            "
            components:
              ui:
                enabled: false
              rbac:
                enabled: true
            ",
        )
        .unwrap();
        assert!(!spec.components.ui.enabled);
        assert!(spec.components.rbac.enabled);
        // unspecified components default to enabled
        assert!(spec.components.release_service.enabled);
    }
}
