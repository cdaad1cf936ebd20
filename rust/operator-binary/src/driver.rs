//! Generic reconcile driver shared by all component controllers.
//!
//! Each component CR gets the same treatment: validate the singleton name,
//! ensure the target namespace, render auxiliary ConfigMaps, apply the
//! embedded manifest set with the spec's Deployment overrides, clean up
//! orphans, and fold Deployment readiness into the `Ready` condition.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use k8s_openapi::{
    api::apps::v1::Deployment,
    apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference},
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::ClusterResourceScope,
    runtime::controller::Action,
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{info, warn};

use crate::{
    cluster_info::{self, ClusterConfigData},
    conditions::{
        new_condition, set_condition, DeploymentStatusSummary, CONDITION_FALSE,
        CONDITION_TYPE_READY, REASON_INVALID_SINGLETON_NAME,
    },
    crd::{
        KonfluxBuildService, KonfluxComponentStatus, KonfluxImageController, KonfluxInfo,
        KonfluxIntegrationService, KonfluxRbac, KonfluxReleaseService, KonfluxUi, SINGLETON_NAME,
    },
    manifests::{self, apply_deployment_overrides, parse_manifests, DeploymentOverride},
    metrics::Metrics,
    pipelines::{self, default_pipelines, merge_pipelines, render_pipeline_config},
    tracking::{self, TrackedKind, TrackingClient, COMPONENT_LABEL, OWNER_LABEL},
};

pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub client: Client,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object has no uid to build an owner reference from"))]
    ObjectHasNoUid,

    #[snafu(display("failed to create target namespace {namespace:?}"))]
    NamespaceCreationFailed {
        source: tracking::Error,
        namespace: String,
    },

    #[snafu(display("embedded manifest set is invalid"))]
    InvalidManifest { source: manifests::Error },

    #[snafu(display("failed to build auxiliary configuration"))]
    InvalidAuxConfig { source: AuxConfigError },

    #[snafu(display("failed to apply object"))]
    ApplyFailed { source: tracking::Error },

    #[snafu(display("orphan cleanup failed"))]
    CleanupFailed { source: tracking::Error },

    #[snafu(display("failed to list owned Deployments"))]
    FailedToGetDeploymentStatus { source: kube::Error },

    #[snafu(display("failed to update status"))]
    UpdateStatusFailed { source: kube::Error },
}

impl Error {
    /// Static error category, used as the `Ready=False` condition reason.
    pub fn reason(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

#[derive(Debug, Snafu)]
pub enum AuxConfigError {
    #[snafu(display("invalid pipeline configuration"))]
    InvalidPipelineConfig { source: pipelines::Error },

    #[snafu(display("failed to render pipeline configuration"))]
    RenderPipelineConfig { source: serde_yaml::Error },

    #[snafu(display("failed to render public info document"))]
    RenderInfo { source: serde_json::Error },

    #[snafu(display("failed to render banner content"))]
    RenderBanner { source: serde_yaml::Error },
}

/// A ConfigMap the component derives from its spec rather than from the
/// embedded manifest set: name plus data entries.
pub type AuxConfigMap = (String, BTreeMap<String, String>);

/// One deployable platform component. The driver is generic over this trait;
/// implementations only supply their manifest set, tracked kinds and
/// spec-derived configuration.
pub trait KonfluxComponent:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Value of the component ownership label.
    const COMPONENT: &'static str;
    /// Namespace the component's namespaced objects live in.
    const TARGET_NAMESPACE: &'static str;

    fn raw_manifests() -> &'static str;

    /// Kinds considered during orphan cleanup.
    fn tracked_kinds() -> &'static [TrackedKind];

    /// Cluster-scoped kinds that may be deleted during cleanup.
    fn cluster_allowlist() -> &'static [TrackedKind] {
        &[]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride>;

    /// ConfigMaps derived from the spec, applied alongside the manifest set.
    fn aux_config(&self) -> Result<Vec<AuxConfigMap>, AuxConfigError> {
        Ok(Vec::new())
    }

    fn conditions(&self) -> Vec<Condition>;
}

pub async fn reconcile_component<K: KonfluxComponent>(
    component: Arc<K>,
    ctx: Arc<Ctx>,
) -> Result<Action, Error> {
    match reconcile_inner(&component, &ctx).await {
        Ok(action) => Ok(action),
        Err(err) => {
            let condition = new_condition(
                CONDITION_TYPE_READY,
                CONDITION_FALSE,
                err.reason(),
                err.to_string(),
                component.meta().generation,
            );
            // Best effort: the original error is what the caller should see.
            if let Err(status_err) =
                write_condition::<K>(&ctx.client, &component, condition).await
            {
                warn!(
                    error = &status_err as &dyn std::error::Error,
                    "failed to record error condition"
                );
            }
            Err(err)
        }
    }
}

async fn reconcile_inner<K: KonfluxComponent>(
    component: &Arc<K>,
    ctx: &Arc<Ctx>,
) -> Result<Action, Error> {
    let name = component.name_any();
    if name != SINGLETON_NAME {
        warn!(
            component = K::COMPONENT,
            name, "ignoring resource with non-singleton name"
        );
        let condition = new_condition(
            CONDITION_TYPE_READY,
            CONDITION_FALSE,
            REASON_INVALID_SINGLETON_NAME,
            format!("resource must be named {SINGLETON_NAME:?}, got {name:?}"),
            component.meta().generation,
        );
        write_condition::<K>(&ctx.client, component, condition).await?;
        return Ok(Action::await_change());
    }

    let owner_ref = component
        .controller_owner_ref(&())
        .context(ObjectHasNoUidSnafu)?;
    let mut tracker = TrackingClient::new(ctx.client.clone(), SINGLETON_NAME, K::COMPONENT);

    ensure_namespace(&mut tracker, &owner_ref, K::TARGET_NAMESPACE).await?;

    for (name, data) in component.aux_config().context(InvalidAuxConfigSnafu)? {
        let doc = config_map_document(&name, K::TARGET_NAMESPACE, &data);
        tracker
            .apply_owned(&owner_ref, doc)
            .await
            .context(ApplyFailedSnafu)?;
    }

    let mut docs = parse_manifests(K::raw_manifests()).context(InvalidManifestSnafu)?;
    apply_deployment_overrides(&mut docs, component.deployment_overrides())
        .context(InvalidManifestSnafu)?;
    for doc in docs {
        tracker
            .apply_owned(&owner_ref, doc)
            .await
            .context(ApplyFailedSnafu)?;
    }

    let deleted = tracker
        .cleanup_orphans(
            K::tracked_kinds(),
            K::TARGET_NAMESPACE,
            K::cluster_allowlist(),
        )
        .await
        .context(CleanupFailedSnafu)?;
    if deleted > 0 {
        info!(component = K::COMPONENT, deleted, "removed orphaned objects");
    }

    let deployments = Api::<Deployment>::namespaced(ctx.client.clone(), K::TARGET_NAMESPACE)
        .list(&ListParams::default().labels(&format!(
            "{OWNER_LABEL}={SINGLETON_NAME},{COMPONENT_LABEL}={}",
            K::COMPONENT
        )))
        .await
        .context(FailedToGetDeploymentStatusSnafu)?;
    let summary = DeploymentStatusSummary::from_deployments(&deployments.items);
    let condition = summary.to_ready_condition(component.meta().generation);
    write_condition::<K>(&ctx.client, component, condition).await?;

    Ok(Action::await_change())
}

pub fn error_policy<K: KonfluxComponent>(
    _component: Arc<K>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    warn!(
        error = error as &dyn std::error::Error,
        component = K::COMPONENT,
        "reconcile failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Upserts `condition` into the resource's status, patching only when the
/// condition list actually changed.
async fn write_condition<K: KonfluxComponent>(
    client: &Client,
    component: &Arc<K>,
    condition: Condition,
) -> Result<(), Error> {
    let mut conditions = component.conditions();
    let before = conditions.clone();
    set_condition(&mut conditions, condition);
    if conditions == before {
        return Ok(());
    }

    let status = KonfluxComponentStatus { conditions };
    Api::<K>::all(client.clone())
        .patch_status(
            &component.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .context(UpdateStatusFailedSnafu)?;
    Ok(())
}

async fn ensure_namespace(
    tracker: &mut TrackingClient,
    owner_ref: &OwnerReference,
    namespace: &str,
) -> Result<(), Error> {
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": namespace },
    });
    tracker
        .apply_owned(owner_ref, doc)
        .await
        .context(NamespaceCreationFailedSnafu { namespace })?;
    Ok(())
}

fn config_map_document(name: &str, namespace: &str, data: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace },
        "data": data,
    })
}

const SERVICE_ACCOUNT: TrackedKind = TrackedKind {
    group: "",
    version: "v1",
    kind: "ServiceAccount",
    cluster_scoped: false,
};
const CONFIG_MAP: TrackedKind = TrackedKind {
    group: "",
    version: "v1",
    kind: "ConfigMap",
    cluster_scoped: false,
};
const SERVICE: TrackedKind = TrackedKind {
    group: "",
    version: "v1",
    kind: "Service",
    cluster_scoped: false,
};
const DEPLOYMENT: TrackedKind = TrackedKind {
    group: "apps",
    version: "v1",
    kind: "Deployment",
    cluster_scoped: false,
};
const ROLE: TrackedKind = TrackedKind {
    group: "rbac.authorization.k8s.io",
    version: "v1",
    kind: "Role",
    cluster_scoped: false,
};
const ROLE_BINDING: TrackedKind = TrackedKind {
    group: "rbac.authorization.k8s.io",
    version: "v1",
    kind: "RoleBinding",
    cluster_scoped: false,
};
const CLUSTER_ROLE: TrackedKind = TrackedKind {
    group: "rbac.authorization.k8s.io",
    version: "v1",
    kind: "ClusterRole",
    cluster_scoped: true,
};
const CERTIFICATE: TrackedKind = TrackedKind {
    group: "cert-manager.io",
    version: "v1",
    kind: "Certificate",
    cluster_scoped: false,
};
const ISSUER: TrackedKind = TrackedKind {
    group: "cert-manager.io",
    version: "v1",
    kind: "Issuer",
    cluster_scoped: false,
};

impl KonfluxComponent for KonfluxBuildService {
    const COMPONENT: &'static str = "build-service";
    const TARGET_NAMESPACE: &'static str = "konflux-build-service";

    fn raw_manifests() -> &'static str {
        manifests::BUILD_SERVICE_MANIFESTS
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[
            SERVICE_ACCOUNT,
            ROLE,
            ROLE_BINDING,
            DEPLOYMENT,
            SERVICE,
            CONFIG_MAP,
        ]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        &self.spec.deployments
    }

    fn aux_config(&self) -> Result<Vec<AuxConfigMap>, AuxConfigError> {
        let selection = merge_pipelines(&default_pipelines(), &self.spec.pipeline_settings)
            .context(InvalidPipelineConfigSnafu)?;
        let rendered = render_pipeline_config(&selection).context(RenderPipelineConfigSnafu)?;
        Ok(vec![(
            pipelines::PIPELINE_CONFIG_MAP_NAME.to_string(),
            BTreeMap::from([(pipelines::PIPELINE_CONFIG_KEY.to_string(), rendered)]),
        )])
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl KonfluxComponent for KonfluxIntegrationService {
    const COMPONENT: &'static str = "integration-service";
    const TARGET_NAMESPACE: &'static str = "konflux-integration-service";

    fn raw_manifests() -> &'static str {
        manifests::INTEGRATION_SERVICE_MANIFESTS
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[SERVICE_ACCOUNT, DEPLOYMENT, SERVICE]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        &self.spec.deployments
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl KonfluxComponent for KonfluxReleaseService {
    const COMPONENT: &'static str = "release-service";
    const TARGET_NAMESPACE: &'static str = "konflux-release-service";

    fn raw_manifests() -> &'static str {
        manifests::RELEASE_SERVICE_MANIFESTS
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[SERVICE_ACCOUNT, DEPLOYMENT, CONFIG_MAP]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        &self.spec.deployments
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl KonfluxComponent for KonfluxUi {
    const COMPONENT: &'static str = "ui";
    const TARGET_NAMESPACE: &'static str = "konflux-ui";

    fn raw_manifests() -> &'static str {
        manifests::UI_MANIFESTS
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[SERVICE_ACCOUNT, DEPLOYMENT, SERVICE, CERTIFICATE, ISSUER]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        &self.spec.deployments
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl KonfluxComponent for KonfluxImageController {
    const COMPONENT: &'static str = "image-controller";
    const TARGET_NAMESPACE: &'static str = "konflux-image-controller";

    fn raw_manifests() -> &'static str {
        manifests::IMAGE_CONTROLLER_MANIFESTS
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[SERVICE_ACCOUNT, DEPLOYMENT]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        &self.spec.deployments
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl KonfluxComponent for KonfluxRbac {
    const COMPONENT: &'static str = "rbac";
    const TARGET_NAMESPACE: &'static str = "konflux";

    fn raw_manifests() -> &'static str {
        manifests::RBAC_MANIFESTS
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[CLUSTER_ROLE, ROLE, ROLE_BINDING]
    }

    fn cluster_allowlist() -> &'static [TrackedKind] {
        &[CLUSTER_ROLE]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        &self.spec.deployments
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl KonfluxComponent for KonfluxInfo {
    const COMPONENT: &'static str = "info";
    const TARGET_NAMESPACE: &'static str = "konflux-info";

    fn raw_manifests() -> &'static str {
        // Everything this component manages is derived from its spec.
        ""
    }

    fn tracked_kinds() -> &'static [TrackedKind] {
        &[CONFIG_MAP]
    }

    fn deployment_overrides(&self) -> &BTreeMap<String, DeploymentOverride> {
        static EMPTY: BTreeMap<String, DeploymentOverride> = BTreeMap::new();
        &EMPTY
    }

    fn aux_config(&self) -> Result<Vec<AuxConfigMap>, AuxConfigError> {
        let spec = &self.spec;

        let info = cluster_info::render_info_json(
            spec.environment,
            spec.visibility,
            &spec.integrations,
            &spec.rbac,
        )
        .context(RenderInfoSnafu)?;
        let banner = cluster_info::render_banner_yaml(&spec.banners).context(RenderBannerSnafu)?;
        let cluster_config = spec
            .cluster_config
            .merge_over(&ClusterConfigData::defaults_for(spec.environment));

        Ok(vec![
            (
                cluster_info::INFO_CONFIG_MAP_NAME.to_string(),
                BTreeMap::from([(cluster_info::INFO_CONFIG_KEY.to_string(), info)]),
            ),
            (
                cluster_info::BANNER_CONFIG_MAP_NAME.to_string(),
                BTreeMap::from([(cluster_info::BANNER_CONFIG_KEY.to_string(), banner)]),
            ),
            (
                cluster_info::CLUSTER_CONFIG_MAP_NAME.to_string(),
                cluster_config,
            ),
        ])
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crd::{KonfluxBuildServiceSpec, KonfluxInfoSpec};
    use crate::pipelines::PipelineSettings;

    #[test]
    fn error_reasons_are_stable_identifiers() {
        let err = Error::ApplyFailed {
            source: tracking::Error::DocumentWithoutName,
        };
        assert_eq!(err.reason(), "ApplyFailed");

        let err = Error::FailedToGetDeploymentStatus {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }),
        };
        assert_eq!(err.reason(), "FailedToGetDeploymentStatus");
    }

    #[test]
    fn build_service_aux_config_renders_pipeline_config_map() {
        let build_service = KonfluxBuildService::new(
            "konflux",
            KonfluxBuildServiceSpec {
                pipeline_settings: PipelineSettings::default(),
                deployments: BTreeMap::new(),
            },
        );

        let aux = build_service.aux_config().unwrap();
        assert_eq!(aux.len(), 1);
        let (name, data) = &aux[0];
        assert_eq!(name, pipelines::PIPELINE_CONFIG_MAP_NAME);
        let payload = &data[pipelines::PIPELINE_CONFIG_KEY];
        assert!(payload.contains("default-pipeline-name: docker-build-oci-ta"));
        assert!(payload.contains("docker-build-multi-platform-oci-ta"));
    }

    #[test]
    fn invalid_default_pipeline_surfaces_as_aux_error() {
        let build_service = KonfluxBuildService::new(
            "konflux",
            KonfluxBuildServiceSpec {
                pipeline_settings: PipelineSettings {
                    default_pipeline_name: Some("does-not-exist".to_string()),
                    ..PipelineSettings::default()
                },
                deployments: BTreeMap::new(),
            },
        );

        let err = build_service.aux_config().unwrap_err();
        assert!(matches!(err, AuxConfigError::InvalidPipelineConfig { .. }));
    }

    #[test]
    fn info_aux_config_produces_all_three_config_maps() {
        let info = KonfluxInfo::new("konflux", KonfluxInfoSpec::default());
        let aux = info.aux_config().unwrap();

        let names: Vec<&str> = aux.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            [
                cluster_info::INFO_CONFIG_MAP_NAME,
                cluster_info::BANNER_CONFIG_MAP_NAME,
                cluster_info::CLUSTER_CONFIG_MAP_NAME,
            ]
        );

        let (_, cluster_config) = &aux[2];
        assert_eq!(
            cluster_config["rekor-url"],
            "https://rekor.sigstore.dev"
        );
        assert!(!cluster_config.contains_key("cosign-public-key"));
    }

    #[test]
    fn info_manifest_set_is_empty() {
        assert!(parse_manifests(KonfluxInfo::raw_manifests())
            .unwrap()
            .is_empty());
    }
}
