//! Controller wiring: one controller per component CR running the generic
//! driver, plus the bespoke reconciler for the `Konflux` umbrella resource.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::{
    api::apps::v1::Deployment,
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{error, info, warn};

use crate::{
    conditions::{
        find_condition, mirror_condition, new_condition, remove_condition, set_condition,
        CONDITION_FALSE,
        CONDITION_TRUE, CONDITION_TYPE_READY, CONDITION_UNKNOWN, REASON_ALL_COMPONENTS_READY,
        REASON_COMPONENTS_NOT_READY, REASON_COMPONENT_NOT_FOUND, REASON_INVALID_SINGLETON_NAME,
    },
    crd::{
        Konflux, KonfluxBuildService, KonfluxComponentStatus, KonfluxImageController, KonfluxInfo,
        KonfluxIntegrationService, KonfluxRbac, KonfluxReleaseService, KonfluxUi, API_GROUP,
        API_VERSION, SINGLETON_NAME,
    },
    driver::{self, error_policy, reconcile_component, Ctx, KonfluxComponent},
    tracking::{self, TrackedKind, TrackingClient, COMPONENT_LABEL, OWNER_LABEL},
};

/// Component label value used by the umbrella controller for the sub-CRs it
/// owns.
const UMBRELLA_COMPONENT: &str = "konflux";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("object has no uid to build an owner reference from"))]
    ObjectHasNoUid,

    #[snafu(display("failed to apply component resource {kind}"))]
    ApplyComponentFailed {
        source: tracking::Error,
        kind: &'static str,
    },

    #[snafu(display("cleanup of disabled component resources failed"))]
    CleanupFailed { source: tracking::Error },

    #[snafu(display("failed to fetch component resource {kind}"))]
    FetchComponentFailed {
        source: kube::Error,
        kind: &'static str,
    },

    #[snafu(display("failed to update status"))]
    UpdateStatusFailed { source: kube::Error },
}

impl Error {
    pub fn reason(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// The component kinds the umbrella resource manages, in the order their
/// conditions are mirrored.
const COMPONENT_KINDS: &[ComponentKind] = &[
    ComponentKind {
        kind: "KonfluxBuildService",
        condition_prefix: "BuildService",
    },
    ComponentKind {
        kind: "KonfluxIntegrationService",
        condition_prefix: "IntegrationService",
    },
    ComponentKind {
        kind: "KonfluxReleaseService",
        condition_prefix: "ReleaseService",
    },
    ComponentKind {
        kind: "KonfluxUi",
        condition_prefix: "Ui",
    },
    ComponentKind {
        kind: "KonfluxImageController",
        condition_prefix: "ImageController",
    },
    ComponentKind {
        kind: "KonfluxRbac",
        condition_prefix: "Rbac",
    },
    ComponentKind {
        kind: "KonfluxInfo",
        condition_prefix: "Info",
    },
];

struct ComponentKind {
    kind: &'static str,
    condition_prefix: &'static str,
}

impl ComponentKind {
    fn enabled(&self, konflux: &Konflux) -> bool {
        let components = &konflux.spec.components;
        match self.kind {
            "KonfluxBuildService" => components.build_service.enabled,
            "KonfluxIntegrationService" => components.integration_service.enabled,
            "KonfluxReleaseService" => components.release_service.enabled,
            "KonfluxUi" => components.ui.enabled,
            "KonfluxImageController" => components.image_controller.enabled,
            "KonfluxRbac" => components.rbac.enabled,
            "KonfluxInfo" => components.info.enabled,
            _ => unreachable!("unknown component kind"),
        }
    }

    fn tracked(&self) -> TrackedKind {
        TrackedKind {
            group: API_GROUP,
            version: API_VERSION,
            kind: self.kind,
            cluster_scoped: true,
        }
    }
}

/// Reconciles the umbrella resource: creates the enabled component
/// singletons, deletes the disabled ones, and mirrors their readiness.
pub async fn reconcile_konflux(konflux: Arc<Konflux>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    match reconcile_konflux_inner(&konflux, &ctx).await {
        Ok(action) => Ok(action),
        Err(err) => {
            let condition = new_condition(
                CONDITION_TYPE_READY,
                CONDITION_FALSE,
                err.reason(),
                err.to_string(),
                konflux.meta().generation,
            );
            let mut conditions = current_conditions(&konflux);
            set_condition(&mut conditions, condition);
            if let Err(status_err) = write_konflux_conditions(&ctx, &konflux, conditions).await {
                warn!(
                    error = &status_err as &dyn std::error::Error,
                    "failed to record error condition"
                );
            }
            Err(err)
        }
    }
}

async fn reconcile_konflux_inner(konflux: &Arc<Konflux>, ctx: &Arc<Ctx>) -> Result<Action, Error> {
    let name = konflux.name_any();
    if name != SINGLETON_NAME {
        warn!(name, "ignoring Konflux resource with non-singleton name");
        let condition = new_condition(
            CONDITION_TYPE_READY,
            CONDITION_FALSE,
            REASON_INVALID_SINGLETON_NAME,
            format!("resource must be named {SINGLETON_NAME:?}, got {name:?}"),
            konflux.meta().generation,
        );
        let mut conditions = current_conditions(konflux);
        set_condition(&mut conditions, condition);
        write_konflux_conditions(ctx, konflux, conditions).await?;
        return Ok(Action::await_change());
    }

    let owner_ref = konflux
        .controller_owner_ref(&())
        .context(ObjectHasNoUidSnafu)?;
    let mut tracker = TrackingClient::new(ctx.client.clone(), SINGLETON_NAME, UMBRELLA_COMPONENT);

    // Apply an empty-spec singleton for each enabled component. Server-side
    // apply only owns the fields we send, so component specs edited by the
    // cluster admin survive.
    for component in COMPONENT_KINDS {
        if !component.enabled(konflux) {
            continue;
        }
        let doc = json!({
            "apiVersion": format!("{API_GROUP}/{API_VERSION}"),
            "kind": component.kind,
            "metadata": { "name": SINGLETON_NAME },
            "spec": {},
        });
        tracker
            .apply_owned(&owner_ref, doc)
            .await
            .context(ApplyComponentFailedSnafu {
                kind: component.kind,
            })?;
    }

    // Disabled components are orphans of this pass and get deleted. The
    // sub-CRs are cluster-scoped, so they must be allow-listed explicitly.
    let tracked: Vec<TrackedKind> = COMPONENT_KINDS.iter().map(ComponentKind::tracked).collect();
    tracker
        .cleanup_orphans(&tracked, "", &tracked)
        .await
        .context(CleanupFailedSnafu)?;

    let mut conditions = current_conditions(konflux);
    prune_disabled_conditions(&mut conditions, konflux);
    let mut not_ready = Vec::new();

    for component in COMPONENT_KINDS {
        if !component.enabled(konflux) {
            continue;
        }
        match fetch_component_ready(ctx, component).await? {
            Some(ready) => {
                let is_ready = ready.status == CONDITION_TRUE;
                mirror_condition(&mut conditions, component.condition_prefix, &ready);
                if !is_ready {
                    not_ready.push(component.kind);
                }
            }
            None => {
                let missing = new_condition(
                    CONDITION_TYPE_READY,
                    CONDITION_UNKNOWN,
                    REASON_COMPONENT_NOT_FOUND,
                    format!("{} {SINGLETON_NAME:?} not found or not yet reconciled", component.kind),
                    None,
                );
                mirror_condition(&mut conditions, component.condition_prefix, &missing);
                not_ready.push(component.kind);
            }
        }
    }

    let overall = if not_ready.is_empty() {
        new_condition(
            CONDITION_TYPE_READY,
            CONDITION_TRUE,
            REASON_ALL_COMPONENTS_READY,
            "All enabled components are ready",
            konflux.meta().generation,
        )
    } else {
        new_condition(
            CONDITION_TYPE_READY,
            CONDITION_FALSE,
            REASON_COMPONENTS_NOT_READY,
            format!("Waiting for components: {}", not_ready.join(", ")),
            konflux.meta().generation,
        )
    };
    set_condition(&mut conditions, overall);

    write_konflux_conditions(ctx, konflux, conditions).await?;
    Ok(Action::await_change())
}

/// Fetches the `Ready` condition of a component singleton, `None` when the
/// resource does not exist or carries no status yet.
async fn fetch_component_ready(
    ctx: &Arc<Ctx>,
    component: &ComponentKind,
) -> Result<Option<Condition>, Error> {
    macro_rules! fetch {
        ($ty:ty) => {
            Api::<$ty>::all(ctx.client.clone())
                .get_opt(SINGLETON_NAME)
                .await
                .context(FetchComponentFailedSnafu {
                    kind: component.kind,
                })?
                .and_then(|obj| obj.status)
                .and_then(|status| {
                    find_condition(&status.conditions, CONDITION_TYPE_READY).cloned()
                })
        };
    }

    Ok(match component.kind {
        "KonfluxBuildService" => fetch!(KonfluxBuildService),
        "KonfluxIntegrationService" => fetch!(KonfluxIntegrationService),
        "KonfluxReleaseService" => fetch!(KonfluxReleaseService),
        "KonfluxUi" => fetch!(KonfluxUi),
        "KonfluxImageController" => fetch!(KonfluxImageController),
        "KonfluxRbac" => fetch!(KonfluxRbac),
        "KonfluxInfo" => fetch!(KonfluxInfo),
        _ => unreachable!("unknown component kind"),
    })
}

fn current_conditions(konflux: &Konflux) -> Vec<Condition> {
    konflux
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
}

/// Drops the mirrored `<prefix>Ready` conditions of disabled components, so
/// a component that was turned off does not leave a stale readiness entry
/// behind on the umbrella resource.
fn prune_disabled_conditions(conditions: &mut Vec<Condition>, konflux: &Konflux) {
    for component in COMPONENT_KINDS {
        if !component.enabled(konflux) {
            remove_condition(
                conditions,
                &format!("{}{CONDITION_TYPE_READY}", component.condition_prefix),
            );
        }
    }
}

/// Writes `conditions` as the complete status condition list, patching only
/// when it differs from the live one.
async fn write_konflux_conditions(
    ctx: &Arc<Ctx>,
    konflux: &Arc<Konflux>,
    conditions: Vec<Condition>,
) -> Result<(), Error> {
    if conditions == current_conditions(konflux) {
        return Ok(());
    }

    let status = KonfluxComponentStatus { conditions };
    Api::<Konflux>::all(ctx.client.clone())
        .patch_status(
            &konflux.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .context(UpdateStatusFailedSnafu)?;
    Ok(())
}

pub fn konflux_error_policy(_konflux: Arc<Konflux>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(
        error = error as &dyn std::error::Error,
        "umbrella reconcile failed"
    );
    Action::requeue(driver::ERROR_REQUEUE)
}

/// Runs the controller for one component CR type until the stream ends.
async fn run_component<K: KonfluxComponent>(ctx: Arc<Ctx>) {
    let deployments = Api::<Deployment>::all(ctx.client.clone());
    let deployment_watch = watcher::Config::default().labels(&format!(
        "{OWNER_LABEL}={SINGLETON_NAME},{COMPONENT_LABEL}={}",
        K::COMPONENT
    ));

    Controller::new(Api::<K>::all(ctx.client.clone()), watcher::Config::default())
        .owns(deployments, deployment_watch)
        .shutdown_on_signal()
        .run(reconcile_component::<K>, error_policy::<K>, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((object, _)) => {
                        ctx.metrics.observe_reconcile(K::COMPONENT);
                        info!(component = K::COMPONENT, object = %object.name, "reconciled");
                    }
                    Err(err) => {
                        ctx.metrics.observe_reconcile_failure(K::COMPONENT);
                        error!(
                            error = &err as &dyn std::error::Error,
                            component = K::COMPONENT,
                            "reconciliation error"
                        );
                    }
                }
            }
        })
        .await;
}

async fn run_umbrella(ctx: Arc<Ctx>) {
    Controller::new(
        Api::<Konflux>::all(ctx.client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_konflux, konflux_error_policy, ctx.clone())
    .for_each(|result| {
        let ctx = ctx.clone();
        async move {
            match result {
                Ok((object, _)) => {
                    ctx.metrics.observe_reconcile(UMBRELLA_COMPONENT);
                    info!(object = %object.name, "reconciled umbrella resource");
                }
                Err(err) => {
                    ctx.metrics.observe_reconcile_failure(UMBRELLA_COMPONENT);
                    error!(
                        error = &err as &dyn std::error::Error,
                        "umbrella reconciliation error"
                    );
                }
            }
        }
    })
    .await;
}

/// Runs all controllers concurrently until shutdown.
pub async fn run_all(ctx: Arc<Ctx>) {
    tokio::join!(
        run_umbrella(ctx.clone()),
        run_component::<KonfluxBuildService>(ctx.clone()),
        run_component::<KonfluxIntegrationService>(ctx.clone()),
        run_component::<KonfluxReleaseService>(ctx.clone()),
        run_component::<KonfluxUi>(ctx.clone()),
        run_component::<KonfluxImageController>(ctx.clone()),
        run_component::<KonfluxRbac>(ctx.clone()),
        run_component::<KonfluxInfo>(ctx),
    );
}
