//! Status condition helpers shared by all controllers.
//!
//! Conditions use the upstream `metav1.Condition` type. The upsert helper
//! keeps `lastTransitionTime` stable while the status value is unchanged, so
//! copying an identical condition is a no-op to observers and does not cause
//! reconcile churn.

use k8s_openapi::{
    api::apps::v1::Deployment,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    chrono::Utc,
};
use kube::ResourceExt;

pub const CONDITION_TYPE_READY: &str = "Ready";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

pub const REASON_ALL_COMPONENTS_READY: &str = "AllComponentsReady";
pub const REASON_COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
pub const REASON_COMPONENT_READY: &str = "ComponentReady";
pub const REASON_COMPONENT_NOT_FOUND: &str = "ComponentNotFound";
pub const REASON_DEPLOYMENTS_NOT_READY: &str = "DeploymentsNotReady";
pub const REASON_INVALID_SINGLETON_NAME: &str = "InvalidSingletonName";

pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Upserts `new` into `conditions` by condition type.
///
/// When a condition of the same type already exists with the same status
/// value, its `lastTransitionTime` is preserved; only reason, message and
/// observed generation are refreshed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Mirrors a sub-component condition into a parent condition list under a
/// component-name prefix, e.g. `Ready` becomes `BuildServiceReady`.
pub fn mirror_condition(conditions: &mut Vec<Condition>, prefix: &str, source: &Condition) {
    let mirrored = Condition {
        type_: format!("{prefix}{}", source.type_),
        ..source.clone()
    };
    set_condition(conditions, mirrored);
}

/// A deployment is ready iff all its replicas are live and up to date, and it
/// asks for at least one replica.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    let replicas = status.replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    replicas > 0 && ready == replicas && updated == replicas
}

/// Ephemeral per-reconcile aggregate over the Deployments owned by one
/// component. Not persisted; folded into the `Ready` condition.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeploymentStatusSummary {
    pub total: usize,
    pub not_ready: Vec<String>,
}

impl DeploymentStatusSummary {
    pub fn from_deployments(deployments: &[Deployment]) -> Self {
        let mut not_ready: Vec<String> = deployments
            .iter()
            .filter(|d| !deployment_ready(d))
            .map(|d| d.name_any())
            .collect();
        not_ready.sort();
        DeploymentStatusSummary {
            total: deployments.len(),
            not_ready,
        }
    }

    pub fn all_ready(&self) -> bool {
        self.not_ready.is_empty()
    }

    /// Human-readable readiness message. Config-only components get a
    /// distinct message instead of a misleading "0/0 ready" phrasing.
    pub fn message(&self) -> String {
        if self.total == 0 {
            "Component ready (no deployments to track)".to_string()
        } else if self.all_ready() {
            format!("All {} deployments are ready", self.total)
        } else {
            format!("Waiting for deployments: {}", self.not_ready.join(", "))
        }
    }

    pub fn to_ready_condition(&self, observed_generation: Option<i64>) -> Condition {
        if self.all_ready() {
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_TRUE,
                REASON_COMPONENT_READY,
                self.message(),
                observed_generation,
            )
        } else {
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_FALSE,
                REASON_DEPLOYMENTS_NOT_READY,
                self.message(),
                observed_generation,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use kube::api::ObjectMeta;
    use rstest::rstest;

    fn deployment(name: &str, replicas: i32, ready: i32, updated: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: None,
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                ..DeploymentStatus::default()
            }),
        }
    }

    #[rstest]
    #[case::all_ready(3, 3, 3, true)]
    #[case::scaling_up(3, 2, 3, false)]
    #[case::rolling_update(3, 3, 1, false)]
    #[case::zero_replicas(0, 0, 0, false)]
    fn readiness_predicate(
        #[case] replicas: i32,
        #[case] ready: i32,
        #[case] updated: i32,
        #[case] expected: bool,
    ) {
        let d = deployment("d", replicas, ready, updated);
        assert_eq!(deployment_ready(&d), expected);
    }

    #[test]
    fn deployment_without_status_is_not_ready() {
        let d = Deployment::default();
        assert!(!deployment_ready(&d));
    }

    #[test]
    fn zero_deployments_message_is_exact() {
        let summary = DeploymentStatusSummary::from_deployments(&[]);
        assert!(summary.all_ready());
        assert_eq!(summary.message(), "Component ready (no deployments to track)");
    }

    #[test]
    fn all_ready_message_is_exact() {
        let summary = DeploymentStatusSummary::from_deployments(&[
            deployment("a", 1, 1, 1),
            deployment("b", 2, 2, 2),
        ]);
        assert!(summary.all_ready());
        assert_eq!(summary.message(), "All 2 deployments are ready");
    }

    #[test]
    fn not_ready_names_are_listed_sorted() {
        let summary = DeploymentStatusSummary::from_deployments(&[
            deployment("zeta", 1, 0, 1),
            deployment("alpha", 1, 1, 1),
            deployment("beta", 2, 2, 1),
        ]);
        assert!(!summary.all_ready());
        assert_eq!(summary.message(), "Waiting for deployments: beta, zeta");

        let cond = summary.to_ready_condition(Some(4));
        assert_eq!(cond.status, CONDITION_FALSE);
        assert_eq!(cond.reason, REASON_DEPLOYMENTS_NOT_READY);
        assert_eq!(cond.observed_generation, Some(4));
    }

    #[test]
    fn copying_identical_condition_preserves_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            new_condition(CONDITION_TYPE_READY, CONDITION_TRUE, "Ready", "ok", Some(1)),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            new_condition(CONDITION_TYPE_READY, CONDITION_TRUE, "Ready", "ok", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn status_change_updates_transition_time() {
        let mut conditions = Vec::new();
        let mut stale = new_condition(CONDITION_TYPE_READY, CONDITION_TRUE, "Ready", "ok", None);
        stale.last_transition_time =
            Time(Utc::now() - k8s_openapi::chrono::Duration::seconds(3600));
        conditions.push(stale.clone());

        set_condition(
            &mut conditions,
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_FALSE,
                REASON_DEPLOYMENTS_NOT_READY,
                "Waiting for deployments: a",
                None,
            ),
        );
        assert_ne!(conditions[0].last_transition_time, stale.last_transition_time);
        assert_eq!(conditions[0].status, CONDITION_FALSE);
    }

    #[test]
    fn mirrored_condition_gets_component_prefix() {
        let mut parent = Vec::new();
        let sub = new_condition(CONDITION_TYPE_READY, CONDITION_TRUE, "Ready", "ok", None);

        mirror_condition(&mut parent, "BuildService", &sub);
        let first = parent[0].last_transition_time.clone();
        assert_eq!(parent[0].type_, "BuildServiceReady");

        // Mirroring the same status again must be a no-op to observers.
        mirror_condition(&mut parent, "BuildService", &sub);
        assert_eq!(parent.len(), 1);
        assert_eq!(parent[0].last_transition_time, first);
    }
}
