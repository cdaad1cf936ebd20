//! The tracking client: server-side apply with ownership labels, plus
//! label-based cleanup of objects that fell out of the desired state.
//!
//! Every object applied in a reconcile pass is recorded as touched. After
//! the pass, `cleanup_orphans` lists all previously-owned objects of the
//! candidate kinds by the owner+component label pair and deletes those that
//! were not touched. Cluster-scoped kinds are only ever cleaned up when they
//! are on the explicit allow-list.

use std::collections::HashSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::{ApiResource, GroupVersionKind},
    Client, ResourceExt,
};
use serde_json::{json, Value};
use snafu::{OptionExt, Snafu};
use tracing::{debug, info, warn};

pub const OWNER_LABEL: &str = "konflux.dev/owner";
pub const COMPONENT_LABEL: &str = "konflux.dev/component";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const FIELD_MANAGER: &str = "konflux-operator";

/// API groups whose CRDs are optional add-ons. Apply and list failures for
/// these kinds are skippable when the group is not installed.
const OPTIONAL_API_GROUPS: &[&str] = &["cert-manager.io", "kyverno.io"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("manifest document has no metadata.name"))]
    DocumentWithoutName,

    #[snafu(display("failed to apply {kind} {name:?}"))]
    Apply {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to list {kind} objects for orphan cleanup"))]
    ListOwned { source: kube::Error, kind: String },

    #[snafu(display("failed to delete orphaned {kind} {name:?}"))]
    DeleteOrphan {
        source: kube::Error,
        kind: String,
        name: String,
    },
}

/// A kind the tracking client lists during orphan cleanup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TrackedKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub cluster_scoped: bool,
}

impl TrackedKind {
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(self.group, self.version, self.kind)
    }

    fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Identity of an applied object within one reconcile pass.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// The kind belongs to an optional API group whose CRD is not installed.
    SkippedMissingCrd,
}

pub struct TrackingClient {
    client: Client,
    owner_name: String,
    component: String,
    touched: HashSet<ObjectKey>,
}

impl TrackingClient {
    pub fn new(client: Client, owner_name: impl Into<String>, component: impl Into<String>) -> Self {
        TrackingClient {
            client,
            owner_name: owner_name.into(),
            component: component.into(),
            touched: HashSet::new(),
        }
    }

    /// Server-side applies `doc` with ownership labels and owner reference
    /// injected, and records it as touched for this pass. Idempotent:
    /// applying an unchanged document causes no further mutation.
    pub async fn apply_owned(
        &mut self,
        owner_ref: &OwnerReference,
        mut doc: Value,
    ) -> Result<ApplyOutcome, Error> {
        decorate_document(&mut doc, owner_ref, &self.owner_name, &self.component);
        let key = object_key(&doc)?;

        let (group, version) = split_api_version(&key.api_version);
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &key.kind));
        let api: Api<DynamicObject> = match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };

        let patch = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(&key.name, &patch, &Patch::Apply(&doc)).await {
            Ok(_) => {
                debug!(kind = %key.kind, name = %key.name, "applied object");
                self.touched.insert(key);
                Ok(ApplyOutcome::Applied)
            }
            Err(err) if is_missing_kind(&err) && is_optional_group(group) => {
                warn!(
                    kind = %key.kind,
                    name = %key.name,
                    group,
                    "skipping object, CRD for optional API group is not installed"
                );
                Ok(ApplyOutcome::SkippedMissingCrd)
            }
            Err(err) => Err(Error::Apply {
                source: err,
                kind: key.kind,
                name: key.name,
            }),
        }
    }

    /// Deletes previously-owned objects of the candidate kinds that were not
    /// touched in this pass. Returns the number of deleted objects.
    pub async fn cleanup_orphans(
        &self,
        kinds: &[TrackedKind],
        namespace: &str,
        cluster_allowlist: &[TrackedKind],
    ) -> Result<usize, Error> {
        let selector = format!(
            "{OWNER_LABEL}={},{COMPONENT_LABEL}={}",
            self.owner_name, self.component
        );
        let mut deleted = 0;

        for kind in cleanup_candidates(kinds, cluster_allowlist) {
            let ar = ApiResource::from_gvk(&kind.gvk());
            let api: Api<DynamicObject> = if kind.cluster_scoped {
                Api::all_with(self.client.clone(), &ar)
            } else {
                Api::namespaced_with(self.client.clone(), namespace, &ar)
            };

            let list = match api.list(&ListParams::default().labels(&selector)).await {
                Ok(list) => list,
                Err(err) if is_missing_kind(&err) && is_optional_group(kind.group) => {
                    debug!(kind = kind.kind, "skipping orphan cleanup, CRD not installed");
                    continue;
                }
                Err(err) => {
                    return Err(Error::ListOwned {
                        source: err,
                        kind: kind.kind.to_string(),
                    })
                }
            };

            for object in list {
                let key = ObjectKey {
                    api_version: kind.api_version(),
                    kind: kind.kind.to_string(),
                    namespace: object.namespace(),
                    name: object.name_any(),
                };
                if self.touched.contains(&key) {
                    continue;
                }
                info!(kind = kind.kind, name = %key.name, "deleting orphaned object");
                match api.delete(&key.name, &DeleteParams::default()).await {
                    Ok(_) => deleted += 1,
                    // Already gone, someone else was faster.
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(err) => {
                        return Err(Error::DeleteOrphan {
                            source: err,
                            kind: kind.kind.to_string(),
                            name: key.name,
                        })
                    }
                }
            }
        }
        Ok(deleted)
    }
}

/// Injects the ownership labels and the owner reference into `doc`.
fn decorate_document(doc: &mut Value, owner_ref: &OwnerReference, owner: &str, component: &str) {
    let labels = &mut doc["metadata"]["labels"];
    labels[OWNER_LABEL] = json!(owner);
    labels[COMPONENT_LABEL] = json!(component);
    labels[MANAGED_BY_LABEL] = json!(FIELD_MANAGER);
    doc["metadata"]["ownerReferences"] = json!([owner_ref]);
}

fn object_key(doc: &Value) -> Result<ObjectKey, Error> {
    Ok(ObjectKey {
        api_version: doc
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or("v1")
            .to_string(),
        kind: doc
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        namespace: doc
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string),
        name: doc
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context(DocumentWithoutNameSnafu)?,
    })
}

/// Candidate kinds for cleanup: namespaced kinds always, cluster-scoped
/// kinds only when allow-listed.
fn cleanup_candidates<'a>(
    kinds: &'a [TrackedKind],
    cluster_allowlist: &'a [TrackedKind],
) -> impl Iterator<Item = &'a TrackedKind> {
    kinds
        .iter()
        .filter(move |kind| !kind.cluster_scoped || cluster_allowlist.contains(kind))
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn is_optional_group(group: &str) -> bool {
    OPTIONAL_API_GROUPS.contains(&group)
}

/// A 404 on the resource collection means the kind itself is not served,
/// i.e. the CRD is not installed.
fn is_missing_kind(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
