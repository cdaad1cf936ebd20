//! Lease-based leader election.
//!
//! A single operator replica holds a `coordination.k8s.io/v1` Lease and
//! renews it periodically. Other replicas watch the lease and take over when
//! the holder stops renewing. Controllers only run while [`LeaderStatus`]
//! reports leadership.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Client,
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read lease {name:?}"))]
    ReadLease { source: kube::Error, name: String },

    #[snafu(display("failed to create lease {name:?}"))]
    CreateLease { source: kube::Error, name: String },

    #[snafu(display("failed to update lease {name:?}"))]
    UpdateLease { source: kube::Error, name: String },
}

/// Shared leadership flag, cheap to clone into controller tasks.
#[derive(Clone, Default)]
pub struct LeaderStatus(Arc<AtomicBool>);

impl LeaderStatus {
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Marks this replica as leader without running an election, for
    /// single-replica deployments.
    pub fn force_leader(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub holder_id: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
}

impl LeaderElectionConfig {
    fn desired_lease(&self, transitions: Option<i32>) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder_id.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: transitions,
                ..LeaseSpec::default()
            }),
        }
    }
}

/// Runs the acquire/renew loop forever. Leadership state is published
/// through `status`.
pub async fn run(client: Client, config: LeaderElectionConfig, status: LeaderStatus) {
    let api: Api<Lease> = Api::namespaced(client, &config.namespace);
    loop {
        match tick(&api, &config).await {
            Ok(leader) => {
                if leader != status.is_leader() {
                    if leader {
                        info!(holder = %config.holder_id, "acquired leadership");
                    } else {
                        warn!(holder = %config.holder_id, "lost leadership");
                    }
                }
                status.set(leader);
            }
            Err(err) => {
                // Keep the last known state; a transient API error must not
                // flap leadership.
                warn!(
                    error = &err as &dyn std::error::Error,
                    "leader election tick failed"
                );
            }
        }
        tokio::time::sleep(config.renew_interval).await;
    }
}

/// One election round: create the lease if absent, renew it if held by us,
/// take it over if expired.
async fn tick(api: &Api<Lease>, config: &LeaderElectionConfig) -> Result<bool, Error> {
    let existing = api
        .get_opt(&config.lease_name)
        .await
        .context(ReadLeaseSnafu {
            name: &config.lease_name,
        })?;

    let Some(lease) = existing else {
        api.create(
            &PostParams::default(),
            &config.desired_lease(next_transitions(None, false)),
        )
        .await
        .context(CreateLeaseSnafu {
            name: &config.lease_name,
        })?;
        return Ok(true);
    };

    let spec = lease.spec.clone().unwrap_or_default();
    let held_by_us = spec.holder_identity.as_deref() == Some(config.holder_id.as_str());
    let expired = lease_expired(&spec, Utc::now());

    if !held_by_us && !expired {
        debug!(
            holder = spec.holder_identity.as_deref().unwrap_or(""),
            "lease held by another replica"
        );
        return Ok(false);
    }

    let mut desired = config.desired_lease(next_transitions(Some(&spec), held_by_us));
    if held_by_us {
        // Renewal keeps the original acquire time.
        if let Some(desired_spec) = desired.spec.as_mut() {
            desired_spec.acquire_time = spec.acquire_time.clone();
        }
    }

    api.patch(
        &config.lease_name,
        &PatchParams::apply("konflux-operator-leader-election").force(),
        &Patch::Apply(&desired),
    )
    .await
    .context(UpdateLeaseSnafu {
        name: &config.lease_name,
    })?;
    Ok(true)
}

/// Transition counter for the next lease write: a fresh lease starts at 0,
/// renewals keep the current value, takeovers increment it.
fn next_transitions(existing: Option<&LeaseSpec>, held_by_us: bool) -> Option<i32> {
    match existing {
        None => Some(0),
        Some(spec) if held_by_us => spec.lease_transitions,
        Some(spec) => Some(spec.lease_transitions.unwrap_or(0) + 1),
    }
}

fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renewed) = &spec.renew_time else {
        return true;
    };
    let duration = spec.lease_duration_seconds.unwrap_or(0).max(0) as i64;
    now.signed_duration_since(renewed.0)
        .num_seconds()
        > duration
}
