//! Phase 3 — rolling upgrade (§4.5): decrements each group's update
//! partition one pod at a time, gated on cluster health, cluster membership
//! and a single-pod (single-master) concurrency cap across the whole
//! cluster.

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod},
};

use crate::{
    admin_client::AdminClient,
    crd::{FIELD_MANAGER_SCOPE, v1alpha1},
    expectations::{self, ExpectationsStore},
    invariants::DownscaleInvariants,
    observer::ObservedState,
    reconcile_result::{RequeueDecision, StepOutcome},
};

/// The well-known label the orchestrator's own grouped controller writes on
/// every pod it owns, naming the `ControllerRevision` the pod was created
/// from. Used, not duplicated, by the pod-readiness contract in §4.5.
const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read stateful group {group:?}"))]
    GetStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to read pod {pod:?}"))]
    GetPod {
        source: stackable_operator::client::Error,
        pod: String,
    },
    #[snafu(display("failed to query the cluster admin API"))]
    Admin { source: crate::admin_client::Error },
    #[snafu(display("failed to apply stateful group {group:?}"))]
    ApplyStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One ordinal's upgrade status, as decided by the pod-readiness contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OrdinalState {
    /// On the update revision, ready, and a cluster member.
    Done,
    /// Not yet upgraded, or upgraded but not yet ready/joined.
    Pending,
}

/// Runs one rolling-upgrade pass across every declared group, in spec order,
/// under the single-pod-in-flight concurrency cap (§4.5, §4.6).
pub async fn run(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    expectations: &ExpectationsStore,
    admin: &dyn AdminClient,
    observed: &ObservedState,
) -> StepOutcome<Error> {
    match run_inner(client, cluster, expectations, admin, observed).await {
        Ok(decision) => StepOutcome::ok(decision),
        Err(error) => StepOutcome::err(RequeueDecision::RequeueNow, error),
    }
}

async fn run_inner(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    expectations: &ExpectationsStore,
    admin: &dyn AdminClient,
    observed: &ObservedState,
) -> Result<RequeueDecision> {
    let cluster_key = expectations::cluster_key(cluster);
    let namespace = cluster.namespace_or_err().ok();

    let mut upgrading_pods_in_flight = 0usize;
    let mut master_upgrade_in_flight = false;
    let mut every_scheduled_upgrade_done = true;
    let mut done_pod_names: Vec<String> = Vec::new();
    let mut decision = RequeueDecision::NoRequeue;

    for group in &cluster.spec.node_groups {
        let object_name = cluster.group_object_name(&group.name);
        let Some(stateful_set) = client
            .get_opt::<StatefulSet>(&object_name, namespace.as_deref())
            .await
            .context(GetStatefulSetSnafu {
                group: group.name.clone(),
            })?
        else {
            continue;
        };

        let update_revision = stateful_set
            .status
            .as_ref()
            .and_then(|status| status.update_revision.clone());
        let current_partition = stateful_set
            .spec
            .as_ref()
            .and_then(|spec| spec.update_strategy.as_ref())
            .and_then(|strategy| strategy.rolling_update.as_ref())
            .and_then(|rolling_update| rolling_update.partition)
            .unwrap_or(group.replicas);

        let mut new_partition = current_partition;
        for ordinal in (0..current_partition).rev() {
            let pod_name = format!("{object_name}-{ordinal}");
            let state = ordinal_state(
                client,
                namespace.as_deref(),
                &pod_name,
                update_revision.as_deref(),
                observed,
            )
            .await?;

            if state == OrdinalState::Done {
                done_pod_names.push(pod_name);
                continue;
            }

            every_scheduled_upgrade_done = false;

            if upgrading_pods_in_flight >= 1 || (group.master_eligible && master_upgrade_in_flight)
            {
                decision = decision.most_specific(RequeueDecision::RequeueNow);
                break;
            }
            upgrading_pods_in_flight += 1;
            if group.master_eligible {
                master_upgrade_in_flight = true;
            }

            if new_partition <= ordinal {
                // Already decremented to (or past) this ordinal; the
                // rotation is in flight on the controller side.
                break;
            }

            if !observed.green_health().await.context(AdminSnafu)? {
                decision = decision.most_specific(RequeueDecision::RequeueNow);
                break;
            }

            if observed.shard_allocations_enabled().await.context(AdminSnafu)? {
                admin
                    .set_shard_allocation_enabled(false)
                    .await
                    .context(AdminSnafu)?;
            }
            let _ = admin.synced_flush().await;

            // `ordinal < new_partition` here by construction (the loop only
            // reaches this point after the `new_partition <= ordinal` guard
            // above), so the decrement is always monotonic.
            new_partition = ordinal;
            break;
        }

        if new_partition != current_partition {
            let mut to_apply = stateful_set.clone();
            if let Some(spec) = to_apply.spec.as_mut() {
                if let Some(strategy) = spec.update_strategy.as_mut() {
                    if let Some(rolling_update) = strategy.rolling_update.as_mut() {
                        rolling_update.partition = Some(new_partition);
                    }
                }
            }
            let applied = client
                .apply_patch(FIELD_MANAGER_SCOPE, &to_apply, &to_apply)
                .await
                .context(ApplyStatefulSetSnafu {
                    group: group.name.clone(),
                })?;
            if let Some(meta) = expectations::ObjectMeta::from_resource(&applied) {
                expectations.expect_generation(&cluster_key, &meta);
            }
            decision = decision.most_specific(RequeueDecision::RequeueNow);
        }
    }

    if every_scheduled_upgrade_done {
        let all_joined = observed
            .nodes_in_cluster(&done_pod_names)
            .await
            .context(AdminSnafu)?;
        if all_joined && expectations.fulfilled(&cluster_key) {
            if observed.shard_allocations_enabled().await.context(AdminSnafu)? {
                // already enabled, nothing to do
            } else {
                admin
                    .set_shard_allocation_enabled(true)
                    .await
                    .context(AdminSnafu)?;
            }
        } else {
            decision = decision.most_specific(RequeueDecision::RequeueAfter(
                std::time::Duration::from_secs(10),
            ));
        }
    }

    Ok(decision)
}

/// The pod-readiness contract from §4.5: ready condition true, not being
/// deleted, and its revision label matches the group's update revision.
async fn ordinal_state(
    client: &Client,
    namespace: Option<&str>,
    pod_name: &str,
    update_revision: Option<&str>,
    observed: &ObservedState,
) -> Result<OrdinalState> {
    let Some(pod) = client
        .get_opt::<Pod>(pod_name, namespace)
        .await
        .context(GetPodSnafu {
            pod: pod_name.to_string(),
        })?
    else {
        return Ok(OrdinalState::Pending);
    };

    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(OrdinalState::Pending);
    }

    let on_update_revision = match update_revision {
        Some(expected) => pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CONTROLLER_REVISION_HASH_LABEL))
            .is_some_and(|actual| actual == expected),
        None => false,
    };
    if !on_update_revision {
        return Ok(OrdinalState::Pending);
    }

    let ready = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        });
    if !ready {
        return Ok(OrdinalState::Pending);
    }

    let is_member = observed
        .nodes_in_cluster(&[pod_name.to_string()])
        .await
        .context(AdminSnafu)?;
    Ok(if is_member {
        OrdinalState::Done
    } else {
        OrdinalState::Pending
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_iteration_runs_high_to_low() {
        let partition = 3;
        let ordinals: Vec<i32> = (0..partition).rev().collect();
        assert_eq!(ordinals, vec![2, 1, 0]);
    }

    #[test]
    fn partition_monotonic_guard_rejects_increase() {
        assert!(DownscaleInvariants::partition_is_monotonic(1, 2).is_err());
        assert!(DownscaleInvariants::partition_is_monotonic(2, 1).is_ok());
    }
}
