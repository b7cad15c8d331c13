//! Phase 2 — downscale (§4.4): migrates shard data off leaving nodes before
//! ever removing a pod, keyed off the cluster's own routing table, and keeps
//! the coordination settings (voting-config exclusions / minimum-master-nodes)
//! in step with whichever masters are actually leaving.

use std::collections::HashSet;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::apps::v1::StatefulSet,
    kube::{Resource, ResourceExt},
};

use crate::{
    admin_client::AdminClient,
    crd::{FIELD_MANAGER_SCOPE, v1alpha1},
    expectations::{self, ExpectationsStore},
    invariants::{DownscaleInvariants, GroupDownscale},
    observer::ObservedState,
    planner::ExpectedGroup,
    reconcile_result::{RequeueDecision, StepOutcome},
    version::VersionFamily,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read existing stateful group {group:?}"))]
    GetStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to query the cluster admin API"))]
    Admin { source: crate::admin_client::Error },
    #[snafu(display("failed to apply stateful group {group:?}"))]
    ApplyStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to delete stateful group {group:?}"))]
    DeleteStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One group's observed current size and the target size the downscale
/// intends to reach, as described in §4.4 step 1.
struct IntendedDownscale {
    group_name: String,
    master_eligible: bool,
    initial_replicas: i32,
    target_replicas: i32,
    existing: Option<StatefulSet>,
}

/// Runs one downscale pass across every group, leaving-node exclusion,
/// invariant enforcement, and coordination-settings update. A single
/// `StepOutcome` is returned for the whole phase since a genuine error
/// (an unreachable admin API, a failed apply) aborts the rest of the pass;
/// an invariant violation on one group's own step never does — it only
/// skips that group for this pass, with a requeue.
pub async fn run(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    expectations: &ExpectationsStore,
    admin: &dyn AdminClient,
    observed: &ObservedState,
    version_family: VersionFamily,
    expected: &[ExpectedGroup],
) -> StepOutcome<Error> {
    match run_inner(client, cluster, expectations, admin, observed, version_family, expected).await
    {
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
    version_family: VersionFamily,
    expected: &[ExpectedGroup],
) -> Result<RequeueDecision> {
    let cluster_key = expectations::cluster_key(cluster);
    let namespace = cluster.namespace_or_err().ok();

    let mut intended = Vec::with_capacity(cluster.spec.node_groups.len());
    for group in &cluster.spec.node_groups {
        let existing = client
            .get_opt::<StatefulSet>(&cluster.group_object_name(&group.name), namespace.as_deref())
            .await
            .context(GetStatefulSetSnafu {
                group: group.name.clone(),
            })?;
        let initial_replicas = existing
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        intended.push(IntendedDownscale {
            group_name: group.name.clone(),
            master_eligible: group.master_eligible,
            initial_replicas,
            target_replicas: group.replicas,
            existing,
        });
    }
    // Groups no longer declared in the spec at all are scaled all the way to
    // zero and then deleted here, never by phase 1 (§4.4).
    for orphan in orphaned_groups(client, cluster, &intended).await? {
        intended.push(orphan);
    }
    debug_assert!(
        expected
            .iter()
            .all(|g| intended.iter().any(|i| i.group_name == g.name))
    );

    // Each group's own proposed step is checked against the cluster-wide
    // invariants independently, in declaration order, committing approved
    // steps as we go. A violation skips only the offending group for this
    // pass (with a requeue) rather than failing the whole phase (§4.4, §7).
    let mut committed: Vec<GroupDownscale> = intended
        .iter()
        .map(|g| GroupDownscale {
            master_eligible: g.master_eligible,
            current_replicas: g.initial_replicas,
            intended_replicas: g.initial_replicas,
        })
        .collect();
    let mut allowed_groups: HashSet<String> = HashSet::new();
    let mut any_skipped = false;
    for (index, group) in intended.iter().enumerate() {
        if group.initial_replicas <= group.target_replicas {
            continue;
        }
        let mut candidate = committed.clone();
        candidate[index].intended_replicas =
            one_step_toward_target(group.initial_replicas, group.target_replicas);
        if DownscaleInvariants::check(&candidate).is_ok() {
            committed = candidate;
            allowed_groups.insert(group.group_name.clone());
        } else {
            any_skipped = true;
        }
    }

    let leaving_names = leaving_node_names(cluster, &intended, &allowed_groups);
    if leaving_names.is_empty() {
        return Ok(if any_skipped {
            RequeueDecision::RequeueAfter(std::time::Duration::from_secs(20))
        } else {
            RequeueDecision::NoRequeue
        });
    }

    let nonce = leaving_names.len() as u64;
    admin
        .set_allocation_exclude(&leaving_names, nonce)
        .await
        .context(AdminSnafu)?;

    // New-protocol clusters keep the voting configuration in step with
    // whichever masters are actually leaving, ahead of the replica
    // decrement below (§4.4 step 4); old-protocol clusters instead rely on
    // `minimum_master_nodes`, synced further down once counts have settled.
    if version_family.uses_voting_config_exclusions() {
        let leaving_master_names = leaving_master_node_names(cluster, &intended, &allowed_groups);
        if leaving_master_names.is_empty() {
            admin.clear_voting_config_exclusions().await.context(AdminSnafu)?;
        } else {
            admin
                .add_voting_config_exclusions(&leaving_master_names)
                .await
                .context(AdminSnafu)?;
        }
    }

    let routing_table = observed.routing_table().await.context(AdminSnafu)?;
    let mut any_removed = false;
    for group in &mut intended {
        if group.initial_replicas <= group.target_replicas {
            continue;
        }
        if !allowed_groups.contains(&group.group_name) {
            continue;
        }
        let Some(existing) = &group.existing else {
            continue;
        };
        let leaving_ordinal = group.initial_replicas - 1;
        let leaving_pod = format!(
            "{name}-{ordinal}",
            name = cluster.group_object_name(&group.group_name),
            ordinal = leaving_ordinal
        );
        let migration_done = routing_table
            .keys_on_node(&leaving_pod)
            .iter()
            .all(|(index, shard)| {
                routing_table.has_started_copy_outside(index, *shard, &[leaving_pod.clone()])
            });
        if !migration_done {
            continue;
        }

        let mut to_apply = existing.clone();
        if let Some(spec) = to_apply.spec.as_mut() {
            spec.replicas = Some(group.initial_replicas - 1);
        }
        let applied = client
            .apply_patch(FIELD_MANAGER_SCOPE, &to_apply, &to_apply)
            .await
            .context(ApplyStatefulSetSnafu {
                group: group.group_name.clone(),
            })?;
        if let Some(meta) = expectations::ObjectMeta::from_resource(&applied) {
            expectations.expect_generation(&cluster_key, &meta);
        }
        group.initial_replicas -= 1;
        any_removed = true;

        if group.initial_replicas == 0 && group.target_replicas == 0 {
            client
                .delete::<StatefulSet>(&to_apply.name_any(), namespace.as_deref())
                .await
                .context(DeleteStatefulSetSnafu {
                    group: group.group_name.clone(),
                })?;
        }
    }

    sync_minimum_master_nodes(&intended, admin, version_family).await?;

    let remaining_leavers = leaving_node_names(cluster, &intended, &allowed_groups);
    if remaining_leavers.is_empty() {
        // `set_allocation_exclude` maps an empty slice to the sentinel value
        // that clears the exclude list on the cluster side.
        admin
            .set_allocation_exclude(&[], nonce + 1)
            .await
            .context(AdminSnafu)?;
        Ok(RequeueDecision::NoRequeue)
    } else if any_removed {
        Ok(RequeueDecision::RequeueNow)
    } else {
        // No migration progress this pass; back off instead of hot-looping.
        Ok(RequeueDecision::RequeueAfter(std::time::Duration::from_secs(20)))
    }
}

/// This pass only ever removes one pod per group toward its target, so the
/// invariant check sees `initial - 1` (clamped at `target`) rather than
/// jumping straight to the final target.
fn one_step_toward_target(initial_replicas: i32, target_replicas: i32) -> i32 {
    if initial_replicas > target_replicas {
        (initial_replicas - 1).max(target_replicas)
    } else {
        target_replicas
    }
}

/// Stateful groups that still exist on the server but whose node group has
/// been removed from the spec entirely; these are downscaled to zero and
/// then deleted exactly like any other over-target group.
async fn orphaned_groups(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    known: &[IntendedDownscale],
) -> Result<Vec<IntendedDownscale>> {
    let namespace = cluster.namespace_or_err().ok();

    let all: Vec<StatefulSet> = client
        .list::<StatefulSet>(namespace.as_deref(), &Default::default())
        .await
        .context(GetStatefulSetSnafu {
            group: "*".to_string(),
        })?;

    let mut orphans = Vec::new();
    for stateful_set in all {
        let owned_by_cluster = stateful_set
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.uid == cluster.meta().uid.clone().unwrap_or_default()));
        if !owned_by_cluster {
            continue;
        }
        let Some(group_name) = stateful_set
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(crate::crd::LABEL_GROUP_NAME))
        else {
            continue;
        };
        if known.iter().any(|g| &g.group_name == group_name) {
            continue;
        }
        let master_eligible = stateful_set
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(crate::crd::LABEL_ROLE_MASTER))
            .is_some_and(|value| value == "true");
        let initial_replicas = stateful_set
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        orphans.push(IntendedDownscale {
            group_name: group_name.clone(),
            master_eligible,
            initial_replicas,
            target_replicas: 0,
            existing: Some(stateful_set),
        });
    }
    Ok(orphans)
}

/// The union of every node name that would leave the cluster across the
/// given groups — highest ordinals first within each group, then grouped in
/// declaration order — restricted to groups whose downscale step is allowed
/// this pass. Each over-target group contributes every ordinal from
/// `target_replicas` up to (but not including) `initial_replicas`, not just
/// the next one to actually be removed, so migration can proceed for the
/// whole eventual range while pods are still only ever removed one at a
/// time (§4.4 step 2).
fn leaving_node_names(
    cluster: &v1alpha1::SearchCluster,
    intended: &[IntendedDownscale],
    allowed: &HashSet<String>,
) -> Vec<String> {
    leaving_node_names_where(cluster, intended, allowed, |_| true)
}

/// As [`leaving_node_names`], restricted to master-eligible groups.
fn leaving_master_node_names(
    cluster: &v1alpha1::SearchCluster,
    intended: &[IntendedDownscale],
    allowed: &HashSet<String>,
) -> Vec<String> {
    leaving_node_names_where(cluster, intended, allowed, |g| g.master_eligible)
}

fn leaving_node_names_where(
    cluster: &v1alpha1::SearchCluster,
    intended: &[IntendedDownscale],
    allowed: &HashSet<String>,
    predicate: impl Fn(&IntendedDownscale) -> bool,
) -> Vec<String> {
    intended
        .iter()
        .filter(|g| {
            g.initial_replicas > g.target_replicas
                && allowed.contains(&g.group_name)
                && predicate(g)
        })
        .flat_map(|g| {
            let name = cluster.group_object_name(&g.group_name);
            (g.target_replicas..g.initial_replicas)
                .rev()
                .map(move |ordinal| format!("{name}-{ordinal}"))
        })
        .collect()
}

/// Old-protocol clusters need `minimum_master_nodes` kept at
/// `floor(masters / 2) + 1` as masters come and go; new-protocol clusters
/// instead rely on voting-config exclusions, already synced above ahead of
/// the replica decrement.
async fn sync_minimum_master_nodes(
    intended: &[IntendedDownscale],
    admin: &dyn AdminClient,
    version_family: VersionFamily,
) -> Result<()> {
    if !version_family.uses_minimum_master_nodes() {
        return Ok(());
    }
    let remaining_masters: i32 = intended
        .iter()
        .filter(|g| g.master_eligible)
        .map(|g| g.initial_replicas.min(g.target_replicas.max(g.initial_replicas - 1)))
        .sum();
    if remaining_masters < 1 {
        return Ok(());
    }
    let minimum = (remaining_masters / 2 + 1).max(1) as u32;
    admin
        .set_minimum_master_nodes(minimum)
        .await
        .context(AdminSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaving_names_only_include_groups_above_target() {
        let cluster: v1alpha1::SearchCluster = serde_yaml::from_str(indoc::indoc! {r#"
            apiVersion: search.stackable.tech/v1alpha1
            kind: SearchCluster
            metadata:
              name: my-search
              namespace: default
            spec:
              version: "7.2.0"
              nodeGroups:
                - name: data
                  data: true
                  replicas: 2
        "#})
        .unwrap();
        let intended = vec![
            IntendedDownscale {
                group_name: "data".to_string(),
                master_eligible: false,
                initial_replicas: 3,
                target_replicas: 2,
                existing: None,
            },
            IntendedDownscale {
                group_name: "masters".to_string(),
                master_eligible: true,
                initial_replicas: 3,
                target_replicas: 3,
                existing: None,
            },
        ];
        let allowed: HashSet<String> = ["data".to_string()].into_iter().collect();
        let leaving = leaving_node_names(&cluster, &intended, &allowed);
        assert_eq!(leaving, vec!["my-search-data-2".to_string()]);
    }

    #[test]
    fn leaving_names_cover_the_full_range_down_to_target() {
        // Scenario B: masters=3/data=4->2 must exclude data-3 and data-2 on
        // the very first pass, not just the topmost ordinal.
        let cluster: v1alpha1::SearchCluster = serde_yaml::from_str(indoc::indoc! {r#"
            apiVersion: search.stackable.tech/v1alpha1
            kind: SearchCluster
            metadata:
              name: my-search
              namespace: default
            spec:
              version: "7.2.0"
              nodeGroups:
                - name: data
                  data: true
                  replicas: 2
        "#})
        .unwrap();
        let intended = vec![IntendedDownscale {
            group_name: "data".to_string(),
            master_eligible: false,
            initial_replicas: 4,
            target_replicas: 2,
            existing: None,
        }];
        let allowed: HashSet<String> = ["data".to_string()].into_iter().collect();
        let leaving = leaving_node_names(&cluster, &intended, &allowed);
        assert_eq!(
            leaving,
            vec!["my-search-data-3".to_string(), "my-search-data-2".to_string()]
        );
    }

    #[test]
    fn leaving_names_exclude_groups_not_in_the_allowed_set() {
        let cluster: v1alpha1::SearchCluster = serde_yaml::from_str(indoc::indoc! {r#"
            apiVersion: search.stackable.tech/v1alpha1
            kind: SearchCluster
            metadata:
              name: my-search
              namespace: default
            spec:
              version: "7.2.0"
              nodeGroups:
                - name: masters
                  masterEligible: true
                  replicas: 1
        "#})
        .unwrap();
        let intended = vec![IntendedDownscale {
            group_name: "masters".to_string(),
            master_eligible: true,
            initial_replicas: 1,
            target_replicas: 0,
            existing: None,
        }];
        // The group's own downscale step was refused by the invariant check
        // (would remove the last master), so it never makes the allowed set.
        let allowed: HashSet<String> = HashSet::new();
        let leaving = leaving_node_names(&cluster, &intended, &allowed);
        assert!(leaving.is_empty());
    }

    #[test]
    fn per_group_invariant_check_does_not_block_other_groups() {
        // A masters group whose own step would remove the last master is
        // skipped, but a data group's legitimate downscale in the same pass
        // is still allowed.
        let groups = vec![
            IntendedDownscale {
                group_name: "masters".to_string(),
                master_eligible: true,
                initial_replicas: 1,
                target_replicas: 0,
                existing: None,
            },
            IntendedDownscale {
                group_name: "data".to_string(),
                master_eligible: false,
                initial_replicas: 3,
                target_replicas: 2,
                existing: None,
            },
        ];
        let mut committed: Vec<GroupDownscale> = groups
            .iter()
            .map(|g| GroupDownscale {
                master_eligible: g.master_eligible,
                current_replicas: g.initial_replicas,
                intended_replicas: g.initial_replicas,
            })
            .collect();
        let mut allowed_groups: HashSet<String> = HashSet::new();
        for (index, group) in groups.iter().enumerate() {
            let mut candidate = committed.clone();
            candidate[index].intended_replicas =
                one_step_toward_target(group.initial_replicas, group.target_replicas);
            if DownscaleInvariants::check(&candidate).is_ok() {
                committed = candidate;
                allowed_groups.insert(group.group_name.clone());
            }
        }
        assert!(!allowed_groups.contains("masters"));
        assert!(allowed_groups.contains("data"));
    }

    #[test]
    fn minimum_master_nodes_is_majority_of_remaining() {
        let intended = vec![IntendedDownscale {
            group_name: "masters".to_string(),
            master_eligible: true,
            initial_replicas: 3,
            target_replicas: 2,
            existing: None,
        }];
        let remaining: i32 = intended
            .iter()
            .filter(|g| g.master_eligible)
            .map(|g| g.initial_replicas.min(g.target_replicas.max(g.initial_replicas - 1)))
            .sum();
        assert_eq!(remaining, 2);
        assert_eq!((remaining / 2 + 1).max(1), 2);
    }
}
