//! Phase 1 — upscale / spec-apply (§4.3): applies the expected service,
//! config and stateful-group objects for every declared node group. Never
//! shrinks a group's replica count and never deletes a group that has been
//! removed from the spec — both belong to phase 2.

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::{apps::v1::StatefulSet, core::v1::ConfigMap},
    kube::ResourceExt,
};

use crate::{
    crd::{FIELD_MANAGER_SCOPE, LABEL_CONTENT_HASH, v1alpha1},
    expectations::{self, ExpectationsStore},
    planner::ExpectedGroup,
    reconcile_result::{RequeueDecision, StepOutcome},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read existing stateful group {group:?}"))]
    GetStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to apply headless service for group {group:?}"))]
    ApplyService {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to apply config map for group {group:?}"))]
    ApplyConfigMap {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to apply stateful group {group:?}"))]
    ApplyStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Applies every expected group, clamping replicas upward-only against
/// whatever is actually on the server right now. Returns one outcome per
/// group so the orchestrator can aggregate them (§4.9).
pub async fn apply_expected_groups(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    expectations: &ExpectationsStore,
    expected: &[ExpectedGroup],
) -> Vec<StepOutcome<Error>> {
    let cluster_key = expectations::cluster_key(cluster);
    let mut outcomes = Vec::with_capacity(expected.len());
    for group in expected {
        outcomes.push(apply_one_group(client, cluster, &cluster_key, expectations, group).await);
    }
    outcomes
}

async fn apply_one_group(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    cluster_key: &str,
    expectations: &ExpectationsStore,
    group: &ExpectedGroup,
) -> StepOutcome<Error> {
    match apply_one_group_inner(client, cluster, cluster_key, expectations, group).await {
        Ok(()) => StepOutcome::ok(RequeueDecision::NoRequeue),
        Err(error) => StepOutcome::err(RequeueDecision::RequeueNow, error),
    }
}

async fn apply_one_group_inner(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    cluster_key: &str,
    expectations: &ExpectationsStore,
    group: &ExpectedGroup,
) -> Result<()> {
    let namespace = cluster.namespace_or_err().ok();

    // §4.3 reconcile order: config, then the headless service, then the
    // stateful group itself.
    apply_config_and_service(client, cluster_key, expectations, group).await?;

    let existing = client
        .get_opt::<StatefulSet>(&group.stateful_set.name_any(), namespace.as_deref())
        .await
        .context(GetStatefulSetSnafu {
            group: group.name.clone(),
        })?;

    let mut to_apply = group.stateful_set.clone();
    if let Some(existing) = &existing {
        let actual_replicas = existing
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(0);
        let expected_replicas = to_apply.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
        // A downscale is only ever carried out by phase 2, one pod at a
        // time, under the invariants in `crate::invariants`. Phase 1 must
        // not race it by shrinking the object itself.
        if actual_replicas > expected_replicas {
            if let Some(spec) = to_apply.spec.as_mut() {
                spec.replicas = Some(actual_replicas);
            }
        }

        let unchanged = existing
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_CONTENT_HASH))
            == to_apply
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_CONTENT_HASH))
            && actual_replicas >= expected_replicas;
        if unchanged {
            return Ok(());
        }
    }

    let applied = client
        .apply_patch(FIELD_MANAGER_SCOPE, &to_apply, &to_apply)
        .await
        .context(ApplyStatefulSetSnafu {
            group: group.name.clone(),
        })?;
    if let Some(meta) = expectations::ObjectMeta::from_resource(&applied) {
        expectations.expect_generation(cluster_key, &meta);
    }

    Ok(())
}

async fn apply_config_and_service(
    client: &Client,
    cluster_key: &str,
    expectations: &ExpectationsStore,
    group: &ExpectedGroup,
) -> Result<()> {
    let applied_config: ConfigMap = client
        .apply_patch(FIELD_MANAGER_SCOPE, &group.config_map, &group.config_map)
        .await
        .context(ApplyConfigMapSnafu {
            group: group.name.clone(),
        })?;
    if let Some(meta) = expectations::ObjectMeta::from_resource(&applied_config) {
        expectations.expect_generation(cluster_key, &meta);
    }

    let applied_service = client
        .apply_patch(FIELD_MANAGER_SCOPE, &group.service, &group.service)
        .await
        .context(ApplyServiceSnafu {
            group: group.name.clone(),
        })?;
    if let Some(meta) = expectations::ObjectMeta::from_resource(&applied_service) {
        expectations.expect_generation(cluster_key, &meta);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};

    fn stateful_set_with_replicas(replicas: i32) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn clamp_keeps_actual_replicas_when_higher_than_expected() {
        let actual = stateful_set_with_replicas(5);
        let mut expected = stateful_set_with_replicas(3);
        let actual_replicas = actual.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let expected_replicas = expected.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        if actual_replicas > expected_replicas {
            expected.spec.as_mut().unwrap().replicas = Some(actual_replicas);
        }
        assert_eq!(expected.spec.unwrap().replicas, Some(5));
    }
}
