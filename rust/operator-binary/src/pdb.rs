//! PodDisruptionBudget per node group (§10 supplemented feature 3): a small,
//! ambient safety net alongside the stateful-group/service/config bundle the
//! planner builds. Sized from the group's replica count, never from the
//! invariants in `crate::invariants` — voluntary-eviction budgeting and the
//! downscale/upgrade safety checks are deliberately kept independent.

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    builder::{meta::ObjectMetaBuilder, pdb::PodDisruptionBudgetBuilder},
    k8s_openapi::api::policy::v1::PodDisruptionBudget,
};

use crate::{crd::v1alpha1, labels};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },
    #[snafu(display("failed to build labels for group {group:?}"))]
    LabelBuild {
        source: crate::labels::Error,
        group: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One voluntary disruption allowed at a time, regardless of group size. A
/// single-replica group gets no budget at all: a `maxUnavailable` of zero
/// would simply block every voluntary eviction forever.
fn max_unavailable_for(replicas: i32) -> Option<u16> {
    if replicas > 1 { Some(1) } else { None }
}

/// Builds the PodDisruptionBudget for `group_name`, or `None` if the group
/// doesn't exist or its replica count is too small to budget one.
pub fn build_group_pdb(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
) -> Result<Option<PodDisruptionBudget>> {
    let Ok(group) = cluster.node_group(group_name) else {
        return Ok(None);
    };
    let Some(max_unavailable) = max_unavailable_for(group.replicas) else {
        return Ok(None);
    };

    let selector_labels = labels::group_selector_labels(cluster, group_name).context(
        LabelBuildSnafu {
            group: group_name.to_string(),
        },
    )?;

    let metadata = ObjectMetaBuilder::new()
        .name_and_namespace(cluster)
        .name(cluster.group_object_name(group_name))
        .ownerreference_from_resource(cluster, None, Some(true))
        .context(ObjectMissingMetadataForOwnerRefSnafu)?
        .with_labels(selector_labels.clone().into())
        .build();

    let pdb = PodDisruptionBudgetBuilder::new()
        .new_with_metadata(metadata)
        .with_selector(LabelSelector {
            match_expressions: None,
            match_labels: Some(selector_labels.into()),
        })
        .with_max_unavailable(max_unavailable)
        .build();

    Ok(Some(pdb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_replica_group_gets_no_budget() {
        assert_eq!(max_unavailable_for(1), None);
        assert_eq!(max_unavailable_for(0), None);
    }

    #[test]
    fn multi_replica_group_gets_one_voluntary_disruption() {
        assert_eq!(max_unavailable_for(2), Some(1));
        assert_eq!(max_unavailable_for(5), Some(1));
    }
}
