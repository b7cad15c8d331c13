//! Label construction shared by the planner, service, discovery and PDB
//! builders (§6 "Labels (mandatory)").

use snafu::{ResultExt, Snafu};
use stackable_operator::kvp::{Label, LabelError, Labels};

use crate::crd::{APP_NAME, FIELD_MANAGER_SCOPE, LABEL_ROLE_DATA, LABEL_ROLE_MASTER, OPERATOR_NAME, v1alpha1};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to build labels"))]
    Build { source: LabelError },
}

type Result<T, E = Error> = std::result::Result<T, E>;

const ROLE: &str = "node";

/// The full recommended + spec-mandated label set for every object belonging
/// to `group_name` (§6): Stackable's standard selector/ownership labels plus
/// the literal `role-master`/`role-data` flags this operator's own
/// invariants and the downscale/upgrade phases key off of.
pub fn group_labels(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    app_version: &str,
) -> Result<Labels> {
    let group = cluster.node_group(group_name).ok();
    let mut labels = Labels::recommended(stackable_operator::kvp::ObjectLabels {
        owner: cluster,
        app_name: APP_NAME,
        app_version,
        operator_name: OPERATOR_NAME,
        controller_name: FIELD_MANAGER_SCOPE,
        role: ROLE,
        role_group: group_name,
    })
    .context(BuildSnafu)?;
    labels.insert(
        Label::try_from((
            LABEL_ROLE_MASTER,
            group.map(|g| g.master_eligible).unwrap_or(false).to_string().as_str(),
        ))
        .context(BuildSnafu)?,
    );
    labels.insert(
        Label::try_from((
            LABEL_ROLE_DATA,
            group.map(|g| g.data).unwrap_or(false).to_string().as_str(),
        ))
        .context(BuildSnafu)?,
    );
    Ok(labels)
}

/// The subset of `group_labels` sufficient to select every pod of
/// `group_name`, for use in service/PDB selectors.
pub fn group_selector_labels(cluster: &v1alpha1::SearchCluster, group_name: &str) -> Result<Labels> {
    Labels::role_group_selector(cluster, APP_NAME, ROLE, group_name).context(BuildSnafu)
}
