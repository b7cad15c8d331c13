//! Admin-endpoint discovery (§4.10): one ConfigMap per cluster advertising
//! the fully-qualified admin-endpoint address(es), hashed into
//! `status.discovery_hash` via an `FnvHasher` over the ConfigMap's own
//! resource version.

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::{configmap::ConfigMapBuilder, meta::ObjectMetaBuilder},
    k8s_openapi::api::core::v1::ConfigMap,
    kube::ResourceExt,
};

use crate::{
    crd::{ADMIN_PORT, v1alpha1},
    labels, service,
};

pub const DISCOVERY_KEY_ADMIN_ADDRESSES: &str = "ADMIN_ADDRESSES";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },
    #[snafu(display("failed to build discovery labels"))]
    LabelBuild { source: crate::labels::Error },
    #[snafu(display("failed to build discovery config map"))]
    BuildConfigMap {
        source: stackable_operator::builder::configmap::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// `<cluster>-admin-discovery`, the ConfigMap clients read to find the
/// cluster's administrative endpoint.
pub fn discovery_configmap_name(cluster: &v1alpha1::SearchCluster) -> String {
    format!("{name}-admin-discovery", name = cluster.name_any())
}

/// One admin-endpoint address per master-eligible group (every group, if
/// none is master-eligible), each the group's own headless-service DNS name
/// plus the admin port.
pub fn build_discovery_configmap(
    cluster: &v1alpha1::SearchCluster,
    app_version: &str,
) -> Result<ConfigMap> {
    let masters: Vec<_> = cluster.master_eligible_groups().collect();
    let target_groups: Vec<&v1alpha1::NodeGroupSpec> = if masters.is_empty() {
        cluster.spec.node_groups.iter().collect()
    } else {
        masters
    };

    let addresses = target_groups
        .iter()
        .map(|group| {
            format!(
                "{host}:{port}",
                host = service::headless_service_name(cluster, &group.name),
                port = ADMIN_PORT
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    let object_labels =
        labels::group_labels(cluster, "discovery", app_version).context(LabelBuildSnafu)?;

    ConfigMapBuilder::new()
        .metadata(
            ObjectMetaBuilder::new()
                .name_and_namespace(cluster)
                .name(discovery_configmap_name(cluster))
                .ownerreference_from_resource(cluster, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?
                .with_labels(object_labels.into())
                .build(),
        )
        .add_data(DISCOVERY_KEY_ADMIN_ADDRESSES, addresses)
        .build()
        .context(BuildConfigMapSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_configmap_name_is_suffixed() {
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
                  replicas: 3
        "#})
        .unwrap();
        assert_eq!(
            discovery_configmap_name(&cluster),
            "my-search-admin-discovery"
        );
    }
}
