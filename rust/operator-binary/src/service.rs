//! Headless service per node group (§4.2, §6): direct addressing for peer
//! discovery and client-side load balancing across a group's pods.

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec},
};

use crate::{
    crd::{ADMIN_PORT, ADMIN_PORT_NAME, TRANSPORT_PORT, TRANSPORT_PORT_NAME, v1alpha1},
    labels,
};

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

/// The headless service backing a node group's stateful group: no cluster
/// IP, `publishNotReadyAddresses` set so pods are addressable by stable DNS
/// name before they pass readiness, which the rolling-upgrade phase and
/// peer discovery both depend on.
pub fn build_group_headless_service(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    app_version: &str,
) -> Result<Service> {
    let labels = labels::group_labels(cluster, group_name, app_version).context(
        LabelBuildSnafu {
            group: group_name.to_string(),
        },
    )?;
    let selector_labels = labels::group_selector_labels(cluster, group_name).context(
        LabelBuildSnafu {
            group: group_name.to_string(),
        },
    )?;

    Ok(Service {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(cluster)
            .name(headless_service_name(cluster, group_name))
            .ownerreference_from_resource(cluster, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_labels(labels.into())
            .build(),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ports: Some(service_ports()),
            selector: Some(selector_labels.into()),
            publish_not_ready_addresses: Some(true),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

/// `<cluster>-<group>-headless`, the DNS name pods in `group_name` are
/// reachable under for peer transport traffic.
pub fn headless_service_name(cluster: &v1alpha1::SearchCluster, group_name: &str) -> String {
    format!(
        "{name}-headless",
        name = cluster.group_object_name(group_name)
    )
}

fn service_ports() -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some(TRANSPORT_PORT_NAME.to_string()),
            port: TRANSPORT_PORT,
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        },
        ServicePort {
            name: Some(ADMIN_PORT_NAME.to_string()),
            port: ADMIN_PORT,
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        },
    ]
}
