//! Expected-resources planner (§4.2): a pure function of the spec, producing
//! one stateful-group descriptor, one headless service, and one config
//! object per declared node group, parameterized by the cluster's
//! coordination-protocol version family.

use std::collections::{BTreeMap, HashSet};

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::{configmap::ConfigMapBuilder, meta::ObjectMetaBuilder, pod::container::ContainerBuilder},
    k8s_openapi::{
        api::{
            apps::v1::{
                RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec,
                StatefulSetUpdateStrategy,
            },
            core::v1::{
                Affinity, ConfigMap, ConfigMapVolumeSource, ContainerPort, EnvVar,
                PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
                Probe, ResourceRequirements, TCPSocketAction, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::{
            api::resource::Quantity,
            apis::meta::v1::LabelSelector,
            util::intstr::IntOrString,
        },
    },
    kube::ResourceExt,
    kvp::Labels,
};

use crate::{
    crd::{
        ADMIN_PORT, ADMIN_PORT_NAME, DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_LIMIT,
        LABEL_CONTENT_HASH, SEARCH_CONFIG_FILE, STACKABLE_CONFIG_DIR, STACKABLE_CONFIG_DIR_NAME,
        STACKABLE_DATA_DIR, STACKABLE_DATA_DIR_NAME, STACKABLE_LOG_CONFIG_MOUNT_DIR,
        STACKABLE_LOG_CONFIG_MOUNT_DIR_NAME, STACKABLE_LOG_DIR, STACKABLE_LOG_DIR_NAME,
        TRANSPORT_PORT, TRANSPORT_PORT_NAME, v1alpha1,
    },
    labels,
    product_logging::{self, extend_group_config_map},
    service,
    version::VersionFamily,
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
    #[snafu(display("failed to build config map for group {group:?}"))]
    ConfigMapBuild {
        source: stackable_operator::builder::configmap::Error,
        group: String,
    },
    #[snafu(display("failed to extend config map with logging config for group {group:?}"))]
    LoggingConfig {
        source: crate::product_logging::Error,
        group: String,
    },
    #[snafu(display("failed to build headless service for group {group:?}"))]
    ServiceBuild {
        source: crate::service::Error,
        group: String,
    },
    #[snafu(display("duplicate volume claim template name {name:?} in group {group:?}"))]
    DuplicateVolumeClaimTemplate { name: String, group: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

const MAIN_CONTAINER_NAME: &str = "search";

/// The full set of objects this operator authors for one node group (§3
/// "Expected resources bundle"), rebuilt fresh every reconcile.
pub struct ExpectedGroup {
    pub name: String,
    pub config_map: ConfigMap,
    pub service: stackable_operator::k8s_openapi::api::core::v1::Service,
    pub stateful_set: StatefulSet,
}

/// Builds the expected resource bundle for every declared node group.
pub fn build_expected_resources(
    cluster: &v1alpha1::SearchCluster,
    version_family: VersionFamily,
) -> Result<Vec<ExpectedGroup>> {
    let master_names = bootstrap_master_node_names(cluster);
    cluster
        .spec
        .node_groups
        .iter()
        .map(|group| build_expected_group(cluster, &group.name, version_family, &master_names))
        .collect()
}

/// Names of pods in the first master-eligible group at spec replica count,
/// used for `cluster.initial_master_nodes` on bootstrap (Scenario A).
fn bootstrap_master_node_names(cluster: &v1alpha1::SearchCluster) -> Vec<String> {
    let Some(first_masters) = cluster.master_eligible_groups().next() else {
        return Vec::new();
    };
    (0..first_masters.replicas)
        .map(|ordinal| pod_name(cluster, &first_masters.name, ordinal))
        .collect()
}

fn pod_name(cluster: &v1alpha1::SearchCluster, group_name: &str, ordinal: i32) -> String {
    format!(
        "{group}-{ordinal}",
        group = cluster.group_object_name(group_name)
    )
}

fn build_expected_group(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    version_family: VersionFamily,
    bootstrap_master_names: &[String],
) -> Result<ExpectedGroup> {
    let group = cluster
        .node_group(group_name)
        .expect("group_name comes from cluster.spec.node_groups");
    let app_version = &cluster.spec.version;

    let service = service::build_group_headless_service(cluster, group_name, app_version)
        .context(ServiceBuildSnafu {
            group: group_name.to_string(),
        })?;

    let config_map = build_group_config_map(
        cluster,
        group_name,
        version_family,
        bootstrap_master_names,
    )?;

    let stateful_set = build_group_stateful_set(cluster, group_name, app_version, &config_map)?;

    Ok(ExpectedGroup {
        name: group_name.to_string(),
        config_map,
        service,
        stateful_set,
    })
}

fn build_group_config_map(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    version_family: VersionFamily,
    bootstrap_master_names: &[String],
) -> Result<ConfigMap> {
    let group = cluster
        .node_group(group_name)
        .expect("group_name comes from cluster.spec.node_groups");
    let app_version = &cluster.spec.version;
    let labels = labels::group_labels(cluster, group_name, app_version).context(
        LabelBuildSnafu {
            group: group_name.to_string(),
        },
    )?;

    let mut settings: BTreeMap<String, String> = BTreeMap::new();
    settings.insert(
        "cluster.name".to_string(),
        cluster.name_any(),
    );
    settings.insert(
        "node.name".to_string(),
        "${POD_NAME}".to_string(),
    );
    settings.insert("node.master".to_string(), group.master_eligible.to_string());
    settings.insert("node.data".to_string(), group.data.to_string());
    settings.insert(
        "discovery.seed_hosts".to_string(),
        format!(
            "{svc}",
            svc = service::headless_service_name(cluster, group_name)
        ),
    );

    if group.master_eligible
        && version_family.needs_initial_master_nodes()
        && !bootstrap_master_names.is_empty()
    {
        settings.insert(
            "cluster.initial_master_nodes".to_string(),
            bootstrap_master_names.join(","),
        );
    }

    // User overrides win over operator-managed defaults.
    for (key, value) in &group.config {
        settings.insert(key.clone(), value.clone());
    }

    let rendered = settings
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut builder = ConfigMapBuilder::new();
    builder
        .metadata(
            ObjectMetaBuilder::new()
                .name_and_namespace(cluster)
                .name(cluster.group_object_name(group_name))
                .ownerreference_from_resource(cluster, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?
                .with_labels(labels.into())
                .build(),
        )
        .add_data(SEARCH_CONFIG_FILE, rendered);

    extend_group_config_map(cluster, group_name, &group.logging, &mut builder).context(
        LoggingConfigSnafu {
            group: group_name.to_string(),
        },
    )?;

    builder.build().context(ConfigMapBuildSnafu {
        group: group_name.to_string(),
    })
}

fn build_group_stateful_set(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    app_version: &str,
    config_map: &ConfigMap,
) -> Result<StatefulSet> {
    let group = cluster
        .node_group(group_name)
        .expect("group_name comes from cluster.spec.node_groups");

    let mut pod_template = layered_pod_template(cluster, group_name, config_map)?;
    let content_hash = content_hash_of(&pod_template, group.replicas);

    let mut group_labels = labels::group_labels(cluster, group_name, app_version).context(
        LabelBuildSnafu {
            group: group_name.to_string(),
        },
    )?;
    group_labels
        .insert(
            stackable_operator::kvp::Label::try_from((LABEL_CONTENT_HASH, content_hash.as_str()))
                .map_err(|source| Error::LabelBuild {
                    source: crate::labels::Error::Build { source },
                    group: group_name.to_string(),
                })?,
        );
    let selector_labels = labels::group_selector_labels(cluster, group_name).context(
        LabelBuildSnafu {
            group: group_name.to_string(),
        },
    )?;

    let pod_metadata = pod_template.metadata.get_or_insert_with(Default::default);
    let merged: BTreeMap<String, String> = group_labels.clone().into();
    pod_metadata.labels.get_or_insert_with(BTreeMap::new).extend(merged);

    let pod_template_volume_names: HashSet<String> = pod_template
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| volumes.iter().map(|volume| volume.name.clone()).collect())
        .unwrap_or_default();
    let volume_claim_templates = build_volume_claim_templates(
        group,
        &selector_labels,
        group_name,
        &pod_template_volume_names,
    )?;

    Ok(StatefulSet {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(cluster)
            .name(cluster.group_object_name(group_name))
            .ownerreference_from_resource(cluster, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_labels(group_labels.into())
            .build(),
        spec: Some(StatefulSetSpec {
            replicas: Some(group.replicas),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(selector_labels.into()),
            },
            service_name: service::headless_service_name(cluster, group_name),
            template: pod_template,
            volume_claim_templates: Some(volume_claim_templates),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    // Phase 3 owns partition from here on; starting at
                    // `replicas` means "nothing eligible for rotation yet".
                    partition: Some(group.replicas),
                    ..RollingUpdateStatefulSetStrategy::default()
                }),
            }),
            ..StatefulSetSpec::default()
        }),
        status: None,
    })
}

/// A stable hash of everything phase 1 needs to decide "does this group's
/// spec actually need re-applying" (§4.2 "content-hash label").
fn content_hash_of(pod_template: &PodTemplateSpec, replicas: i32) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = fnv::FnvHasher::with_key(0);
    replicas.hash(&mut hasher);
    if let Ok(json) = serde_json::to_string(pod_template) {
        json.hash(&mut hasher);
    }
    hasher.finish().to_string()
}

/// Appends built-in PVC defaults (currently just the `data` volume) to the
/// user-supplied templates, skipping any name collision — including a
/// pod-template volume of the same name that already exists as a non-PVC
/// volume, e.g. an `emptyDir` the user named `data` in a pod override (§4.2).
fn build_volume_claim_templates(
    group: &v1alpha1::NodeGroupSpec,
    selector_labels: &Labels,
    group_name: &str,
    pod_template_volume_names: &HashSet<String>,
) -> Result<Vec<PersistentVolumeClaim>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut templates = Vec::new();
    for template in &group.volume_claim_templates {
        let name = template.metadata.name.clone().unwrap_or_default();
        if !seen.insert(name.clone()) {
            return DuplicateVolumeClaimTemplateSnafu {
                name,
                group: group_name.to_string(),
            }
            .fail();
        }
        templates.push(template.clone());
    }

    let data_volume_already_exists =
        seen.contains(STACKABLE_DATA_DIR_NAME) || pod_template_volume_names.contains(STACKABLE_DATA_DIR_NAME);
    if group.data && !data_volume_already_exists {
        templates.push(PersistentVolumeClaim {
            metadata: stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(STACKABLE_DATA_DIR_NAME.to_string()),
                labels: Some(selector_labels.clone().into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("10Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        });
    }

    Ok(templates)
}

/// The layered pod-template defaulter (§4.2): start from the user's
/// override chain (cluster-wide, then group-specific), guarantee the main
/// container exists, then backfill every unset field. Never overwrites a
/// value the user already set.
fn layered_pod_template(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    config_map: &ConfigMap,
) -> Result<PodTemplateSpec> {
    let group = cluster
        .node_group(group_name)
        .expect("group_name comes from cluster.spec.node_groups");

    let mut template = merge_pod_template_overrides(
        cluster.spec.pod_overrides.clone(),
        group.pod_overrides.clone(),
    );

    let spec = template.spec.get_or_insert_with(PodSpec::default);
    ensure_main_container(spec);

    default_image(spec, &cluster.spec.version);
    default_ports(spec);
    default_env(spec, cluster, group_name);
    default_resources(spec);
    default_readiness_probe(spec);
    default_volumes_and_mounts(spec, config_map, group.data);
    default_init_containers(spec);
    default_termination_grace_period(spec);
    default_affinity(spec, &cluster.name_any(), group_name, group);

    Ok(template)
}

/// Cluster-wide `pod_overrides` form the base; the group's own override is
/// layered on top. Neither side is mutated by the defaulter past this point.
fn merge_pod_template_overrides(
    cluster_wide: Option<PodTemplateSpec>,
    group_specific: Option<PodTemplateSpec>,
) -> PodTemplateSpec {
    match (cluster_wide, group_specific) {
        (None, None) => PodTemplateSpec::default(),
        (Some(base), None) => base,
        (None, Some(group)) => group,
        (Some(mut base), Some(group)) => {
            // The group's own containers/volumes win by name; anything the
            // cluster-wide override set that the group didn't touch is kept.
            let base_spec = base.spec.get_or_insert_with(PodSpec::default);
            if let Some(group_spec) = group.spec {
                merge_containers_by_name(&mut base_spec.containers, group_spec.containers);
                if let Some(group_volumes) = group_spec.volumes {
                    merge_named(base_spec.volumes.get_or_insert_with(Vec::new), group_volumes, |v| {
                        v.name.clone()
                    });
                }
                if let Some(group_init) = group_spec.init_containers {
                    merge_named(
                        base_spec.init_containers.get_or_insert_with(Vec::new),
                        group_init,
                        |c| c.name.clone(),
                    );
                }
                if group_spec.affinity.is_some() {
                    base_spec.affinity = group_spec.affinity;
                }
                if group_spec.termination_grace_period_seconds.is_some() {
                    base_spec.termination_grace_period_seconds =
                        group_spec.termination_grace_period_seconds;
                }
            }
            if let Some(group_metadata) = group.metadata {
                base.metadata = Some(group_metadata);
            }
            base
        }
    }
}

fn merge_containers_by_name(
    base: &mut Vec<stackable_operator::k8s_openapi::api::core::v1::Container>,
    overrides: Vec<stackable_operator::k8s_openapi::api::core::v1::Container>,
) {
    merge_named(base, overrides, |c| c.name.clone())
}

fn merge_named<T>(base: &mut Vec<T>, overrides: Vec<T>, key: impl Fn(&T) -> String) {
    let existing: HashSet<String> = base.iter().map(&key).collect();
    for item in overrides {
        if !existing.contains(&key(&item)) {
            base.push(item);
        }
    }
}

fn ensure_main_container(spec: &mut PodSpec) {
    if !spec.containers.iter().any(|c| c.name == MAIN_CONTAINER_NAME) {
        spec.containers.push(
            ContainerBuilder::new(MAIN_CONTAINER_NAME)
                .expect("main container name is a valid DNS label")
                .build(),
        );
    }
}

fn default_image(spec: &mut PodSpec, version: &str) {
    if let Some(main) = main_container_mut(spec) {
        if main.image.is_none() {
            main.image = Some(format!("docker.stackable.tech/stackable/search:{version}"));
        }
    }
}

fn default_ports(spec: &mut PodSpec) {
    if let Some(main) = main_container_mut(spec) {
        let ports = main.ports.get_or_insert_with(Vec::new);
        let existing: HashSet<String> = ports.iter().filter_map(|p| p.name.clone()).collect();
        let defaults = [
            (TRANSPORT_PORT_NAME, TRANSPORT_PORT),
            (ADMIN_PORT_NAME, ADMIN_PORT),
        ];
        for (name, port) in defaults {
            if !existing.contains(name) {
                ports.push(ContainerPort {
                    name: Some(name.to_string()),
                    container_port: port,
                    ..ContainerPort::default()
                });
            }
        }
    }
}

fn default_env(spec: &mut PodSpec, cluster: &v1alpha1::SearchCluster, group_name: &str) {
    if let Some(main) = main_container_mut(spec) {
        let env = main.env.get_or_insert_with(Vec::new);
        let existing: HashSet<String> = env.iter().map(|e| e.name.clone()).collect();
        let mut defaults = vec![EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(
                stackable_operator::k8s_openapi::api::core::v1::EnvVarSource {
                    field_ref: Some(
                        stackable_operator::k8s_openapi::api::core::v1::ObjectFieldSelector {
                            field_path: "metadata.name".to_string(),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                },
            ),
            ..Default::default()
        }];
        defaults.push(EnvVar {
            name: "SEARCH_CLUSTER_NAME".to_string(),
            value: Some(cluster.name_any()),
            ..Default::default()
        });
        let _ = group_name;
        for var in defaults {
            if !existing.contains(&var.name) {
                env.push(var);
            }
        }
    }
}

fn default_resources(spec: &mut PodSpec) {
    if let Some(main) = main_container_mut(spec) {
        let resources = main.resources.get_or_insert_with(ResourceRequirements::default);
        let limits = resources.limits.get_or_insert_with(BTreeMap::new);
        limits
            .entry("memory".to_string())
            .or_insert_with(|| Quantity(DEFAULT_MEMORY_LIMIT.to_string()));
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        requests
            .entry("cpu".to_string())
            .or_insert_with(|| Quantity(DEFAULT_CPU_REQUEST.to_string()));
    }
}

fn default_readiness_probe(spec: &mut PodSpec) {
    if let Some(main) = main_container_mut(spec) {
        if main.readiness_probe.is_none() {
            main.readiness_probe = Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::String(TRANSPORT_PORT_NAME.to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                failure_threshold: Some(3),
                ..Default::default()
            });
        }
    }
}

/// Backfills each user-supplied init container's image (from the main
/// container) and volume mounts (the main container's own mounts, minus any
/// whose name or mount path the init container already declares). Never
/// invents an init container the user didn't ask for (§4.2).
fn default_init_containers(spec: &mut PodSpec) {
    let main_image = main_container_ref(spec).and_then(|c| c.image.clone());
    let main_mounts: Vec<VolumeMount> = main_container_ref(spec)
        .and_then(|c| c.volume_mounts.clone())
        .unwrap_or_default();

    let Some(init_containers) = spec.init_containers.as_mut() else {
        return;
    };
    for init_container in init_containers.iter_mut() {
        if init_container.image.is_none() {
            init_container.image = main_image.clone();
        }

        let existing_names: HashSet<String> = init_container
            .volume_mounts
            .as_ref()
            .map(|mounts| mounts.iter().map(|mount| mount.name.clone()).collect())
            .unwrap_or_default();
        let existing_paths: HashSet<String> = init_container
            .volume_mounts
            .as_ref()
            .map(|mounts| mounts.iter().map(|mount| mount.mount_path.clone()).collect())
            .unwrap_or_default();

        let mounts = init_container.volume_mounts.get_or_insert_with(Vec::new);
        for mount in &main_mounts {
            if !existing_names.contains(&mount.name) && !existing_paths.contains(&mount.mount_path) {
                mounts.push(mount.clone());
            }
        }
    }
}

fn default_volumes_and_mounts(spec: &mut PodSpec, config_map: &ConfigMap, has_data_volume: bool) {
    let config_map_name = config_map.metadata.name.clone().unwrap_or_default();

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    let existing: HashSet<String> = volumes.iter().map(|v| v.name.clone()).collect();
    if !existing.contains(STACKABLE_CONFIG_DIR_NAME) {
        volumes.push(Volume {
            name: STACKABLE_CONFIG_DIR_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if !existing.contains(STACKABLE_LOG_CONFIG_MOUNT_DIR_NAME) {
        volumes.push(Volume {
            name: STACKABLE_LOG_CONFIG_MOUNT_DIR_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name,
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(main) = main_container_mut(spec) {
        let mounts = main.volume_mounts.get_or_insert_with(Vec::new);
        let existing: HashSet<String> = mounts.iter().map(|m| m.name.clone()).collect();
        let mut defaults = vec![
            VolumeMount {
                name: STACKABLE_CONFIG_DIR_NAME.to_string(),
                mount_path: STACKABLE_CONFIG_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: STACKABLE_LOG_CONFIG_MOUNT_DIR_NAME.to_string(),
                mount_path: STACKABLE_LOG_CONFIG_MOUNT_DIR.to_string(),
                ..Default::default()
            },
        ];
        if has_data_volume {
            defaults.push(VolumeMount {
                name: STACKABLE_DATA_DIR_NAME.to_string(),
                mount_path: STACKABLE_DATA_DIR.to_string(),
                ..Default::default()
            });
        }
        defaults.push(VolumeMount {
            name: STACKABLE_LOG_DIR_NAME.to_string(),
            mount_path: STACKABLE_LOG_DIR.to_string(),
            ..Default::default()
        });
        for mount in defaults {
            if !existing.contains(&mount.name) {
                mounts.push(mount);
            }
        }
    }
}

fn default_termination_grace_period(spec: &mut PodSpec) {
    if spec.termination_grace_period_seconds.is_none() {
        spec.termination_grace_period_seconds = Some(120);
    }
}

/// Falls back to a soft anti-affinity spreading replicas of the same group
/// across hosts (`crate::crd::affinity::get_affinity`) wherever the user
/// hasn't set the corresponding field themselves.
fn default_affinity(
    spec: &mut PodSpec,
    cluster_name: &str,
    group_name: &str,
    group: &v1alpha1::NodeGroupSpec,
) {
    if spec.affinity.is_some() {
        return;
    }
    let defaults = crate::crd::affinity::get_affinity(cluster_name, group_name);
    let stackable_affinity = &group.affinity;

    let pod_affinity = stackable_affinity.pod_affinity.clone().or(defaults.pod_affinity);
    let pod_anti_affinity = stackable_affinity
        .pod_anti_affinity
        .clone()
        .or(defaults.pod_anti_affinity);
    let node_affinity = stackable_affinity.node_affinity.clone().or(defaults.node_affinity);

    if pod_affinity.is_some() || pod_anti_affinity.is_some() || node_affinity.is_some() {
        spec.affinity = Some(Affinity {
            pod_affinity,
            pod_anti_affinity,
            node_affinity,
            ..Default::default()
        });
    }

    let node_selector = stackable_affinity
        .node_selector
        .clone()
        .or(defaults.node_selector);
    if let Some(selector) = node_selector {
        spec.node_selector = Some(selector.node_selector);
    }
}

fn main_container_mut(
    spec: &mut PodSpec,
) -> Option<&mut stackable_operator::k8s_openapi::api::core::v1::Container> {
    spec.containers
        .iter_mut()
        .find(|c| c.name == MAIN_CONTAINER_NAME)
}

fn main_container_ref(
    spec: &PodSpec,
) -> Option<&stackable_operator::k8s_openapi::api::core::v1::Container> {
    spec.containers.iter().find(|c| c.name == MAIN_CONTAINER_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackable_operator::k8s_openapi::api::core::v1::Container;

    fn sample_cluster() -> v1alpha1::SearchCluster {
        serde_yaml::from_str(indoc::indoc! {r#"
            apiVersion: search.stackable.tech/v1alpha1
            kind: SearchCluster
            metadata:
              name: my-search
              namespace: default
              uid: 11111111-1111-1111-1111-111111111111
            spec:
              version: "7.2.0"
              nodeGroups:
                - name: masters
                  masterEligible: true
                  replicas: 3
                - name: data
                  data: true
                  replicas: 3
        "#})
        .unwrap()
    }

    #[test]
    fn bootstrap_master_names_follow_first_master_group() {
        let cluster = sample_cluster();
        let names = bootstrap_master_node_names(&cluster);
        assert_eq!(
            names,
            vec![
                "my-search-masters-0".to_string(),
                "my-search-masters-1".to_string(),
                "my-search-masters-2".to_string(),
            ]
        );
    }

    #[test]
    fn user_image_override_survives_defaulting() {
        let mut spec = PodSpec {
            containers: vec![Container {
                name: MAIN_CONTAINER_NAME.to_string(),
                image: Some("custom/image:1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        default_image(&mut spec, "7.2.0");
        assert_eq!(
            main_container_mut(&mut spec).unwrap().image.as_deref(),
            Some("custom/image:1")
        );
    }

    #[test]
    fn default_ports_are_appended_not_duplicated() {
        let mut spec = PodSpec {
            containers: vec![Container {
                name: MAIN_CONTAINER_NAME.to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some(TRANSPORT_PORT_NAME.to_string()),
                    container_port: 9999,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        };
        default_ports(&mut spec);
        let ports = main_container_mut(&mut spec).unwrap().ports.clone().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(
            ports.iter().find(|p| p.name.as_deref() == Some(TRANSPORT_PORT_NAME)).unwrap().container_port,
            9999
        );
    }

    #[test]
    fn volume_claim_templates_reject_duplicate_names() {
        let mut group = sample_cluster().spec.node_groups[1].clone();
        group.volume_claim_templates = vec![
            PersistentVolumeClaim {
                metadata: stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some("extra".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            PersistentVolumeClaim {
                metadata: stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some("extra".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        let cluster = sample_cluster();
        let selector_labels = labels::group_selector_labels(&cluster, "data").unwrap();
        let result =
            build_volume_claim_templates(&group, &selector_labels, "data", &HashSet::new());
        assert!(matches!(result, Err(Error::DuplicateVolumeClaimTemplate { .. })));
    }

    #[test]
    fn default_data_pvc_is_skipped_when_pod_template_already_has_a_data_volume() {
        let group = sample_cluster().spec.node_groups[1].clone();
        let cluster = sample_cluster();
        let selector_labels = labels::group_selector_labels(&cluster, "data").unwrap();

        let pod_template_volumes: HashSet<String> = [STACKABLE_DATA_DIR_NAME.to_string()]
            .into_iter()
            .collect();
        let templates =
            build_volume_claim_templates(&group, &selector_labels, "data", &pod_template_volumes)
                .unwrap();
        assert!(templates.is_empty());
    }

    #[test]
    fn default_data_pvc_is_added_when_no_collision_exists() {
        let group = sample_cluster().spec.node_groups[1].clone();
        let cluster = sample_cluster();
        let selector_labels = labels::group_selector_labels(&cluster, "data").unwrap();

        let templates =
            build_volume_claim_templates(&group, &selector_labels, "data", &HashSet::new())
                .unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(
            templates[0].metadata.name.as_deref(),
            Some(STACKABLE_DATA_DIR_NAME)
        );
    }

    #[test]
    fn default_readiness_probe_is_backfilled_but_never_overwritten() {
        let mut spec = PodSpec {
            containers: vec![Container {
                name: MAIN_CONTAINER_NAME.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        default_readiness_probe(&mut spec);
        assert!(main_container_mut(&mut spec).unwrap().readiness_probe.is_some());

        let mut spec_with_override = PodSpec {
            containers: vec![Container {
                name: MAIN_CONTAINER_NAME.to_string(),
                readiness_probe: Some(Probe {
                    initial_delay_seconds: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        default_readiness_probe(&mut spec_with_override);
        assert_eq!(
            main_container_mut(&mut spec_with_override)
                .unwrap()
                .readiness_probe
                .as_ref()
                .unwrap()
                .initial_delay_seconds,
            Some(1)
        );
    }

    #[test]
    fn default_init_containers_inherit_image_and_filtered_mounts() {
        use stackable_operator::k8s_openapi::api::core::v1::Container as K8sContainer;

        let mut spec = PodSpec {
            containers: vec![K8sContainer {
                name: MAIN_CONTAINER_NAME.to_string(),
                image: Some("search:7.2.0".to_string()),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "config".to_string(),
                        mount_path: "/stackable/config".to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "data".to_string(),
                        mount_path: "/stackable/data".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            init_containers: Some(vec![K8sContainer {
                name: "init".to_string(),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/stackable/data".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };

        default_init_containers(&mut spec);

        let init = &spec.init_containers.unwrap()[0];
        assert_eq!(init.image.as_deref(), Some("search:7.2.0"));
        let mounts = init.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().any(|m| m.name == "config"));
        assert_eq!(mounts.iter().filter(|m| m.name == "data").count(), 1);
    }
}
