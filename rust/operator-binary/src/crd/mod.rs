use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    commons::{affinity::StackableAffinity, cluster_operation::ClusterOperation},
    k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec},
    kube::{CustomResource, ResourceExt, runtime::reflector::ObjectRef},
    product_logging::spec::Logging,
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
    versioned::versioned,
};
use strum::{Display, EnumString};

pub mod affinity;

pub const APP_NAME: &str = "search";
pub const OPERATOR_NAME: &str = "search.stackable.tech";
pub const FIELD_MANAGER_SCOPE: &str = "searchcluster";

/// Default memory limit applied by the pod-template defaulter (§4.2) when the
/// merge chain (user pod-template override → group defaults) leaves the main
/// container's memory limit unset.
pub const DEFAULT_MEMORY_LIMIT: &str = "1Gi";
pub const DEFAULT_CPU_REQUEST: &str = "250m";

pub const TRANSPORT_PORT_NAME: &str = "transport";
pub const TRANSPORT_PORT: i32 = 9300;
pub const ADMIN_PORT_NAME: &str = "admin";
pub const ADMIN_PORT: i32 = 9200;

pub const STACKABLE_CONFIG_DIR: &str = "/stackable/config";
pub const STACKABLE_CONFIG_DIR_NAME: &str = "config";
pub const STACKABLE_DATA_DIR: &str = "/stackable/data";
pub const STACKABLE_DATA_DIR_NAME: &str = "data";
pub const STACKABLE_LOG_DIR: &str = "/stackable/log";
pub const STACKABLE_LOG_DIR_NAME: &str = "log";
pub const STACKABLE_LOG_CONFIG_MOUNT_DIR: &str = "/stackable/mount/log-config";
pub const STACKABLE_LOG_CONFIG_MOUNT_DIR_NAME: &str = "log-config-mount";

pub const SEARCH_CONFIG_FILE: &str = "search.yml";
pub const SEARCH_LOG4J2_PROPERTIES: &str = "log4j2.properties";
pub const MAX_SEARCH_LOG_FILES_SIZE_MIB: u32 = 500;

/// Mandatory labels carried on every object this operator authors, beyond the
/// recommended Stackable selector/ownership labels (§6).
pub const LABEL_CLUSTER_NAME: &str = "cluster-name";
pub const LABEL_GROUP_NAME: &str = "group-name";
pub const LABEL_POD_NAME: &str = "pod-name";
pub const LABEL_ROLE_MASTER: &str = "role-master";
pub const LABEL_ROLE_DATA: &str = "role-data";
pub const LABEL_VERSION: &str = "version";
pub const LABEL_CONTENT_HASH: &str = "content-hash";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,
    #[snafu(display("object {obj_ref} defines no parseable version"))]
    InvalidVersion {
        source: semver::Error,
        obj_ref: ObjectRef<v1alpha1::SearchCluster>,
    },
    #[snafu(display("no node group named {group:?} is declared in the spec"))]
    UnknownNodeGroup { group: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[versioned(
    version(name = "v1alpha1"),
    crates(
        kube_core = "stackable_operator::kube::core",
        kube_client = "stackable_operator::kube::client",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars",
        versioned = "stackable_operator::versioned"
    )
)]
pub mod versioned {
    /// A search cluster stacklet, managed end-to-end by the operator: node
    /// groups are materialized as grouped pod controllers, scaled up and down
    /// with data migration and quorum safety, and rolled forward one pod at a
    /// time during upgrades.
    #[versioned(crd(
        group = "search.stackable.tech",
        plural = "searchclusters",
        shortname = "search",
        status = "SearchClusterStatus",
        namespaced
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SearchClusterSpec {
        /// The target product version, e.g. `"7.2.0"` or `"8.4.1"`. Drives the
        /// version-family strategy (old-protocol vs new-protocol coordination,
        /// see `crate::version`).
        pub version: String,

        // no doc - docs in ClusterOperation struct.
        #[serde(default)]
        pub cluster_operation: ClusterOperation,

        /// Pod-template overrides applied to every node group before its own
        /// `podOverrides` are layered on top. Never overwrites a value the
        /// group already set; see the defaulter contract in §4.2.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub pod_overrides: Option<PodTemplateSpec>,

        /// Declared node groups, visited in this order by the rolling-upgrade
        /// phase (§4.5). Each name must be unique within the cluster.
        pub node_groups: Vec<NodeGroupSpec>,
    }

    /// One declared node group: a name, role flags, a desired replica count,
    /// and the per-group overrides layered on top of the cluster-wide
    /// defaults by the expected-resources planner (§4.2).
    #[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct NodeGroupSpec {
        /// Unique within the cluster. Changing a group's role flags is treated
        /// as a new group identity — rename the group instead of flipping
        /// `masterEligible`/`data` on an existing one.
        pub name: String,

        /// Whether pods in this group participate in quorum.
        #[serde(default)]
        pub master_eligible: bool,

        /// Whether pods in this group hold shard data.
        #[serde(default)]
        pub data: bool,

        /// Desired replica count. The downscale phase (§4.4) is the only path
        /// that may reduce the orchestrator object's replica count; the
        /// upscale phase (§4.3) only ever grows it.
        pub replicas: i32,

        /// Free-form configuration overrides merged into the generated
        /// configuration blob on top of the operator-managed defaults.
        #[serde(default)]
        pub config: BTreeMap<String, String>,

        /// User-supplied volume-claim templates. Appended to (never
        /// replacing) the built-in defaults per the layered-defaulter rule
        /// in §4.2: a default is skipped if a user template of the same name
        /// exists, or if a pod-template volume of that name is already a
        /// non-PVC volume.
        #[serde(default)]
        pub volume_claim_templates: Vec<PersistentVolumeClaim>,

        /// Pod-template overrides specific to this group, layered on top of
        /// `SearchClusterSpec::pod_overrides`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub pod_overrides: Option<PodTemplateSpec>,

        #[serde(default)]
        pub affinity: StackableAffinity,

        /// Log shipping configuration for this group (§10 supplemented
        /// feature 2). Not gated by any Non-goal — only metrics *export* is
        /// out of scope, not log shipping.
        #[serde(default)]
        pub logging: Logging<Container>,
    }
}

impl HasStatusCondition for v1alpha1::SearchCluster {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl v1alpha1::SearchCluster {
    pub fn namespace_or_err(&self) -> Result<String> {
        self.metadata.namespace.clone().context(NoNamespaceSnafu)
    }

    pub fn node_group(&self, name: &str) -> Result<&v1alpha1::NodeGroupSpec> {
        self.spec
            .node_groups
            .iter()
            .find(|g| g.name == name)
            .with_context(|| UnknownNodeGroupSnafu {
                group: name.to_string(),
            })
    }

    /// The name of the stateful-group object for a declared node group:
    /// `<cluster>-<group>`, per §6.
    pub fn group_object_name(&self, group_name: &str) -> String {
        format!(
            "{cluster}-{group}",
            cluster = self.name_any(),
            group = group_name
        )
    }

    /// Parses `spec.version` as a semantic version, used to pick the
    /// version-family strategy (§4.2, §9).
    pub fn parsed_version(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.spec.version).with_context(|_| InvalidVersionSnafu {
            obj_ref: ObjectRef::from_obj(self),
        })
    }

    /// Every master-eligible group, in spec order.
    pub fn master_eligible_groups(&self) -> impl Iterator<Item = &v1alpha1::NodeGroupSpec> {
        self.spec.node_groups.iter().filter(|g| g.master_eligible)
    }
}

/// Cluster health as surfaced by the cluster's own administrative API (§6).
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClusterHealth {
    #[default]
    Unknown,
    Red,
    Yellow,
    Green,
}

/// Coarse reconciliation phase surfaced on `status.phase`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ClusterPhase {
    #[default]
    Pending,
    Operational,
    Migrating,
    Invalid,
}

#[derive(Clone, Default, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    #[serde(default)]
    pub health: ClusterHealth,

    /// An opaque value that changes every time a discovery detail does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_hash: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

/// The two containers the operator ever injects into a pod template by name.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    Eq,
    EnumString,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Container {
    Search,
    Vector,
}
