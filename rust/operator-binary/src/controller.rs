//! Reconciliation orchestrator (§4.1): sequences the phases in the strict
//! order their safety invariants depend on (apply before coordination before
//! shrink; rolling upgrade last) and reduces their outcomes to a single
//! requeue decision.

use std::{sync::Arc, time::Duration};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::core::v1::Secret,
    kube::{core::DeserializeGuard, runtime::controller::Action, Resource, ResourceExt},
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    admin_client::{AdminClient, HttpAdminClient},
    crd::{v1alpha1, ADMIN_PORT, ClusterHealth, ClusterPhase, FIELD_MANAGER_SCOPE, SearchClusterStatus},
    discovery, expectations, observer, pdb, phase1, phase2, phase3, planner,
    reconcile_result::{RequeueDecision, ResultAggregator},
    service,
    version::VersionFamily,
};

pub const FULL_CONTROLLER_NAME: &str = "searchcluster.search.stackable.tech";

const DEFAULT_REQUEUE: Duration = Duration::from_secs(10);
const STALE_CACHE_REQUEUE: Duration = Duration::from_secs(2);

pub struct Ctx {
    pub client: Client,
    pub expectations: expectations::ExpectationsStore,
    pub observers: observer::ObserverManager,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object defines no parseable version"))]
    InvalidVersion { source: crate::crd::Error },
    #[snafu(display("failed to plan the expected resources"))]
    Plan { source: crate::planner::Error },
    #[snafu(display("failed to read stateful group {group:?}"))]
    GetStatefulSet {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("phase 1 (spec apply) failed"))]
    Phase1 { source: crate::phase1::Error },
    #[snafu(display("phase 2 (downscale) failed"))]
    Phase2 { source: crate::phase2::Error },
    #[snafu(display("phase 3 (rolling upgrade) failed"))]
    Phase3 { source: crate::phase3::Error },
    #[snafu(display("failed to build pod disruption budget for group {group:?}"))]
    BuildPdb {
        source: crate::pdb::Error,
        group: String,
    },
    #[snafu(display("failed to apply pod disruption budget for group {group:?}"))]
    ApplyPdb {
        source: stackable_operator::client::Error,
        group: String,
    },
    #[snafu(display("failed to build discovery config map"))]
    BuildDiscovery { source: crate::discovery::Error },
    #[snafu(display("failed to apply discovery config map"))]
    ApplyDiscovery {
        source: stackable_operator::client::Error,
    },
    #[snafu(display("no node group is declared to host the admin endpoint"))]
    NoAdminTarget,
    #[snafu(display("admin credentials secret {name:?} not found"))]
    MissingCredentialsSecret { name: String },
    #[snafu(display("admin credentials secret {name:?} is missing key {key:?}"))]
    MissingCredentialsKey { name: String, key: &'static str },
    #[snafu(display("admin credentials secret {name:?} key {key:?} is not valid UTF-8"))]
    InvalidCredentialsEncoding { name: String, key: &'static str },
    #[snafu(display("failed to read admin credentials secret"))]
    GetCredentialsSecret {
        source: stackable_operator::client::Error,
    },
    #[snafu(display("failed to apply status"))]
    ApplyStatus {
        source: stackable_operator::client::Error,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Rewraps a phase module's own `StepOutcome` into one carrying this
/// module's `Error`, so every phase can share a single aggregator (§4.9).
fn map_step<E>(
    outcome: crate::reconcile_result::StepOutcome<E>,
    wrap: impl FnOnce(E) -> Error,
) -> crate::reconcile_result::StepOutcome<Error> {
    crate::reconcile_result::StepOutcome {
        decision: outcome.decision,
        error: outcome.error.map(wrap),
    }
}

pub async fn reconcile(
    cluster: Arc<DeserializeGuard<v1alpha1::SearchCluster>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    let Ok(cluster) = &cluster.0 else {
        // An unparseable stored object can't be fixed by this operator;
        // wait for the next spec update instead of hot-looping on it.
        return Ok(Action::await_change());
    };
    let client = &ctx.client;
    let cluster_key = expectations::cluster_key(cluster);

    if cluster.meta().deletion_timestamp.is_some() {
        ctx.expectations.forget(&cluster_key);
        ctx.observers.stop_observer(&cluster_key).await;
        return Ok(Action::await_change());
    }

    if !expectations_satisfied(client, cluster, &ctx.expectations, &cluster_key).await? {
        return Ok(Action::requeue(STALE_CACHE_REQUEUE));
    }

    let version_family = VersionFamily::for_cluster(cluster).context(InvalidVersionSnafu)?;
    let expected = planner::build_expected_resources(cluster, version_family).context(PlanSnafu)?;

    let mut aggregator: ResultAggregator<Error> = ResultAggregator::new();
    for outcome in phase1::apply_expected_groups(client, cluster, &ctx.expectations, &expected).await
    {
        aggregator.record(map_step(outcome, |source| Error::Phase1 { source }));
    }
    apply_pod_disruption_budgets(client, cluster).await?;

    let app_version = cluster.spec.version.as_str();
    let discovery_cm = discovery::build_discovery_configmap(cluster, app_version)
        .context(BuildDiscoverySnafu)?;
    let applied_discovery = client
        .apply_patch(FIELD_MANAGER_SCOPE, &discovery_cm, &discovery_cm)
        .await
        .context(ApplyDiscoverySnafu)?;
    if let Some(meta) = expectations::ObjectMeta::from_resource(&applied_discovery) {
        ctx.expectations.expect_generation(&cluster_key, &meta);
    }
    let discovery_hash = applied_discovery
        .resource_version()
        .map(|rv| content_hash(&rv));

    let admin = match build_admin_client(client, cluster).await {
        Ok(admin) => Arc::new(admin) as Arc<dyn AdminClient>,
        Err(error) => {
            apply_status(
                client,
                cluster,
                ClusterPhase::Pending,
                ClusterHealth::Unknown,
                discovery_hash,
            )
            .await?;
            tracing::warn!(%error, "admin endpoint not reachable yet");
            return Ok(Action::requeue(DEFAULT_REQUEUE));
        }
    };

    let observed = observer::ObservedState::new(admin.clone());
    let health = match observed.health().await {
        Ok(health) => health,
        Err(error) => {
            apply_status(
                client,
                cluster,
                ClusterPhase::Pending,
                ClusterHealth::Unknown,
                discovery_hash,
            )
            .await?;
            tracing::warn!(%error, "admin endpoint not reachable yet");
            return Ok(Action::requeue(DEFAULT_REQUEUE));
        }
    };

    let interval = observer::observer_interval_from_annotation(
        cluster
            .meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get("observer-interval"))
            .map(String::as_str),
    );
    ctx.observers
        .ensure_observer(
            &cluster_key,
            admin.clone(),
            interval,
            Arc::new(|_health| {}),
        )
        .await;

    aggregator.record_decision(sync_coordination_settings(cluster, admin.as_ref(), version_family).await?);

    aggregator.record(map_step(
        phase2::run(
            client,
            cluster,
            &ctx.expectations,
            admin.as_ref(),
            &observed,
            version_family,
            &expected,
        )
        .await,
        |source| Error::Phase2 { source },
    ));

    aggregator.record(map_step(
        phase3::run(client, cluster, &ctx.expectations, admin.as_ref(), &observed).await,
        |source| Error::Phase3 { source },
    ));

    let phase = if aggregator.has_errors() {
        ClusterPhase::Pending
    } else if observed.routing_table().await.is_ok()
        && matches!(aggregator.decision(), RequeueDecision::NoRequeue)
    {
        ClusterPhase::Operational
    } else {
        ClusterPhase::Migrating
    };
    apply_status(client, cluster, phase, health, discovery_hash).await?;

    Ok(match aggregator.decision() {
        RequeueDecision::NoRequeue => Action::await_change(),
        RequeueDecision::RequeueNow => Action::requeue(Duration::ZERO),
        RequeueDecision::RequeueAfter(duration) => Action::requeue(duration),
    })
}

/// §4.1 step 2: abort this pass with a short requeue if the operator's own
/// cache is known-stale for any group the cluster currently declares.
async fn expectations_satisfied(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    expectations: &expectations::ExpectationsStore,
    cluster_key: &str,
) -> Result<bool> {
    use stackable_operator::k8s_openapi::api::apps::v1::StatefulSet;

    let namespace = cluster.namespace_or_err().ok();
    let mut metas = Vec::with_capacity(cluster.spec.node_groups.len());
    for group in &cluster.spec.node_groups {
        let existing = client
            .get_opt::<StatefulSet>(&cluster.group_object_name(&group.name), namespace.as_deref())
            .await
            .context(GetStatefulSetSnafu {
                group: group.name.clone(),
            })?;
        if let Some(existing) = existing {
            if let Some(meta) = expectations::ObjectMeta::from_resource(&existing) {
                metas.push(meta);
            }
        }
    }
    Ok(expectations.generation_expected(cluster_key, &metas))
}

async fn apply_pod_disruption_budgets(client: &Client, cluster: &v1alpha1::SearchCluster) -> Result<()> {
    for group in &cluster.spec.node_groups {
        if let Some(budget) = pdb::build_group_pdb(cluster, &group.name).context(BuildPdbSnafu {
            group: group.name.clone(),
        })? {
            client
                .apply_patch(FIELD_MANAGER_SCOPE, &budget, &budget)
                .await
                .context(ApplyPdbSnafu {
                    group: group.name.clone(),
                })?;
        }
    }
    Ok(())
}

/// §4.1 step 6: keep `minimum_master_nodes` in step with the *declared*
/// master count on old-protocol clusters ahead of any pod being added — the
/// decrease side of this knob is handled by phase 2 as masters actually
/// leave (§4.4).
async fn sync_coordination_settings(
    cluster: &v1alpha1::SearchCluster,
    admin: &dyn AdminClient,
    version_family: VersionFamily,
) -> Result<RequeueDecision> {
    if !version_family.uses_minimum_master_nodes() {
        return Ok(RequeueDecision::NoRequeue);
    }
    let total_masters: i32 = cluster.master_eligible_groups().map(|group| group.replicas).sum();
    if total_masters < 1 {
        return Ok(RequeueDecision::NoRequeue);
    }
    let minimum = (total_masters / 2 + 1).max(1) as u32;
    match admin.set_minimum_master_nodes(minimum).await {
        Ok(()) => Ok(RequeueDecision::NoRequeue),
        Err(_) => Ok(RequeueDecision::RequeueAfter(DEFAULT_REQUEUE)),
    }
}

/// Builds the admin-API client for `cluster` from the first master-eligible
/// group's headless service and the generated basic-auth credentials secret
/// (§6 "basic-auth credentials from a generated user"; provisioning that
/// secret is out of scope here, see §1).
async fn build_admin_client(client: &Client, cluster: &v1alpha1::SearchCluster) -> Result<HttpAdminClient> {
    let target_group = cluster
        .master_eligible_groups()
        .next()
        .or_else(|| cluster.spec.node_groups.first())
        .context(NoAdminTargetSnafu)?;
    let base_url = format!(
        "https://{host}:{port}",
        host = service::headless_service_name(cluster, &target_group.name),
        port = ADMIN_PORT
    );

    let secret_name = format!("{cluster}-admin-credentials", cluster = cluster.name_any());
    let namespace = cluster.namespace_or_err().ok();
    let secret = client
        .get_opt::<Secret>(&secret_name, namespace.as_deref())
        .await
        .context(GetCredentialsSecretSnafu)?
        .context(MissingCredentialsSecretSnafu {
            name: secret_name.clone(),
        })?;
    let username = secret_value(&secret, &secret_name, "username")?;
    let password = secret_value(&secret, &secret_name, "password")?;

    Ok(HttpAdminClient::new(
        base_url,
        reqwest::Client::new(),
        username,
        password,
        Duration::from_secs(10),
    ))
}

fn secret_value(secret: &Secret, secret_name: &str, key: &'static str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .context(MissingCredentialsKeySnafu {
            name: secret_name.to_string(),
            key,
        })?;
    String::from_utf8(bytes.0.clone())
        .ok()
        .context(InvalidCredentialsEncodingSnafu {
            name: secret_name.to_string(),
            key,
        })
}

async fn apply_status(
    client: &Client,
    cluster: &v1alpha1::SearchCluster,
    phase: ClusterPhase,
    health: ClusterHealth,
    discovery_hash: Option<String>,
) -> Result<()> {
    let status = SearchClusterStatus {
        phase,
        health,
        discovery_hash,
        conditions: cluster
            .status
            .as_ref()
            .map(|status| status.conditions.clone())
            .unwrap_or_default(),
    };
    client
        .apply_patch_status(FIELD_MANAGER_SCOPE, cluster, &status)
        .await
        .context(ApplyStatusSnafu)?;
    Ok(())
}

fn content_hash(value: &str) -> String {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(value.as_bytes());
    hasher.finish().to_string()
}

pub fn error_policy(
    _cluster: Arc<DeserializeGuard<v1alpha1::SearchCluster>>,
    _error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    Action::requeue(DEFAULT_REQUEUE)
}
