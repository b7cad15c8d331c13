//! The cluster's own administrative API (§6): nodes, health, shard
//! allocation, synced flush, voting-config exclusions, minimum-master-nodes,
//! and the routing table. This is an external collaborator per §1 — the core
//! only depends on the [`AdminClient`] trait, never on the HTTP wire format
//! directly — but the trait and its production implementation live in this
//! crate because no existing library in the Rust ecosystem speaks this
//! particular cluster's REST dialect.

use std::time::Duration;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};

use crate::crd::ClusterHealth;

/// The sentinel value that clears the shard-allocation exclude list (§4.6,
/// GLOSSARY).
pub const EXCLUSION_SENTINEL: &str = "none_excluded";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("request to the cluster admin API timed out after {timeout:?}"))]
    Timeout { timeout: Duration },

    #[snafu(display("failed to reach the cluster admin API at {url}"))]
    Unreachable {
        source: reqwest::Error,
        url: String,
    },

    #[snafu(display("the cluster admin API rejected the request: {message}"))]
    Rejected { message: String },

    #[snafu(display("failed to decode the cluster admin API response"))]
    Decode { source: reqwest::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Information about one node as reported by the cluster's own node listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
}

/// Shard state as reported by the routing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardState {
    Started,
    Relocating,
    Initializing,
}

/// One row of the routing table: a single shard copy on a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardRoute {
    pub index: String,
    pub shard: u32,
    pub primary: bool,
    pub state: ShardState,
    pub node: String,
}

/// The full routing table for a cluster, as needed by the downscale phase's
/// data-migration check (§4.4).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingTable {
    pub routes: Vec<ShardRoute>,
}

impl RoutingTable {
    /// A shard key `(index, shard, primary)` is "safe to remove `node`" when
    /// some other node (not in `leaving`) hosts a STARTED copy of the same
    /// key. This is the predicate behind the "migration done" check in §4.4
    /// step 3.
    pub fn has_started_copy_outside(&self, index: &str, shard: u32, leaving: &[String]) -> bool {
        self.routes.iter().any(|route| {
            route.index == index
                && route.shard == shard
                && route.state == ShardState::Started
                && !leaving.contains(&route.node)
        })
    }

    /// All `(index, shard)` keys hosted (in any state) on `node`.
    pub fn keys_on_node(&self, node: &str) -> Vec<(String, u32)> {
        self.routes
            .iter()
            .filter(|route| route.node == node)
            .map(|route| (route.index.clone(), route.shard))
            .collect()
    }
}

/// The contract used by the reconciliation driver to talk to a cluster's own
/// administrative endpoint. Implementations are expected to apply a per-call
/// timeout and to translate transport failures into [`Error::Unreachable`] so
/// the orchestrator (§4.1 step 5, §7) can distinguish "cluster not up yet"
/// from a genuine admin-API error.
#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn nodes(&self) -> Result<Vec<NodeInfo>>;

    async fn health(&self) -> Result<ClusterHealth>;

    async fn shard_allocation_enabled(&self) -> Result<bool>;

    async fn set_shard_allocation_enabled(&self, enabled: bool) -> Result<()>;

    /// `nonce` works around a known caching bug in the cluster software
    /// where an identical exclude-list value is sometimes not re-applied
    /// (§4.4).
    async fn set_allocation_exclude(&self, names: &[String], nonce: u64) -> Result<()>;

    async fn synced_flush(&self) -> Result<()>;

    /// New-protocol only: add the given node names to the voting
    /// configuration exclusion list.
    async fn add_voting_config_exclusions(&self, names: &[String]) -> Result<()>;

    /// New-protocol only: clear the voting configuration exclusion list.
    async fn clear_voting_config_exclusions(&self) -> Result<()>;

    /// Old-protocol only: write the `minimum_master_nodes` transient
    /// setting.
    async fn set_minimum_master_nodes(&self, value: u32) -> Result<()>;

    async fn routing_table(&self) -> Result<RoutingTable>;
}

/// HTTPS implementation of [`AdminClient`], authenticating with basic-auth
/// credentials from a generated user and validating the server certificate
/// against the cluster's CA (§6). CA issuance and credential provisioning
/// themselves are out of scope (§1) — this type only consumes the resulting
/// trust bundle and credentials.
pub struct HttpAdminClient {
    base_url: String,
    http: reqwest::Client,
    username: String,
    password: String,
    timeout: Duration,
}

impl HttpAdminClient {
    pub fn new(
        base_url: impl Into<String>,
        http: reqwest::Client,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            username: username.into(),
            password: password.into(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{base}{path}", base = self.base_url)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
            .send()
            .await
            .context(UnreachableSnafu { url: url.clone() })?;
        response.json().await.context(DecodeSnafu)
    }

    async fn put_json(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = self.url(path);
        let response = self
            .http
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context(UnreachableSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return Err(Error::Rejected {
                message: format!("PUT {path} returned {status}", status = response.status()),
            });
        }
        Ok(())
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context(UnreachableSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return Err(Error::Rejected {
                message: format!("POST {path} returned {status}", status = response.status()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdminClient for HttpAdminClient {
    async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let body = self.get_json("/_nodes").await?;
        let names = body
            .get("nodes")
            .and_then(|nodes| nodes.as_object())
            .map(|nodes| {
                nodes
                    .values()
                    .filter_map(|node| node.get("name").and_then(|n| n.as_str()))
                    .map(|name| NodeInfo {
                        name: name.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn health(&self) -> Result<ClusterHealth> {
        let body = self.get_json("/_cluster/health").await?;
        let status = body
            .get("status")
            .and_then(|status| status.as_str())
            .unwrap_or("unknown");
        Ok(match status {
            "green" => ClusterHealth::Green,
            "yellow" => ClusterHealth::Yellow,
            "red" => ClusterHealth::Red,
            _ => ClusterHealth::Unknown,
        })
    }

    async fn shard_allocation_enabled(&self) -> Result<bool> {
        let body = self
            .get_json("/_cluster/settings?include_defaults=true")
            .await?;
        let enable = body
            .pointer("/persistent/cluster/routing/allocation/enable")
            .or_else(|| body.pointer("/transient/cluster/routing/allocation/enable"))
            .or_else(|| body.pointer("/defaults/cluster/routing/allocation/enable"))
            .and_then(|value| value.as_str())
            .unwrap_or("all");
        Ok(enable == "all")
    }

    async fn set_shard_allocation_enabled(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "all" } else { "none" };
        self.put_json(
            "/_cluster/settings",
            serde_json::json!({
                "persistent": { "cluster.routing.allocation.enable": value }
            }),
        )
        .await
    }

    async fn set_allocation_exclude(&self, names: &[String], nonce: u64) -> Result<()> {
        let value = if names.is_empty() {
            EXCLUSION_SENTINEL.to_string()
        } else {
            names.join(",")
        };
        self.put_json(
            "/_cluster/settings",
            serde_json::json!({
                "persistent": {
                    "cluster.routing.allocation.exclude._name": value,
                    // Forces a re-apply even if the cluster software believes
                    // the value is unchanged from the last write.
                    "cluster.routing.allocation.exclude._nonce": nonce,
                }
            }),
        )
        .await
    }

    async fn synced_flush(&self) -> Result<()> {
        // Best-effort per §4.5; callers must not fail the upgrade step on a
        // synced-flush rejection.
        let _ = self.post_json("/_flush/synced", serde_json::json!({})).await;
        Ok(())
    }

    async fn add_voting_config_exclusions(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let path = format!(
            "/_cluster/voting_config_exclusions?node_names={names}",
            names = names.join(",")
        );
        self.post_json(&path, serde_json::json!({})).await
    }

    async fn clear_voting_config_exclusions(&self) -> Result<()> {
        let url = self.url("/_cluster/voting_config_exclusions");
        let response = self
            .http
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
            .send()
            .await
            .context(UnreachableSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return Err(Error::Rejected {
                message: format!(
                    "DELETE voting_config_exclusions returned {status}",
                    status = response.status()
                ),
            });
        }
        Ok(())
    }

    async fn set_minimum_master_nodes(&self, value: u32) -> Result<()> {
        self.put_json(
            "/_cluster/settings",
            serde_json::json!({
                "transient": { "discovery.zen.minimum_master_nodes": value }
            }),
        )
        .await
    }

    async fn routing_table(&self) -> Result<RoutingTable> {
        let body = self.get_json("/_cluster/state/routing_table").await?;
        let mut routes = Vec::new();
        if let Some(indices) = body
            .pointer("/routing_table/indices")
            .and_then(|v| v.as_object())
        {
            for (index, index_body) in indices {
                let Some(shards) = index_body.get("shards").and_then(|v| v.as_object()) else {
                    continue;
                };
                for (shard_id, copies) in shards {
                    let Some(copies) = copies.as_array() else {
                        continue;
                    };
                    let Ok(shard) = shard_id.parse::<u32>() else {
                        continue;
                    };
                    for copy in copies {
                        let Some(state) = copy.get("state").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        let Some(node) = copy.get("node").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        let state = match state {
                            "STARTED" => ShardState::Started,
                            "RELOCATING" => ShardState::Relocating,
                            "INITIALIZING" => ShardState::Initializing,
                            _ => continue,
                        };
                        routes.push(ShardRoute {
                            index: index.clone(),
                            shard,
                            primary: copy.get("primary").and_then(|v| v.as_bool()).unwrap_or(false),
                            state,
                            node: node.to_string(),
                        });
                    }
                }
            }
        }
        Ok(RoutingTable { routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(index: &str, shard: u32, node: &str, state: ShardState) -> ShardRoute {
        ShardRoute {
            index: index.to_string(),
            shard,
            primary: state == ShardState::Started,
            state,
            node: node.to_string(),
        }
    }

    #[test]
    fn migration_done_when_started_copy_exists_outside_leaving_set() {
        let table = RoutingTable {
            routes: vec![
                route("idx", 0, "data-2", ShardState::Started),
                route("idx", 0, "data-0", ShardState::Started),
            ],
        };
        assert!(table.has_started_copy_outside("idx", 0, &["data-2".to_string()]));
    }

    #[test]
    fn migration_not_done_when_only_copy_is_leaving() {
        let table = RoutingTable {
            routes: vec![route("idx", 0, "data-2", ShardState::Started)],
        };
        assert!(!table.has_started_copy_outside("idx", 0, &["data-2".to_string()]));
    }

    #[test]
    fn migration_not_done_when_remaining_copy_is_only_initializing() {
        let table = RoutingTable {
            routes: vec![
                route("idx", 0, "data-2", ShardState::Started),
                route("idx", 0, "data-0", ShardState::Initializing),
            ],
        };
        assert!(!table.has_started_copy_outside("idx", 0, &["data-2".to_string()]));
    }
}
