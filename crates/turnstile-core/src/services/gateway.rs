//! Gateway router: access checks, rule matching, node selection and health.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::domain::{
    Algorithm, ApiKey, GatewayConfig, GatewayStats, GlobPattern, NodeSpec, PermissionMap,
    Recommendation, RequestPath, RouteTarget, RoutingRule, ServerNode, Tier,
};
use crate::error::{ConfigError, GatewayError};
use crate::ports::{ApiKeyDirectory, HealthProbe, ProbeOutcome, RotationCounter};

const ROTATION_COUNTER: &str = "gateway:rotation";

/// Nodes below this fraction of the average load are scale-in candidates.
const SCALE_IN_FRACTION: f64 = 0.3;

/// Weight share and connection share may differ by this much before a
/// rebalance is suggested.
const REBALANCE_TOLERANCE: f64 = 0.10;

struct CompiledRule {
    rule: RoutingRule,
    glob: GlobPattern,
}

impl CompiledRule {
    fn matches(&self, path: &str, method: &str, tier: Tier) -> bool {
        self.glob.matches(path) && self.rule.method_matches(method) && self.rule.conditions.holds(tier)
    }
}

/// Outcome of one health-check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Owns the node map and rule list. Share it by `Arc` with the health-check
/// task.
pub struct GatewayRouter {
    config: GatewayConfig,
    permissions: PermissionMap,
    nodes: RwLock<BTreeMap<String, ServerNode>>,
    rules: RwLock<Vec<CompiledRule>>,
    api_keys: Arc<dyn ApiKeyDirectory>,
    rotation: Arc<dyn RotationCounter>,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    local_rotation: AtomicU64,
}

impl GatewayRouter {
    pub fn new(
        config: GatewayConfig,
        api_keys: Arc<dyn ApiKeyDirectory>,
        rotation: Arc<dyn RotationCounter>,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            permissions: PermissionMap::default(),
            nodes: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(Vec::new()),
            api_keys,
            rotation,
            probe,
            clock,
            local_rotation: AtomicU64::new(0),
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionMap) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn permissions(&self) -> &PermissionMap {
        &self.permissions
    }

    /// Resolve `api_key_id` and pick a node for `endpoint` (`path[?query]`).
    ///
    /// The endpoint is normalized first and refused if it carries dot
    /// segments. Access is checked on the normalized path before any node is
    /// considered, and the same path is what the target URL carries. The
    /// chosen node's connection count is incremented; pair with
    /// [`release`](Self::release).
    pub async fn route(
        &self,
        api_key_id: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<RouteTarget, GatewayError> {
        let request = RequestPath::parse(endpoint)?;
        let path = request.path();
        let key = self.authorize(api_key_id, &path).await?;

        let candidates = self.candidates(&path, method, key.tier).await;
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyNode { endpoint: path });
        }

        let index = match self.config.algorithm {
            Algorithm::RoundRobin => {
                let turn = self.rotation_turn().await;
                (turn % candidates.len() as u64) as usize
            }
            Algorithm::Weighted => random_weighted(&candidates),
            Algorithm::LeastConnections => least_connections(&candidates),
        };

        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&candidates[index].id)
            .filter(|node| node.is_active)
            .ok_or_else(|| GatewayError::NoHealthyNode {
                endpoint: path.clone(),
            })?;
        let target_url = request.upstream_url(&node.url)?;
        node.connections += 1;
        node.requests_served += 1;

        tracing::debug!(
            api_key_id = %api_key_id,
            endpoint = %path,
            node_id = %node.id,
            connections = node.connections,
            "Request routed"
        );

        Ok(RouteTarget {
            node_id: node.id.clone(),
            target_url: target_url.to_string(),
            retries: self.config.max_retries,
            timeout: self.config.request_timeout,
        })
    }

    /// Drop one connection from `node_id`. Never goes below zero.
    pub async fn release(&self, node_id: &str) -> Result<(), GatewayError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| GatewayError::NodeNotFound(node_id.to_string()))?;
        node.connections = node.connections.saturating_sub(1);
        Ok(())
    }

    /// Register a node, or update url and weight of an existing one.
    pub async fn add_node(&self, spec: NodeSpec) -> Result<ServerNode, GatewayError> {
        spec.validate()?;
        let mut nodes = self.nodes.write().await;
        let node = match nodes.get_mut(&spec.id) {
            Some(existing) => {
                existing.url = spec.url.trim_end_matches('/').to_string();
                existing.weight = spec.weight;
                existing.clone()
            }
            None => {
                let node = ServerNode::from(spec);
                nodes.insert(node.id.clone(), node.clone());
                node
            }
        };
        tracing::info!(node_id = %node.id, url = %node.url, weight = node.weight, "Node registered");
        Ok(node)
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<ServerNode, GatewayError> {
        let removed = self
            .nodes
            .write()
            .await
            .remove(node_id)
            .ok_or_else(|| GatewayError::NodeNotFound(node_id.to_string()))?;
        tracing::info!(node_id = %node_id, "Node removed");
        Ok(removed)
    }

    /// Add or replace (by id) a routing rule.
    pub async fn add_rule(&self, rule: RoutingRule) -> Result<RoutingRule, GatewayError> {
        if rule.method.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "rule.method",
                value: rule.method,
            }
            .into());
        }
        let glob = GlobPattern::compile(&rule.pattern)?;

        let mut rules = self.rules.write().await;
        rules.retain(|r| r.rule.id != rule.id);
        rules.push(CompiledRule {
            rule: rule.clone(),
            glob,
        });
        rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        tracing::info!(rule_id = %rule.id, pattern = %rule.pattern, priority = rule.priority, "Routing rule added");
        Ok(rule)
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<RoutingRule, GatewayError> {
        let mut rules = self.rules.write().await;
        let position = rules
            .iter()
            .position(|r| r.rule.id == rule_id)
            .ok_or_else(|| GatewayError::RuleNotFound(rule_id.to_string()))?;
        Ok(rules.remove(position).rule)
    }

    pub async fn nodes(&self) -> Vec<ServerNode> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Rules in evaluation order.
    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.rules
            .read()
            .await
            .iter()
            .map(|r| r.rule.clone())
            .collect()
    }

    pub async fn stats(&self) -> GatewayStats {
        let nodes = self.nodes().await;
        let rules = self.rules.read().await.len();

        let timings: Vec<u64> = nodes.iter().filter_map(|n| n.response_time_ms).collect();
        let average_response_time_ms = if timings.is_empty() {
            None
        } else {
            Some(timings.iter().sum::<u64>() as f64 / timings.len() as f64)
        };

        GatewayStats {
            algorithm: self.config.algorithm,
            total_nodes: nodes.len(),
            active_nodes: nodes.iter().filter(|n| n.is_active).count(),
            total_connections: nodes.iter().map(|n| n.connections).sum(),
            total_requests_served: nodes.iter().map(|n| n.requests_served).sum(),
            average_response_time_ms,
            rules,
            nodes,
        }
    }

    /// Advisory capacity changes based on current connection counts.
    pub async fn recommendations(&self) -> Vec<Recommendation> {
        let active: Vec<ServerNode> = self
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.is_active)
            .collect();
        recommend(&active, self.config.scale_out_threshold)
    }

    /// Probe every node in parallel and flip `is_active` accordingly.
    pub async fn run_health_checks(&self) -> HealthReport {
        let snapshot = self.nodes().await;
        let timeout = self.config.request_timeout;

        let outcomes = join_all(snapshot.iter().map(|node| async move {
            let outcome = match tokio::time::timeout(timeout, self.probe.probe(node, timeout)).await
            {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome {
                    healthy: false,
                    response_time: timeout,
                    detail: Some("timed out".to_string()),
                },
            };
            (node.id.clone(), outcome)
        }))
        .await;

        let now = self.clock.now();
        let mut report = HealthReport::default();
        let mut nodes = self.nodes.write().await;

        for (id, outcome) in outcomes {
            let Some(node) = nodes.get_mut(&id) else {
                continue;
            };
            report.checked += 1;
            if outcome.healthy {
                report.healthy += 1;
            } else {
                report.unhealthy += 1;
            }

            if node.is_active && !outcome.healthy {
                tracing::warn!(
                    node_id = %id,
                    detail = outcome.detail.as_deref().unwrap_or("-"),
                    "Node failed health check, marking inactive"
                );
            } else if !node.is_active && outcome.healthy {
                tracing::info!(node_id = %id, "Node recovered");
            }

            node.is_active = outcome.healthy;
            node.last_health_check = Some(now);
            node.response_time_ms = Some(outcome.response_time.as_millis() as u64);
        }

        report
    }

    /// Run [`run_health_checks`](Self::run_health_checks) every configured
    /// interval until the handle is aborted.
    pub fn spawn_health_checks(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.health_check_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.run_health_checks().await;
                tracing::debug!(
                    checked = report.checked,
                    healthy = report.healthy,
                    unhealthy = report.unhealthy,
                    "Health check pass complete"
                );
            }
        })
    }

    async fn authorize(&self, api_key_id: &str, path: &str) -> Result<ApiKey, GatewayError> {
        let key = self
            .api_keys
            .find(api_key_id)
            .await?
            .ok_or(GatewayError::UnknownApiKey)?;

        let permission = self.permissions.required_for(path);
        if !key.has_permission(permission) {
            tracing::info!(
                api_key_id = %api_key_id,
                endpoint = %path,
                permission = %permission,
                "Gateway access denied"
            );
            return Err(GatewayError::AccessDenied {
                permission: permission.to_string(),
            });
        }
        Ok(key)
    }

    /// Active nodes eligible for `path`, sorted by id.
    async fn candidates(&self, path: &str, method: &str, tier: Tier) -> Vec<ServerNode> {
        let targets = self
            .rules
            .read()
            .await
            .iter()
            .find(|r| r.matches(path, method, tier))
            .map(|r| r.rule.target_servers.clone());

        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|node| node.is_active)
            .filter(|node| targets.as_ref().is_none_or(|ids| ids.contains(&node.id)))
            .cloned()
            .collect()
    }

    async fn rotation_turn(&self) -> u64 {
        match self.rotation.next(ROTATION_COUNTER).await {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(error = %e, "Rotation counter unavailable, using local counter");
                self.local_rotation.fetch_add(1, Ordering::Relaxed)
            }
        }
    }
}

fn random_weighted(candidates: &[ServerNode]) -> usize {
    weighted_pick(candidates, &mut rand::thread_rng())
}

/// Index drawn with probability proportional to weight.
pub fn weighted_pick<R: Rng + ?Sized>(candidates: &[ServerNode], rng: &mut R) -> usize {
    let total: u64 = candidates.iter().map(|n| u64::from(n.weight)).sum();
    if total == 0 {
        return 0;
    }
    let mut roll = rng.gen_range(0..total);
    for (index, node) in candidates.iter().enumerate() {
        let weight = u64::from(node.weight);
        if roll < weight {
            return index;
        }
        roll -= weight;
    }
    candidates.len() - 1
}

/// Index of the node with the fewest open connections; ties go to the
/// first.
pub fn least_connections(candidates: &[ServerNode]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, node)| node.connections)
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn recommend(active: &[ServerNode], scale_out_threshold: f64) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if active.is_empty() {
        return out;
    }

    let count = active.len() as f64;
    let total_connections: u64 = active.iter().map(|n| n.connections).sum();
    let average = total_connections as f64 / count;

    if scale_out_threshold > 0.0 && average > scale_out_threshold {
        let needed = (total_connections as f64 / scale_out_threshold).ceil();
        out.push(Recommendation::ScaleOut {
            average_connections: average,
            threshold: scale_out_threshold,
            suggested_additional_nodes: (needed - count).max(1.0) as u32,
        });
    }

    if active.len() > 1 && average > 0.0 {
        for node in active {
            if (node.connections as f64) < average * SCALE_IN_FRACTION {
                out.push(Recommendation::ScaleIn {
                    node_id: node.id.clone(),
                    connections: node.connections,
                    average_connections: average,
                });
            }
        }
    }

    let total_weight: u64 = active.iter().map(|n| u64::from(n.weight)).sum();
    if total_weight > 0 && total_connections > 0 {
        for node in active {
            let weight_share = f64::from(node.weight) / total_weight as f64;
            let connection_share = node.connections as f64 / total_connections as f64;
            if connection_share == 0.0 || (weight_share - connection_share).abs() <= REBALANCE_TOLERANCE {
                continue;
            }
            let suggested = (f64::from(node.weight) * weight_share / connection_share).round();
            out.push(Recommendation::RebalanceWeight {
                node_id: node.id.clone(),
                current_weight: node.weight,
                suggested_weight: suggested.max(1.0) as u32,
                weight_share,
                connection_share,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn node(id: &str, weight: u32, connections: u64) -> ServerNode {
        let mut node = ServerNode::from(NodeSpec {
            id: id.to_string(),
            url: format!("http://{id}.internal"),
            weight,
        });
        node.connections = connections;
        node
    }

    #[test]
    fn weighted_pick_converges_to_weight_shares() {
        let nodes = vec![node("a", 30, 0), node("b", 30, 0), node("c", 40, 0)];
        let mut rng = StdRng::seed_from_u64(7);
        let mut hits = [0u32; 3];
        let draws = 100_000;
        for _ in 0..draws {
            hits[weighted_pick(&nodes, &mut rng)] += 1;
        }
        for (observed, expected) in hits.iter().zip([0.3, 0.3, 0.4]) {
            let share = f64::from(*observed) / f64::from(draws);
            assert!((share - expected).abs() < 0.01, "share {share} vs {expected}");
        }
    }

    #[test]
    fn least_connections_prefers_idle_node() {
        let nodes = vec![node("a", 1, 4), node("b", 1, 1), node("c", 1, 1)];
        assert_eq!(least_connections(&nodes), 1);
    }

    #[test]
    fn overloaded_cluster_gets_scale_out() {
        let nodes = vec![node("a", 50, 150), node("b", 50, 150)];
        let recs = recommend(&nodes, 100.0);
        assert!(recs.iter().any(|r| matches!(
            r,
            Recommendation::ScaleOut { suggested_additional_nodes: 1, .. }
        )));
    }

    #[test]
    fn idle_node_gets_scale_in_and_rebalance() {
        let nodes = vec![node("a", 50, 90), node("b", 50, 10)];
        let recs = recommend(&nodes, 100.0);
        assert!(recs.iter().any(|r| matches!(
            r,
            Recommendation::ScaleIn { node_id, .. } if node_id == "b"
        )));
        assert!(recs.iter().any(|r| matches!(
            r,
            Recommendation::RebalanceWeight { node_id, suggested_weight, .. }
                if node_id == "a" && *suggested_weight < 50
        )));
    }

    #[test]
    fn balanced_cluster_has_no_advice() {
        let nodes = vec![node("a", 50, 20), node("b", 50, 22)];
        assert!(recommend(&nodes, 100.0).is_empty());
    }
}
