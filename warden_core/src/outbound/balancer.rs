//! Outbound selection: selector grammar, balancing strategies, failover.

use std::{
    collections::HashSet,
    hash::{Hash, Hasher},
    sync::Arc,
};

use rand::Rng;
use raknet::conn::PacketConn;

use crate::config::{LatencySort, LoadBalanceStrategy};
use crate::error::ProxyError;

use super::{OutboundManager, OutboundNode};

/// A parsed outbound selector.
///
/// * empty - direct connection, no outbound
/// * `@` or `@group` - any healthy member of the group (empty = ungrouped)
/// * `a,b,c` - pick among an explicit set
/// * `name` - that single node, still subject to health
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Direct,
    Group(String),
    Set(Vec<String>),
    Single(String),
}

impl Selector {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::Direct;
        }
        if let Some(group) = raw.strip_prefix('@') {
            return Self::Group(group.to_owned());
        }
        if raw.contains(',') {
            let names = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect();
            return Self::Set(names);
        }
        Self::Single(raw.to_owned())
    }
}

fn set_signature(candidates: &[Arc<OutboundNode>]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for node in candidates {
        node.config.name.hash(&mut hasher);
    }
    hasher.finish()
}

impl OutboundManager {
    async fn resolve_candidates(
        &self,
        selector: &Selector,
        exclude: &HashSet<String>,
    ) -> Vec<Arc<OutboundNode>> {
        let nodes = self.nodes().await;
        let mut candidates = Vec::new();
        for node in nodes {
            let matches = match selector {
                Selector::Direct => false,
                Selector::Group(group) => node.config.group == *group,
                Selector::Set(names) => names.contains(&node.config.name),
                Selector::Single(name) => node.config.name == *name,
            };
            if !matches || exclude.contains(&node.config.name) {
                continue;
            }
            if node.is_healthy().await {
                candidates.push(node);
            }
        }
        candidates
    }

    /// Picks an outbound node for a server, honoring the strategy and
    /// skipping excluded (already failed) candidates.
    pub async fn select_outbound_with_failover_for_server(
        &self,
        server_id: &str,
        selector_raw: &str,
        strategy: LoadBalanceStrategy,
        sort: LatencySort,
        exclude: &HashSet<String>,
    ) -> Result<Arc<OutboundNode>, ProxyError> {
        let selector = Selector::parse(selector_raw);
        let candidates = self.resolve_candidates(&selector, exclude).await;
        if candidates.is_empty() {
            return Err(ProxyError::NoHealthyNode {
                selector: selector_raw.to_owned(),
            });
        }
        let picked = match strategy {
            LoadBalanceStrategy::LeastLatency => self.pick_least_latency(&candidates, sort).await,
            LoadBalanceStrategy::RoundRobin => self.pick_round_robin(selector_raw, &candidates),
            LoadBalanceStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())].clone()
            }
            LoadBalanceStrategy::LeastConnections => Self::pick_least_connections(&candidates),
        };
        log::debug!(
            "[{}] Selector {:?} picked outbound node {}",
            server_id,
            selector_raw,
            picked.config.name
        );
        Ok(picked)
    }

    async fn pick_least_latency(
        &self,
        candidates: &[Arc<OutboundNode>],
        sort: LatencySort,
    ) -> Arc<OutboundNode> {
        let mut best: Option<(i64, Arc<OutboundNode>)> = None;
        for node in candidates {
            let latency = node.health.read().await.latency(sort);
            // latency <= 0 means unmeasured
            if latency <= 0 {
                continue;
            }
            if best.as_ref().map_or(true, |(current, _)| latency < *current) {
                best = Some((latency, node.clone()));
            }
        }
        match best {
            Some((_, node)) => node,
            // nothing measured yet: fall back to the first candidate
            None => candidates[0].clone(),
        }
    }

    /// Rotation state is keyed by the caller-supplied group key (the
    /// selector string verbatim) and resets when the candidate set
    /// changes.
    fn pick_round_robin(
        &self,
        group_key: &str,
        candidates: &[Arc<OutboundNode>],
    ) -> Arc<OutboundNode> {
        let signature = set_signature(candidates);
        let mut state = match self.round_robin.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = state.entry(group_key.to_owned()).or_insert((signature, 0));
        if entry.0 != signature {
            *entry = (signature, 0);
        }
        let index = entry.1 % candidates.len();
        entry.1 = (index + 1) % candidates.len();
        candidates[index].clone()
    }

    fn pick_least_connections(candidates: &[Arc<OutboundNode>]) -> Arc<OutboundNode> {
        let mut best = candidates[0].clone();
        let mut best_count = best
            .active_conns
            .load(std::sync::atomic::Ordering::Acquire);
        for node in &candidates[1..] {
            let count = node.active_conns.load(std::sync::atomic::Ordering::Acquire);
            if count < best_count {
                best_count = count;
                best = node.clone();
            }
        }
        best
    }

    /// Dials a packet connection to `target`, failing over across the
    /// selected node set. Returns the connection and the name of the node
    /// used ([`None`] for a direct connection). Exhausting every
    /// candidate yields [`ProxyError::NoHealthyNode`]; the per-node dial
    /// failures are recorded on the nodes and logged.
    pub async fn dial_packet_with_failover(
        &self,
        server_id: &str,
        selector_raw: &str,
        strategy: LoadBalanceStrategy,
        sort: LatencySort,
        target: &str,
    ) -> Result<(Arc<dyn PacketConn>, Option<String>), ProxyError> {
        if Selector::parse(selector_raw) == Selector::Direct {
            let conn = self
                .dial_packet_direct(target)
                .await
                .map_err(|source| ProxyError::OutboundDial {
                    target: target.to_owned(),
                    node: "direct".to_owned(),
                    source,
                })?;
            return Ok((conn, None));
        }
        let mut exclude = HashSet::new();
        loop {
            let node = match self
                .select_outbound_with_failover_for_server(
                    server_id,
                    selector_raw,
                    strategy,
                    sort,
                    &exclude,
                )
                .await
            {
                Ok(node) => node,
                // every candidate was tried (or none matched)
                Err(no_healthy) => return Err(no_healthy),
            };
            match self.dial_packet_conn(&node.config.name, target).await {
                Ok(conn) => return Ok((conn, Some(node.config.name.clone()))),
                Err(err) => {
                    log::warn!(
                        "[{}] Dial through outbound {} to {} failed: {:?}",
                        server_id,
                        node.config.name,
                        target,
                        err
                    );
                    self.mark_dial_failure(&node, &err).await;
                    exclude.insert(node.config.name.clone());
                }
            }
        }
    }
}

impl OutboundManager {
    /// Stream-oriented sibling of [`Self::dial_packet_with_failover`].
    pub async fn dial_stream_with_failover(
        &self,
        server_id: &str,
        selector_raw: &str,
        strategy: LoadBalanceStrategy,
        sort: LatencySort,
        target: &str,
    ) -> Result<(Box<dyn super::OutboundStream>, Option<super::ConnGuard>), ProxyError> {
        if Selector::parse(selector_raw) == Selector::Direct {
            let stream = tokio::net::TcpStream::connect(target)
                .await
                .map_err(|err| ProxyError::OutboundDial {
                    target: target.to_owned(),
                    node: "direct".to_owned(),
                    source: err.into(),
                })?;
            let _ = stream.set_nodelay(true);
            return Ok((Box::new(stream), None));
        }
        let mut exclude = HashSet::new();
        loop {
            let node = match self
                .select_outbound_with_failover_for_server(
                    server_id,
                    selector_raw,
                    strategy,
                    sort,
                    &exclude,
                )
                .await
            {
                Ok(node) => node,
                // every candidate was tried (or none matched)
                Err(no_healthy) => return Err(no_healthy),
            };
            match self.dial_stream(&node.config.name, target).await {
                Ok((stream, guard)) => return Ok((stream, Some(guard))),
                Err(err) => {
                    log::warn!(
                        "[{}] Stream dial through outbound {} to {} failed: {:?}",
                        server_id,
                        node.config.name,
                        target,
                        err
                    );
                    self.mark_dial_failure(&node, &err).await;
                    exclude.insert(node.config.name.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{OutboundConfig, OutboundProtocol};
    use std::collections::HashMap;

    fn node_config(name: &str, group: &str, protocol: OutboundProtocol) -> OutboundConfig {
        OutboundConfig {
            name: name.to_owned(),
            group: group.to_owned(),
            protocol,
            address: format!("10.0.0.1:{}", 1000 + name.len()),
            options: HashMap::new(),
        }
    }

    async fn manager_with(names: &[&str]) -> Arc<OutboundManager> {
        let manager = Arc::new(OutboundManager::new());
        for name in names {
            manager
                .add_outbound(node_config(name, "", OutboundProtocol::Direct))
                .await
                .unwrap();
        }
        manager
    }

    #[test]
    fn selector_grammar() {
        assert_eq!(Selector::parse(""), Selector::Direct);
        assert_eq!(Selector::parse("@"), Selector::Group(String::new()));
        assert_eq!(Selector::parse("@eu"), Selector::Group("eu".to_owned()));
        assert_eq!(
            Selector::parse("a,b, c"),
            Selector::Set(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
        assert_eq!(Selector::parse("solo"), Selector::Single("solo".to_owned()));
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let manager = manager_with(&["a", "b", "c"]).await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let node = manager
                .select_outbound_with_failover_for_server(
                    "s1",
                    "a,b,c",
                    LoadBalanceStrategy::RoundRobin,
                    LatencySort::Udp,
                    &HashSet::new(),
                )
                .await
                .unwrap();
            *counts.entry(node.config.name.clone()).or_default() += 1;
        }
        for name in ["a", "b", "c"] {
            let count = counts[name];
            assert!(
                (332..=334).contains(&count),
                "{name} selected {count} times"
            );
        }
    }

    #[tokio::test]
    async fn least_latency_skips_unmeasured_and_breaks_ties() {
        let manager = manager_with(&["a", "b", "c", "d"]).await;
        manager.record_latency("a", LatencySort::Udp, 50).await;
        manager.record_latency("b", LatencySort::Udp, 50).await;
        manager.record_latency("c", LatencySort::Udp, 100).await;
        // "d" stays unmeasured (0)
        for _ in 0..20 {
            let node = manager
                .select_outbound_with_failover_for_server(
                    "s1",
                    "a,b,c,d",
                    LoadBalanceStrategy::LeastLatency,
                    LatencySort::Udp,
                    &HashSet::new(),
                )
                .await
                .unwrap();
            assert!(matches!(node.config.name.as_str(), "a" | "b"));
        }
    }

    #[tokio::test]
    async fn least_latency_all_unmeasured_picks_first() {
        let manager = manager_with(&["a", "b"]).await;
        let node = manager
            .select_outbound_with_failover_for_server(
                "s1",
                "a,b",
                LoadBalanceStrategy::LeastLatency,
                LatencySort::Udp,
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(node.config.name, "a");
    }

    #[tokio::test]
    async fn failover_exhausts_each_candidate_once() {
        // hysteria2 has no registered transport, so every dial fails
        let manager = Arc::new(OutboundManager::new());
        for name in ["a", "b", "c"] {
            manager
                .add_outbound(node_config(name, "", OutboundProtocol::Hysteria2))
                .await
                .unwrap();
        }
        let err = manager
            .dial_packet_with_failover(
                "s1",
                "a,b,c",
                LoadBalanceStrategy::RoundRobin,
                LatencySort::Udp,
                "127.0.0.1:19132",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoHealthyNode { .. }));
        for name in ["a", "b", "c"] {
            let health = manager.get_health_status(name).await.unwrap();
            assert_eq!(health.failed_attempts, 1, "{name} was revisited");
        }
    }

    #[tokio::test]
    async fn empty_group_selector_matches_ungrouped() {
        let manager = Arc::new(OutboundManager::new());
        manager
            .add_outbound(node_config("grouped", "eu", OutboundProtocol::Direct))
            .await
            .unwrap();
        manager
            .add_outbound(node_config("loose", "", OutboundProtocol::Direct))
            .await
            .unwrap();
        let node = manager
            .select_outbound_with_failover_for_server(
                "s1",
                "@",
                LoadBalanceStrategy::RoundRobin,
                LatencySort::Udp,
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(node.config.name, "loose");
    }

    #[tokio::test]
    async fn no_healthy_node_for_unknown_selector() {
        let manager = manager_with(&["a"]).await;
        let err = manager
            .select_outbound_with_failover_for_server(
                "s1",
                "missing",
                LoadBalanceStrategy::RoundRobin,
                LatencySort::Udp,
                &HashSet::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoHealthyNode { .. }));
    }

    #[tokio::test]
    async fn round_robin_resets_when_set_changes() {
        let manager = manager_with(&["a", "b", "c"]).await;
        let select = |exclude: HashSet<String>| {
            let manager = manager.clone();
            async move {
                manager
                    .select_outbound_with_failover_for_server(
                        "s1",
                        "@",
                        LoadBalanceStrategy::RoundRobin,
                        LatencySort::Udp,
                        &exclude,
                    )
                    .await
                    .unwrap()
                    .config
                    .name
                    .clone()
            }
        };
        assert_eq!(select(HashSet::new()).await, "a");
        assert_eq!(select(HashSet::new()).await, "b");
        // shrinking the candidate set resets the rotation
        manager.delete_outbound("c").await;
        assert_eq!(select(HashSet::new()).await, "a");
    }
}
