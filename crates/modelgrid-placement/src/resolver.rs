//! Node eligibility for artifact placement.
//!
//! A node may host an artifact of a given category when:
//! - its name is not on the exclusion list, and
//! - for the dedicated category with dedicated-only placement switched on,
//!   it carries the dedicated role; otherwise
//! - it carries one of the category's allowed roles. The data role only
//!   counts for default-tier data nodes (tier attribute absent or listed in
//!   `default_tiers`), so warm or cold storage nodes never receive artifacts.
//!
//! The resolver borrows a policy snapshot and holds no other state, so a
//! fresh one is built per request.

use std::collections::HashSet;

use tracing::debug;

use modelgrid_core::EligibilitySettings;
use modelgrid_state::{NodeId, NodeRecord};

/// Answers "which nodes may host this category" against one policy snapshot.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityResolver<'a> {
    policy: &'a EligibilitySettings,
}

impl<'a> EligibilityResolver<'a> {
    pub fn new(policy: &'a EligibilitySettings) -> Self {
        Self { policy }
    }

    /// Whether `node` may host artifacts of `category`.
    pub fn is_eligible(&self, node: &NodeRecord, category: &str) -> bool {
        if self.is_excluded(node) {
            return false;
        }
        if self.policy.only_run_on_dedicated && category == self.policy.dedicated_category {
            return node.has_role(&self.policy.dedicated_role);
        }
        self.policy.roles_for(category).iter().any(|role| {
            if *role == self.policy.data_role {
                self.is_eligible_data_node(node)
            } else {
                node.has_role(role)
            }
        })
    }

    /// A data node in the default cost tier.
    pub fn is_eligible_data_node(&self, node: &NodeRecord) -> bool {
        if !node.has_role(&self.policy.data_role) {
            return false;
        }
        match node.attributes.get(&self.policy.tier_attribute) {
            None => true,
            Some(tier) => self.policy.default_tiers.iter().any(|t| t == tier),
        }
    }

    fn is_excluded(&self, node: &NodeRecord) -> bool {
        self.policy
            .exclude_node_names
            .iter()
            .any(|name| *name == node.name)
    }

    /// IDs of every eligible node, in membership order.
    pub fn resolve(&self, nodes: &[NodeRecord], category: &str) -> Vec<NodeId> {
        let eligible: Vec<NodeId> = nodes
            .iter()
            .filter(|node| self.is_eligible(node, category))
            .map(|node| node.id.clone())
            .collect();
        debug!(%category, total = nodes.len(), eligible = eligible.len(), "resolved eligible nodes");
        eligible
    }

    /// Restrict `candidates` to the eligible ones, keeping caller order.
    ///
    /// Unknown IDs and repeats are dropped.
    pub fn filter_eligible(
        &self,
        nodes: &[NodeRecord],
        category: &str,
        candidates: &[NodeId],
    ) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        candidates
            .iter()
            .filter(|id| seen.insert(*id))
            .filter(|id| {
                nodes
                    .iter()
                    .find(|node| node.id == **id)
                    .is_some_and(|node| self.is_eligible(node, category))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE: &str = "remote";
    const LOCAL: &str = "local";

    fn policy(only_dedicated: bool, excluded: &[&str]) -> EligibilitySettings {
        let mut policy = EligibilitySettings {
            only_run_on_dedicated: only_dedicated,
            exclude_node_names: excluded.iter().map(|s| s.to_string()).collect(),
            ..EligibilitySettings::default()
        };
        policy
            .category_roles
            .insert(REMOTE.into(), vec!["data".into(), "ml".into()]);
        policy.category_roles.insert(LOCAL.into(), vec!["data".into()]);
        policy
    }

    fn cluster() -> Vec<NodeRecord> {
        vec![
            NodeRecord::new("cm", "cm-name", &["cluster_manager"]),
            NodeRecord::new("data1", "data1-name", &["data", "ingest"]),
            NodeRecord::new("data2", "data2-name", &["data", "ingest"]).with_attribute("box_type", "hot"),
            NodeRecord::new("warm1", "warm1-name", &["data", "ingest"]).with_attribute("box_type", "warm"),
            NodeRecord::new("ml1", "ml1-name", &["ml"]),
            NodeRecord::new("ml2", "ml2-name", &["ml"]),
            NodeRecord::new("all", "all-name", &["cluster_manager", "data", "ingest", "ml"]),
        ]
    }

    fn ids(list: &[&str]) -> Vec<NodeId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn remote_category_uses_role_allow_list() {
        let policy = policy(true, &["not-a-node"]);
        let resolver = EligibilityResolver::new(&policy);

        let eligible = resolver.resolve(&cluster(), REMOTE);
        assert_eq!(eligible, ids(&["data1", "data2", "ml1", "ml2", "all"]));
    }

    #[test]
    fn dedicated_category_only_on_dedicated_nodes() {
        let policy = policy(true, &[]);
        let resolver = EligibilityResolver::new(&policy);

        assert_eq!(resolver.resolve(&cluster(), LOCAL), ids(&["ml1", "ml2", "all"]));
    }

    #[test]
    fn dedicated_flag_off_falls_back_to_roles() {
        let policy = policy(false, &["ml1-name", "ml2-name"]);
        let resolver = EligibilityResolver::new(&policy);

        assert_eq!(resolver.resolve(&cluster(), LOCAL), ids(&["data1", "data2", "all"]));
    }

    #[test]
    fn warm_data_nodes_are_never_eligible() {
        let policy = policy(false, &[]);
        let resolver = EligibilityResolver::new(&policy);
        let nodes: Vec<NodeRecord> = cluster()
            .into_iter()
            .filter(|n| ["cm", "data1", "data2", "warm1"].contains(&n.id.as_str()))
            .collect();

        assert_eq!(resolver.resolve(&nodes, REMOTE), ids(&["data1", "data2"]));
        assert!(!resolver.is_eligible_data_node(&nodes[3]));
        assert!(resolver.is_eligible_data_node(&nodes[2]));
    }

    #[test]
    fn excluded_names_never_appear() {
        let policy = policy(false, &["all-name", "data1-name"]);
        let resolver = EligibilityResolver::new(&policy);

        for category in [REMOTE, LOCAL, "sparse_encoding"] {
            let eligible = resolver.resolve(&cluster(), category);
            assert!(!eligible.contains(&"all".to_string()));
            assert!(!eligible.contains(&"data1".to_string()));
        }
    }

    #[test]
    fn resolve_is_deterministic() {
        let policy = policy(true, &["ml2-name"]);
        let resolver = EligibilityResolver::new(&policy);
        let nodes = cluster();

        let first = resolver.resolve(&nodes, REMOTE);
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&nodes, REMOTE), first);
        }
    }

    #[test]
    fn filter_keeps_eligible_candidates_in_order() {
        let policy = policy(true, &["ml1-name"]);
        let resolver = EligibilityResolver::new(&policy);

        let filtered = resolver.filter_eligible(&cluster(), REMOTE, &ids(&["ml1", "ml2", "data1"]));
        assert_eq!(filtered, ids(&["ml2", "data1"]));
    }

    #[test]
    fn filter_drops_unknown_and_repeated_ids() {
        let policy = policy(false, &[]);
        let resolver = EligibilityResolver::new(&policy);

        let filtered =
            resolver.filter_eligible(&cluster(), REMOTE, &ids(&["data1", "ghost", "data1", "warm1"]));
        assert_eq!(filtered, ids(&["data1"]));
        assert!(resolver.filter_eligible(&cluster(), REMOTE, &[]).is_empty());
    }

    #[test]
    fn unknown_category_uses_default_roles() {
        let policy = policy(false, &[]);
        let resolver = EligibilityResolver::new(&policy);

        let eligible = resolver.resolve(&cluster(), "text_similarity");
        assert_eq!(eligible, ids(&["data1", "data2", "ml1", "ml2", "all"]));
    }
}
