//! Route-key → shard resolution

use crate::common::route_hash;
use crate::coordinator::cluster_state::{Collection, Shard};
use serde::{Deserialize, Serialize};

/// Routing scheme of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Router {
    /// Route keys are hashed onto shard hash ranges
    #[default]
    CompositeId,
    /// Route keys name the shard directly
    Implicit,
}

impl Router {
    /// Active shards serving a single route key
    pub fn search_shards_single<'a>(
        &self,
        route_key: &str,
        collection: &'a Collection,
    ) -> Vec<&'a Shard> {
        match self {
            Router::CompositeId => {
                let hash = route_hash(route_key);
                collection
                    .shards
                    .values()
                    .filter(|s| s.is_active())
                    .filter(|s| s.range.is_some_and(|r| r.includes(hash)))
                    .collect()
            }
            Router::Implicit => collection
                .shard(route_key)
                .filter(|s| s.is_active())
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HashRange;
    use crate::coordinator::cluster_state::ShardState;

    #[test]
    fn test_composite_skips_inactive_shards() {
        let mut coll = Collection::new(
            "logs",
            "conf",
            Router::CompositeId,
            &["shard1".to_string(), "shard2".to_string()],
        );
        let h = route_hash("A");
        coll.shards.get_mut("shard1").unwrap().range = Some(HashRange::new(h, h));
        let shard2 = coll.shards.get_mut("shard2").unwrap();
        shard2.range = Some(HashRange::full());
        shard2.state = ShardState::Inactive;

        let found = Router::CompositeId.search_shards_single("A", &coll);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "shard1");
        assert!(Router::CompositeId.search_shards_single("Z", &coll).is_empty());
    }

    #[test]
    fn test_implicit_uses_shard_name() {
        let coll = Collection::new(
            "events",
            "conf",
            Router::Implicit,
            &["2024".to_string(), "2025".to_string()],
        );
        let found = Router::Implicit.search_shards_single("2025", &coll);
        assert_eq!(found[0].name, "2025");
        assert!(Router::Implicit.search_shards_single("2026", &coll).is_empty());
    }
}
