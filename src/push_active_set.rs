use {
    crate::{crds::Crds, crds_value::CrdsValueLabel},
    indexmap::IndexMap,
    rand::{seq::SliceRandom, Rng},
    solana_bloom::bloom::{Bloom, ConcurrentBloom},
    solana_pubkey::Pubkey,
    std::net::SocketAddr,
};

/// Number of peers the engine actively pushes to.
pub const NUM_ACTIVE_SET_ENTRIES: usize = 25;

// Keys are gossip nodes to push messages to.
// Values are which origins the node has pruned.
#[derive(Default)]
pub struct PushActiveSet(IndexMap</*node:*/ Pubkey, /*origins:*/ ConcurrentBloom<Pubkey>>);

impl PushActiveSet {
    const BLOOM_FALSE_RATE: f64 = 0.1;
    const BLOOM_MAX_BITS: usize = 1024 * 8 * 4;

    /// Push peers that have not pruned this origin, resolved to their gossip
    /// endpoint. Peers without a contact info in the table are skipped.
    pub fn get_fanout_peers(&self, origin: &Pubkey, crds: &Crds) -> Vec<SocketAddr> {
        self.0
            .iter()
            .filter(|(_, bloom_filter)| !bloom_filter.contains(origin))
            .filter_map(|(node, _)| {
                let versioned = crds.get(&CrdsValueLabel::ContactInfo(*node))?;
                Some(versioned.value.contact_info()?.gossip())
            })
            .collect()
    }

    // Prunes origins for the given gossip node.
    // We will stop pushing messages from the specified origins to the node.
    pub fn prune(&self, node: &Pubkey, origin: &Pubkey) {
        if let Some(bloom_filter) = self.0.get(node) {
            bloom_filter.add(origin);
        }
    }

    pub fn rotate<R: Rng>(
        &mut self,
        rng: &mut R,
        size: usize, // Number of nodes to retain.
        num_bloom_filter_items: usize,
        nodes: &[Pubkey],
    ) {
        if nodes.is_empty() {
            return;
        }
        let mut nodes: Vec<&Pubkey> = nodes.iter().collect();
        nodes.shuffle(rng);
        for node in nodes {
            // We intend to discard the oldest/first entry in the index-map.
            if self.0.len() > size {
                break;
            }
            if self.0.contains_key(node) {
                continue;
            }
            let bloom = ConcurrentBloom::from(Bloom::random(
                num_bloom_filter_items,
                Self::BLOOM_FALSE_RATE,
                Self::BLOOM_MAX_BITS,
            ));
            // A peer's own records are never pushed back at it.
            bloom.add(node);
            self.0.insert(*node, bloom);
        }
        // Drop the oldest entry while preserving the ordering of others.
        while self.0.len() > size {
            self.0.shift_remove_index(0);
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &Pubkey> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `node` is in the set and has pruned `origin`.
    pub fn is_pruned(&self, node: &Pubkey, origin: &Pubkey) -> bool {
        self.0
            .get(node)
            .map(|bloom_filter| bloom_filter.contains(origin))
            .unwrap_or_default()
    }
}
