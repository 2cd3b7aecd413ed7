//! Bloom-filter representation of "records I already have", sent with pull
//! requests so the peer can answer with the complement.

use {
    crate::{crds::Crds, crds_value::CrdsValue},
    rand::{seq::SliceRandom, Rng},
    serde::{Deserialize, Serialize},
    solana_bloom::bloom::Bloom,
    solana_hash::Hash,
    solana_sanitize::{Sanitize, SanitizeError},
};

/// Upper bound on the serialized size of a single pull filter's bloom.
pub const MAX_BLOOM_FILTER_BYTES: usize = 928;
pub const FALSE_RATE: f64 = 0.1;
pub const KEYS: f64 = 8.0;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CrdsFilter {
    pub filter: Bloom<Hash>,
    pub(crate) mask: u64,
    pub(crate) mask_bits: u32,
}

impl Default for CrdsFilter {
    fn default() -> Self {
        CrdsFilter {
            filter: Bloom::default(),
            mask: !0u64,
            mask_bits: 0u32,
        }
    }
}

impl Sanitize for CrdsFilter {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        if self.mask_bits > 64 {
            return Err(SanitizeError::ValueOutOfBounds);
        }
        Ok(())
    }
}

impl CrdsFilter {
    pub fn new_rand(num_items: usize, max_bytes: usize) -> Self {
        let max_bits = (max_bytes * 8) as f64;
        let max_items = Self::max_items(max_bits, FALSE_RATE, KEYS);
        let mask_bits = Self::mask_bits(num_items as f64, max_items);
        let filter = Bloom::random(max_items as usize, FALSE_RATE, max_bits as usize);
        let seed: u64 = rand::thread_rng().gen_range(0..2u64.checked_pow(mask_bits).unwrap_or(u64::MAX));
        let mask = Self::compute_mask(seed, mask_bits);
        CrdsFilter {
            filter,
            mask,
            mask_bits,
        }
    }

    fn compute_mask(seed: u64, mask_bits: u32) -> u64 {
        assert!(seed <= 2u64.checked_pow(mask_bits).unwrap_or(u64::MAX));
        let seed: u64 = seed.checked_shl(64 - mask_bits).unwrap_or(0x0);
        seed | (!0u64).checked_shr(mask_bits).unwrap_or(!0x0)
    }

    fn max_items(max_bits: f64, false_rate: f64, num_keys: f64) -> f64 {
        let m = max_bits;
        let p = false_rate;
        let k = num_keys;
        (m / (-k / (1f64 - (p.ln() / k).exp()).ln())).ceil()
    }

    fn mask_bits(num_items: f64, max_items: f64) -> u32 {
        // for small ratios this can result in a negative number, ensure it returns 0 instead
        (num_items / max_items).log2().ceil().max(0.0) as u32
    }

    pub fn hash_as_u64(item: &Hash) -> u64 {
        let buf = item.as_ref()[..8].try_into().unwrap();
        u64::from_le_bytes(buf)
    }

    pub fn test_mask(&self, item: &Hash) -> bool {
        // only consider the highest mask_bits bits from the hash and set the rest to 1.
        let ones = (!0u64).checked_shr(self.mask_bits).unwrap_or(!0u64);
        let bits = Self::hash_as_u64(item) | ones;
        bits == self.mask
    }

    pub fn add(&mut self, item: &Hash) {
        if self.test_mask(item) {
            self.filter.add(item);
        }
    }

    /// True when the peer should *not* send this record: either the filter
    /// owns a different hash prefix, or the bloom already claims it.
    pub fn contains(&self, item: &Hash) -> bool {
        if !self.test_mask(item) {
            return true;
        }
        self.filter.contains(item)
    }
}

/// A full partition of the hash space into `2^mask_bits` filters sharing
/// identical bloom parameters.
struct CrdsFilterSet {
    filters: Vec<CrdsFilter>,
    mask_bits: u32,
}

impl CrdsFilterSet {
    fn new(num_items: usize, max_bytes: usize) -> Self {
        let max_bits = (max_bytes * 8) as f64;
        let max_items = CrdsFilter::max_items(max_bits, FALSE_RATE, KEYS);
        let mask_bits = CrdsFilter::mask_bits(num_items as f64, max_items);
        let filters = (0..2u64.saturating_pow(mask_bits))
            .map(|seed| CrdsFilter {
                filter: Bloom::random(max_items as usize, FALSE_RATE, max_bits as usize),
                mask: CrdsFilter::compute_mask(seed, mask_bits),
                mask_bits,
            })
            .collect();
        Self { filters, mask_bits }
    }

    fn add(&mut self, hash: &Hash) {
        let index = CrdsFilter::hash_as_u64(hash)
            .checked_shr(64 - self.mask_bits)
            .unwrap_or(0);
        self.filters[index as usize].filter.add(hash);
    }
}

/// Builds the pull filters covering everything this node already knows:
/// live table records, recently purged hashes, and recently failed pull
/// inserts. The result is capped at `max_num_filters` by uniform sampling.
pub fn build_crds_filters(
    crds: &Crds,
    failed_pull_hashes: &[Hash],
    max_bloom_filter_bytes: usize,
    max_num_filters: usize,
) -> Vec<CrdsFilter> {
    let purged: Vec<Hash> = crds.purged.get_values();
    let num_items = crds.len() + purged.len() + failed_pull_hashes.len();
    let mut filter_set = CrdsFilterSet::new(num_items, max_bloom_filter_bytes);
    for versioned in crds.values() {
        filter_set.add(&versioned.value_hash);
    }
    for hash in purged.iter().chain(failed_pull_hashes) {
        filter_set.add(hash);
    }
    let mut filters = filter_set.filters;
    if filters.len() > max_num_filters {
        filters.shuffle(&mut rand::thread_rng());
        filters.truncate(max_num_filters);
    }
    filters
}

/// Table records matching the filter's hash partition, unknown to its bloom,
/// and no newer than the caller's wallclock. At most `max` records.
pub fn filter_crds_values(
    crds: &Crds,
    filter: &CrdsFilter,
    caller_wallclock: u64,
    max: usize,
) -> Vec<CrdsValue> {
    crds.values()
        .filter(|versioned| versioned.value.wallclock() <= caller_wallclock)
        .filter(|versioned| !filter.contains(&versioned.value_hash))
        .take(max)
        .map(|versioned| versioned.value.clone())
        .collect()
}
