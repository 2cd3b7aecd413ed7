//! Cluster Replicated Data Store: versioned, keyed storage of signed records
//! with a monotonically increasing ordinal stream consumed by the push loop.

use {
    crate::crds_value::{CrdsValue, CrdsValueLabel},
    indexmap::map::{Entry, IndexMap},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::hash,
    std::collections::{BTreeMap, HashMap, HashSet, VecDeque},
    thiserror::Error,
};

/// Number of distinct record origins the table is allowed to hold.
pub const CRDS_UNIQUE_PUBKEY_CAPACITY: usize = 8192;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrdsError {
    #[error("insert failed")]
    InsertFailed,
}

/// The stored form of a record: the value plus the hash of its encoding, the
/// local time it was (re)inserted, and its position in the insert stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedCrdsValue {
    pub value: CrdsValue,
    pub value_hash: Hash,
    pub local_timestamp: u64,
    pub ordinal: u64,
}

impl VersionedCrdsValue {
    fn new(value: CrdsValue, local_timestamp: u64, ordinal: u64) -> Self {
        let value_hash = hash(&bincode::serialize(&value).unwrap());
        Self {
            value,
            value_hash,
            local_timestamp,
            ordinal,
        }
    }
}

/// FIFO of record hashes tagged with their insertion time. Backs both the
/// purged list and the failed-pull-hashes queue.
#[derive(Clone, Debug, Default)]
pub struct HashTimeQueue {
    queue: VecDeque<(Hash, u64)>,
}

impl HashTimeQueue {
    pub fn push(&mut self, hash: Hash, now: u64) {
        self.queue.push_back((hash, now));
    }

    /// Drops entries older than `cutoff`. Entries are not assumed to be in
    /// timestamp order; eviction backfills the queue with older stamps.
    pub fn trim(&mut self, cutoff: u64) {
        self.queue.retain(|&(_, timestamp)| timestamp >= cutoff);
    }

    pub fn get_values(&self) -> Vec<Hash> {
        self.queue.iter().map(|&(hash, _)| hash).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CrdsInsertResults {
    pub inserted: Vec<usize>,
    pub timeouts: Vec<usize>,
    pub failed: Vec<usize>,
}

#[derive(Default)]
pub struct Crds {
    table: IndexMap<CrdsValueLabel, VersionedCrdsValue>,
    // Ordinal handed to the next insert.
    cursor: u64,
    // Ordinal of each live record, in insert order.
    entries: BTreeMap<u64, CrdsValueLabel>,
    // All labels currently advertised by each origin.
    records: HashMap<Pubkey, HashSet<CrdsValueLabel>>,
    // Hashes of records overridden, evicted or expired out of the table.
    pub purged: HashTimeQueue,
}

impl Crds {
    /// Returns true if the new value is more recent than what the table holds
    /// under the same label. Ties on wallclock break on the value hash.
    fn overrides(value: &CrdsValue, value_hash: &Hash, other: &VersionedCrdsValue) -> bool {
        match value.wallclock().cmp(&other.value.wallclock()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => *value_hash > other.value_hash,
        }
    }

    pub fn insert(&mut self, value: CrdsValue, now: u64) -> Result<(), CrdsError> {
        let label = value.label();
        let origin = value.pubkey();
        let versioned = VersionedCrdsValue::new(value, now, self.cursor);
        match self.table.entry(label) {
            Entry::Vacant(entry) => {
                self.entries.insert(versioned.ordinal, label);
                self.records.entry(origin).or_default().insert(label);
                entry.insert(versioned);
                self.cursor += 1;
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                if !Self::overrides(&versioned.value, &versioned.value_hash, entry.get()) {
                    return Err(CrdsError::InsertFailed);
                }
                let old = entry.insert(versioned);
                self.entries.remove(&old.ordinal);
                self.entries.insert(self.cursor, label);
                self.purged.push(old.value_hash, now);
                self.cursor += 1;
                Ok(())
            }
        }
    }

    /// Batch insert with a wallclock acceptance window of `now ± timeout_ms`.
    /// Out-of-window values land in `timeouts` when `record_timeouts`, in
    /// `failed` otherwise. With `update_origin_ts`, each inserted value also
    /// refreshes its origin's record timestamps.
    pub fn insert_values(
        &mut self,
        values: &[CrdsValue],
        now: u64,
        timeout_ms: u64,
        record_timeouts: bool,
        update_origin_ts: bool,
    ) -> CrdsInsertResults {
        let mut results = CrdsInsertResults::default();
        for (index, value) in values.iter().enumerate() {
            let wallclock = value.wallclock();
            if wallclock < now.saturating_sub(timeout_ms) || wallclock > now + timeout_ms {
                if record_timeouts {
                    results.timeouts.push(index);
                } else {
                    results.failed.push(index);
                }
                continue;
            }
            match self.insert(value.clone(), now) {
                Ok(()) => {
                    if update_origin_ts {
                        self.update_record_timestamp(&value.pubkey(), now);
                    }
                    results.inserted.push(index);
                }
                Err(_) => results.failed.push(index),
            }
        }
        results
    }

    pub fn get(&self, label: &CrdsValueLabel) -> Option<&VersionedCrdsValue> {
        self.table.get(label)
    }

    /// Records inserted at or after `*cursor`, in ordinal order, up to `max`.
    /// Advances the cursor one past the last record returned.
    pub fn get_entries_with_cursor(&self, cursor: &mut u64, max: usize) -> Vec<VersionedCrdsValue> {
        let mut out = Vec::with_capacity(max.min(self.entries.len()));
        for (&ordinal, label) in self.entries.range(*cursor..).take(max) {
            out.push(self.table[label].clone());
            *cursor = ordinal + 1;
        }
        out
    }

    pub fn get_contact_infos(&self) -> impl Iterator<Item = &VersionedCrdsValue> {
        self.table.iter().filter_map(|(label, versioned)| {
            matches!(label, CrdsValueLabel::ContactInfo(_)).then_some(versioned)
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &VersionedCrdsValue> {
        self.table.values()
    }

    /// Refreshes the local timestamp of every record of this origin.
    pub fn update_record_timestamp(&mut self, pubkey: &Pubkey, now: u64) {
        let Some(labels) = self.records.get(pubkey) else {
            return;
        };
        for label in labels {
            if let Some(versioned) = self.table.get_mut(label) {
                versioned.local_timestamp = versioned.local_timestamp.max(now);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn num_origins(&self) -> usize {
        self.records.len()
    }

    /// Evicts least-recently-active origins until at most `capacity` remain.
    /// Returns the number of origins evicted.
    pub fn attempt_trim(&mut self, capacity: usize) -> usize {
        if self.records.len() <= capacity {
            return 0;
        }
        let mut origins: Vec<(u64, Pubkey)> = self
            .records
            .iter()
            .map(|(origin, labels)| {
                let last_active = labels
                    .iter()
                    .filter_map(|label| self.table.get(label))
                    .map(|versioned| versioned.local_timestamp)
                    .max()
                    .unwrap_or_default();
                (last_active, *origin)
            })
            .collect();
        origins.sort_unstable();
        let num_evicted = self.records.len() - capacity;
        for (_, origin) in origins.into_iter().take(num_evicted) {
            self.remove_origin(&origin);
        }
        num_evicted
    }

    /// Drops records whose local timestamp predates `now − timeout_ms`.
    pub fn remove_old_labels(&mut self, now: u64, timeout_ms: u64) {
        let cutoff = now.saturating_sub(timeout_ms);
        let old_labels: Vec<CrdsValueLabel> = self
            .table
            .iter()
            .filter_map(|(label, versioned)| (versioned.local_timestamp < cutoff).then_some(*label))
            .collect();
        for label in old_labels {
            self.remove(&label);
        }
    }

    pub fn remove(&mut self, label: &CrdsValueLabel) {
        let Some(versioned) = self.table.swap_remove(label) else {
            return;
        };
        self.entries.remove(&versioned.ordinal);
        let origin = versioned.value.pubkey();
        if let Some(labels) = self.records.get_mut(&origin) {
            labels.remove(label);
            if labels.is_empty() {
                self.records.remove(&origin);
            }
        }
        self.purged
            .push(versioned.value_hash, versioned.local_timestamp);
    }

    fn remove_origin(&mut self, origin: &Pubkey) {
        let Some(labels) = self.records.remove(origin) else {
            return;
        };
        for label in labels {
            if let Some(versioned) = self.table.swap_remove(&label) {
                self.entries.remove(&versioned.ordinal);
                self.purged
                    .push(versioned.value_hash, versioned.local_timestamp);
            }
        }
    }
}
