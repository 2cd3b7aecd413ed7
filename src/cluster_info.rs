//! The engine behind the gossip protocol: a shared replicated table, an
//! active set of push peers, and the message handlers and periodic loop that
//! keep both in sync with the rest of the cluster.

use {
    crate::{
        contact_info::{sanitize_socket, ContactInfo},
        crds::{Crds, HashTimeQueue, CRDS_UNIQUE_PUBKEY_CAPACITY},
        crds_data::CrdsData,
        crds_filter::{build_crds_filters, filter_crds_values, CrdsFilter, MAX_BLOOM_FILTER_BYTES},
        crds_value::{CrdsValue, CrdsValueLabel},
        gossip_error::GossipError,
        packet_builder::{build_gossip_packets, PacketMode},
        ping_pong::{Ping, Pong},
        protocol::{Protocol, PruneData},
        push_active_set::{PushActiveSet, NUM_ACTIVE_SET_ENTRIES},
    },
    crossbeam_channel::{Receiver, Sender},
    indexmap::IndexMap,
    rand::{Rng, SeedableRng},
    rand_chacha::ChaChaRng,
    solana_keypair::Keypair,
    solana_packet::{Packet, PACKET_DATA_SIZE},
    solana_pubkey::Pubkey,
    solana_sanitize::Sanitize,
    solana_signer::Signer,
    solana_time_utils::timestamp,
    std::{
        collections::HashSet,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, RwLock,
        },
        thread::sleep,
        time::{Duration, Instant},
    },
};

pub const CRDS_GOSSIP_PULL_CRDS_TIMEOUT_MS: u64 = 15_000;
pub const CRDS_GOSSIP_PUSH_MSG_TIMEOUT_MS: u64 = 30_000;
pub const CRDS_GOSSIP_PRUNE_MSG_TIMEOUT_MS: u64 = 500;
pub const FAILED_INSERTS_RETENTION_MS: u64 = 20_000;
/// Contact infos whose records have not been refreshed within this window are
/// not usable as gossip peers.
pub const GOSSIP_ACTIVE_TIMEOUT: u64 = 60_000;
pub const GOSSIP_SLEEP_MILLIS: u64 = 1_000;
pub const MAX_PRUNE_DATA_NODES: usize = 32;
// TODO: tune
pub const MAX_NUM_CRDS_VALUES_PULL_RESPONSE: usize = 100;
pub const MAX_NUM_PULL_REQUESTS: usize = 20;
const MAX_PACKETS_PER_PUSH: u64 = 64;
const MAX_BYTES_PER_PUSH: u64 = PACKET_DATA_SIZE as u64 * MAX_PACKETS_PER_PUSH;
/// Byte budget for the CRDS values of one push payload; the slack covers the
/// `Protocol` envelope (variant tag, pubkey, vector length) so the datagram
/// still fits a single packet.
pub const PUSH_MESSAGE_MAX_PAYLOAD_SIZE: usize = PACKET_DATA_SIZE - 44;
pub const PULL_RESPONSE_MAX_PAYLOAD_SIZE: usize = PACKET_DATA_SIZE - 44;
/// How many table entries one push pass scans from the cursor.
const MAX_VALUES_PER_PUSH_SCAN: usize = 512;
const REFRESH_PUSH_ACTIVE_SET_INTERVAL_MS: u64 = CRDS_GOSSIP_PULL_CRDS_TIMEOUT_MS / 2;
const PURGED_RETENTION_MS: u64 = 5 * CRDS_GOSSIP_PULL_CRDS_TIMEOUT_MS;

pub struct ClusterInfo {
    keypair: Arc<Keypair>,
    my_contact_info: RwLock<ContactInfo>,
    pub(crate) crds: RwLock<Crds>,
    pub(crate) active_set: RwLock<PushActiveSet>,
    pub(crate) push_queue: Mutex<Vec<CrdsValue>>,
    pub(crate) failed_pull_hashes: Mutex<HashTimeQueue>,
}

impl ClusterInfo {
    pub fn new(contact_info: ContactInfo, keypair: Arc<Keypair>) -> Self {
        Self {
            keypair,
            my_contact_info: RwLock::new(contact_info),
            crds: RwLock::new(Crds::default()),
            active_set: RwLock::new(PushActiveSet::default()),
            push_queue: Mutex::new(Vec::new()),
            failed_pull_hashes: Mutex::new(HashTimeQueue::default()),
        }
    }

    pub fn id(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn my_contact_info(&self) -> ContactInfo {
        self.my_contact_info.read().unwrap().clone()
    }

    pub fn my_shred_version(&self) -> u16 {
        self.my_contact_info.read().unwrap().shred_version()
    }

    /// Seeds a record directly into the table, e.g. a bootstrap entrypoint.
    pub fn insert_info(&self, value: CrdsValue) {
        let now = timestamp();
        if let Err(err) = self.crds.write().unwrap().insert(value, now) {
            debug!("insert_info failed: {err}");
        }
    }

    /// Stamps the node's own contact info with `now` and re-signs it.
    fn refreshed_contact_info_value(&self, now: u64) -> CrdsValue {
        let mut my_contact_info = self.my_contact_info.write().unwrap();
        my_contact_info.set_wallclock(now);
        CrdsValue::new(
            CrdsData::ContactInfo(my_contact_info.clone()),
            &self.keypair,
        )
    }

    // ------------------------------------------------------------------
    // Verifier: decode, sanitize, signature-check inbound packets.
    // ------------------------------------------------------------------

    pub(crate) fn run_socket_consume(
        &self,
        receiver: &Receiver<Packet>,
        sender: &Sender<(SocketAddr, Protocol)>,
        exit: &AtomicBool,
    ) {
        while !exit.load(Ordering::Relaxed) {
            let packets: Vec<Packet> = receiver.try_iter().collect();
            if packets.is_empty() {
                sleep(Duration::from_millis(1));
                continue;
            }
            for packet in packets {
                let from_addr = packet.meta().socket_addr();
                let protocol: Protocol = match packet.deserialize_slice(..) {
                    Ok(protocol) => protocol,
                    Err(err) => {
                        debug!("packet from {from_addr} failed to decode: {err}");
                        continue;
                    }
                };
                if let Err(err) = protocol.sanitize() {
                    debug!("message from {from_addr} failed sanitization: {err:?}");
                    continue;
                }
                if !protocol.verify() {
                    debug!("message from {from_addr} failed signature verification");
                    continue;
                }
                if sender.send((from_addr, protocol)).is_err() {
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Processor: dispatch verified messages, mutate shared state, respond.
    // ------------------------------------------------------------------

    pub(crate) fn run_listen(
        &self,
        receiver: &Receiver<(SocketAddr, Protocol)>,
        response_sender: &Sender<Packet>,
        exit: &AtomicBool,
    ) {
        while !exit.load(Ordering::Relaxed) {
            let messages: Vec<(SocketAddr, Protocol)> = receiver.try_iter().collect();
            if messages.is_empty() {
                sleep(Duration::from_millis(1));
                continue;
            }
            for (from_addr, protocol) in messages {
                self.handle_protocol_message(from_addr, protocol, response_sender);
                self.crds
                    .write()
                    .unwrap()
                    .attempt_trim(CRDS_UNIQUE_PUBKEY_CAPACITY);
            }
        }
    }

    fn handle_protocol_message(
        &self,
        from_addr: SocketAddr,
        protocol: Protocol,
        response_sender: &Sender<Packet>,
    ) {
        let now = timestamp();
        match protocol {
            Protocol::PushMessage(from, values) => {
                for packet in self.handle_push_message(&from, &values, now) {
                    let _ = response_sender.send(packet);
                }
            }
            Protocol::PullResponse(from, values) => {
                self.handle_pull_response(&from, &values, now);
            }
            Protocol::PullRequest(filter, caller) => {
                match self.handle_pull_request(from_addr, filter, caller, now) {
                    Ok(packets) => {
                        for packet in packets {
                            let _ = response_sender.send(packet);
                        }
                    }
                    Err(err) => error!("pull request from {from_addr} failed: {err}"),
                }
            }
            Protocol::PruneMessage(from, data) => {
                if let Err(err) = self.handle_prune_message(&data, now) {
                    error!("prune message from {from} failed: {err}");
                }
            }
            Protocol::PingMessage(ping) => match self.handle_ping(from_addr, &ping) {
                Ok(packet) => {
                    let _ = response_sender.send(packet);
                }
                Err(err) => error!("ping from {from_addr} failed: {err}"),
            },
            Protocol::PongMessage(pong) => self.handle_pong(from_addr, &pong),
        }
    }

    /// Inserts pushed values; answers with prune messages for origins whose
    /// records the table refused (duplicates, stale, already overridden).
    pub(crate) fn handle_push_message(
        &self,
        from: &Pubkey,
        values: &[CrdsValue],
        now: u64,
    ) -> Vec<Packet> {
        let failed_origins: HashSet<Pubkey> = {
            let mut crds = self.crds.write().unwrap();
            let results = crds.insert_values(
                values,
                now,
                CRDS_GOSSIP_PUSH_MSG_TIMEOUT_MS,
                /*record_timeouts:*/ false,
                /*update_origin_ts:*/ false,
            );
            results
                .failed
                .into_iter()
                .map(|index| values[index].pubkey())
                .collect()
        };
        if failed_origins.is_empty() {
            return Vec::new();
        }
        match self.build_prune_message(&failed_origins, from, now) {
            Ok(packets) => packets,
            Err(err) => {
                error!("no prune message for {from}: {err}");
                Vec::new()
            }
        }
    }

    /// One or more signed prune messages telling `destination` to stop
    /// forwarding the given origins to this node.
    pub(crate) fn build_prune_message(
        &self,
        failed_origins: &HashSet<Pubkey>,
        destination: &Pubkey,
        now: u64,
    ) -> Result<Vec<Packet>, GossipError> {
        let gossip_addr = {
            let crds = self.crds.read().unwrap();
            let label = CrdsValueLabel::ContactInfo(*destination);
            let node = crds
                .get(&label)
                .and_then(|versioned| versioned.value.contact_info())
                .ok_or(GossipError::ContactInfoNotFound)?;
            node.gossip()
        };
        sanitize_socket(&gossip_addr).map_err(|_| GossipError::InvalidGossipAddress)?;
        let self_pubkey = self.id();
        let prunes: Vec<Pubkey> = failed_origins
            .iter()
            .filter(|origin| **origin != self_pubkey)
            .copied()
            .collect();
        let mut packets = Vec::new();
        for chunk in prunes.chunks(MAX_PRUNE_DATA_NODES) {
            let data = PruneData::new(&self.keypair, chunk.to_vec(), *destination, now);
            let protocol = Protocol::PruneMessage(self_pubkey, data);
            packets.push(Packet::from_data(Some(&gossip_addr), &protocol)?);
        }
        Ok(packets)
    }

    /// Folds a pull response into the table. Values outside the acceptance
    /// window are force-inserted without touching origin timestamps; values
    /// the table refuses are remembered so the next pull filters them out.
    pub(crate) fn handle_pull_response(&self, from: &Pubkey, values: &[CrdsValue], now: u64) {
        let results = {
            let mut crds = self.crds.write().unwrap();
            let results = crds.insert_values(
                values,
                now,
                CRDS_GOSSIP_PULL_CRDS_TIMEOUT_MS,
                /*record_timeouts:*/ true,
                /*update_origin_ts:*/ true,
            );
            for &index in &results.timeouts {
                let _ = crds.insert(values[index].clone(), now);
            }
            results
        };
        trace!(
            "pull response from {from}: {} inserted, {} timed out, {} failed",
            results.inserted.len(),
            results.timeouts.len(),
            results.failed.len(),
        );
        if results.failed.is_empty() {
            return;
        }
        let mut failed_pull_hashes = self.failed_pull_hashes.lock().unwrap();
        failed_pull_hashes.trim(now.saturating_sub(FAILED_INSERTS_RETENTION_MS));
        for &index in &results.failed {
            let bytes = bincode::serialize(&values[index]).unwrap();
            failed_pull_hashes.push(solana_sha256_hasher::hash(&bytes), now);
        }
    }

    /// Answers a peer's pull filter with the records it is missing.
    pub(crate) fn handle_pull_request(
        &self,
        from_addr: SocketAddr,
        filter: CrdsFilter,
        caller: CrdsValue,
        now: u64,
    ) -> Result<Vec<Packet>, GossipError> {
        // TODO: once a ping cache is wired in, drop requests from peers that
        // have not answered a ping.
        let caller_pubkey = caller.pubkey();
        let caller_wallclock = caller.wallclock();
        let values = {
            let mut crds = self.crds.write().unwrap();
            let _ = crds.insert(caller, now);
            crds.update_record_timestamp(&caller_pubkey, now);
            filter_crds_values(
                &crds,
                &filter,
                caller_wallclock,
                MAX_NUM_CRDS_VALUES_PULL_RESPONSE,
            )
        };
        build_gossip_packets(
            PacketMode::PullResponse,
            self.id(),
            [(from_addr, values)],
            PULL_RESPONSE_MAX_PAYLOAD_SIZE as u64,
        )
    }

    pub(crate) fn handle_prune_message(
        &self,
        data: &PruneData,
        now: u64,
    ) -> Result<(), GossipError> {
        if data.wallclock < now.saturating_sub(CRDS_GOSSIP_PRUNE_MSG_TIMEOUT_MS) {
            return Err(GossipError::PruneMessageTimeout);
        }
        let self_pubkey = self.id();
        if data.destination != self_pubkey {
            return Err(GossipError::BadPruneDestination);
        }
        let active_set = self.active_set.read().unwrap();
        for origin in &data.prunes {
            if *origin != self_pubkey {
                active_set.prune(&data.pubkey, origin);
            }
        }
        Ok(())
    }

    pub(crate) fn handle_ping(
        &self,
        from_addr: SocketAddr,
        ping: &Ping,
    ) -> Result<Packet, GossipError> {
        let pong = Pong::new(ping, &self.keypair);
        let packet = Packet::from_data(Some(&from_addr), &Protocol::PongMessage(pong))?;
        Ok(packet)
    }

    fn handle_pong(&self, from_addr: SocketAddr, pong: &Pong) {
        // The cache of verified peers that would consume this is not wired in
        // yet; see `handle_pull_request`.
        trace!("pong from {} at {from_addr}", pong.from());
    }

    // ------------------------------------------------------------------
    // Builder: the periodic push/pull/rotate/trim loop.
    // ------------------------------------------------------------------

    pub(crate) fn run_gossip(&self, response_sender: &Sender<Packet>, exit: &AtomicBool) {
        let mut rng = rand::thread_rng();
        let mut push_cursor: u64 = 0;
        let mut should_send_pull_requests = true;
        let mut last_push_ts: u64 = 0;
        while !exit.load(Ordering::Relaxed) {
            let start = Instant::now();
            let now = timestamp();
            if should_send_pull_requests {
                match self.build_pull_requests(now) {
                    Ok(packets) => {
                        for packet in packets {
                            let _ = response_sender.send(packet);
                        }
                    }
                    Err(GossipError::NoPeers) => error!("no valid gossip peers to pull from"),
                    Err(err) => error!("building pull requests failed: {err}"),
                }
            }
            should_send_pull_requests = !should_send_pull_requests;
            self.drain_push_queue(now);
            match self.build_push_messages(&mut push_cursor, now) {
                Ok(packets) => {
                    for packet in packets {
                        let _ = response_sender.send(packet);
                    }
                }
                Err(err) => error!("building push messages failed: {err}"),
            }
            self.trim_memory(now);
            if now.saturating_sub(last_push_ts) > REFRESH_PUSH_ACTIVE_SET_INTERVAL_MS {
                self.refresh_push_self(now);
                self.rotate_active_set(&mut rng, now);
                last_push_ts = now;
            }
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            if let Some(time_left) = GOSSIP_SLEEP_MILLIS.checked_sub(elapsed) {
                sleep(Duration::from_millis(time_left));
            }
        }
    }

    /// Moves locally queued values into the table so the next push pass picks
    /// them up from the cursor.
    fn drain_push_queue(&self, now: u64) {
        // Lock order: push queue before the table.
        let mut push_queue = self.push_queue.lock().unwrap();
        let mut crds = self.crds.write().unwrap();
        for value in push_queue.drain(..) {
            let _ = crds.insert(value, now);
        }
    }

    /// Scans the table from the push cursor and fans fresh values out to the
    /// active-set peers that still want their origins.
    pub(crate) fn build_push_messages(
        &self,
        push_cursor: &mut u64,
        now: u64,
    ) -> Result<Vec<Packet>, GossipError> {
        let entries = {
            let crds = self.crds.read().unwrap();
            crds.get_entries_with_cursor(push_cursor, MAX_VALUES_PER_PUSH_SCAN)
        };
        let num_returned = entries.len();
        let mut num_considered = 0usize;
        let mut total_byte_size = 0u64;
        let mut groups: IndexMap<SocketAddr, Vec<CrdsValue>> = IndexMap::new();
        for versioned in &entries {
            let wallclock = versioned.value.wallclock();
            if wallclock < now.saturating_sub(CRDS_GOSSIP_PUSH_MSG_TIMEOUT_MS)
                || wallclock > now.saturating_add(CRDS_GOSSIP_PUSH_MSG_TIMEOUT_MS)
            {
                // Expired (or absurdly future-dated): spent, never retried.
                num_considered += 1;
                continue;
            }
            let size = bincode::serialized_size(&versioned.value)?;
            if total_byte_size + size > MAX_BYTES_PER_PUSH {
                break;
            }
            total_byte_size += size;
            let origin = versioned.value.pubkey();
            let peers = {
                let active_set = self.active_set.read().unwrap();
                let crds = self.crds.read().unwrap();
                active_set.get_fanout_peers(&origin, &crds)
            };
            for endpoint in peers {
                groups
                    .entry(endpoint)
                    .or_default()
                    .push(versioned.value.clone());
            }
            num_considered += 1;
        }
        // Values skipped by the byte budget are re-examined next pass; values
        // dropped as expired are not.
        *push_cursor -= (num_returned - num_considered) as u64;
        build_gossip_packets(
            PacketMode::PushMessage,
            self.id(),
            groups,
            PUSH_MESSAGE_MAX_PAYLOAD_SIZE as u64,
        )
    }

    /// One pull request per filter, each addressed to a random valid peer.
    pub(crate) fn build_pull_requests(&self, now: u64) -> Result<Vec<Packet>, GossipError> {
        let failed_pull_hashes = self.failed_pull_hashes.lock().unwrap().get_values();
        let (filters, peers) = {
            let crds = self.crds.read().unwrap();
            let filters = build_crds_filters(
                &crds,
                &failed_pull_hashes,
                MAX_BLOOM_FILTER_BYTES,
                MAX_NUM_PULL_REQUESTS,
            );
            let peers = self.gossip_nodes(&crds, MAX_NUM_PULL_REQUESTS, now);
            (filters, peers)
        };
        if peers.is_empty() {
            return Err(GossipError::NoPeers);
        }
        let self_contact_info = self.refreshed_contact_info_value(now);
        let mut rng = ChaChaRng::seed_from_u64(now);
        let mut packets = Vec::with_capacity(filters.len());
        for filter in filters {
            let peer = &peers[rng.gen_range(0..peers.len())];
            let protocol = Protocol::PullRequest(filter, self_contact_info.clone());
            packets.push(Packet::from_data(Some(&peer.gossip()), &protocol)?);
        }
        Ok(packets)
    }

    fn trim_memory(&self, now: u64) {
        {
            let mut crds = self.crds.write().unwrap();
            crds.purged.trim(now.saturating_sub(PURGED_RETENTION_MS));
            let num_evicted = crds.attempt_trim(CRDS_UNIQUE_PUBKEY_CAPACITY);
            if num_evicted > 0 {
                debug!("evicted {num_evicted} origins over table capacity");
            }
            crds.remove_old_labels(now, CRDS_GOSSIP_PULL_CRDS_TIMEOUT_MS);
        }
        self.failed_pull_hashes
            .lock()
            .unwrap()
            .trim(now.saturating_sub(FAILED_INSERTS_RETENTION_MS));
    }

    pub(crate) fn rotate_active_set<R: Rng>(&self, rng: &mut R, now: u64) {
        let peers: Vec<Pubkey> = {
            let crds = self.crds.read().unwrap();
            self.gossip_nodes(&crds, NUM_ACTIVE_SET_ENTRIES, now)
                .iter()
                .map(|node| *node.pubkey())
                .collect()
        };
        self.active_set.write().unwrap().rotate(
            rng,
            NUM_ACTIVE_SET_ENTRIES,
            CRDS_UNIQUE_PUBKEY_CAPACITY,
            &peers,
        );
    }

    /// Re-advertises this node and queues the record for the next push pass.
    fn refresh_push_self(&self, now: u64) {
        let value = self.refreshed_contact_info_value(now);
        self.push_queue.lock().unwrap().push(value);
    }

    /// Peers usable for pull requests and active-set rotation: recently
    /// active, not this node, matching shred version, reachable address.
    fn gossip_nodes(&self, crds: &Crds, max_size: usize, now: u64) -> Vec<ContactInfo> {
        let self_pubkey = self.id();
        let self_shred_version = self.my_shred_version();
        let active_cutoff = now.saturating_sub(GOSSIP_ACTIVE_TIMEOUT);
        crds.get_contact_infos()
            .filter(|versioned| versioned.local_timestamp >= active_cutoff)
            .filter_map(|versioned| versioned.value.contact_info())
            .filter(|node| *node.pubkey() != self_pubkey)
            .filter(|node| {
                self_shred_version == 0 || node.shred_version() == self_shred_version
            })
            .filter(|node| sanitize_socket(&node.gossip()).is_ok())
            .take(max_size)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::crds_data::EpochSlots,
        rand_chacha::ChaChaRng,
        solana_bloom::bloom::Bloom,
        solana_sha256_hasher::hash,
        std::{
            iter::repeat_with,
            net::{IpAddr, Ipv4Addr},
        },
    };

    fn new_test_cluster_info() -> ClusterInfo {
        let keypair = Arc::new(Keypair::new());
        let contact_info = ContactInfo::new(
            keypair.pubkey(),
            timestamp(),
            0,
            "127.0.0.1:8000".parse().unwrap(),
        );
        ClusterInfo::new(contact_info, keypair)
    }

    fn contact_info_value(keypair: &Keypair, wallclock: u64, port: u16) -> CrdsValue {
        let gossip = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let node = ContactInfo::new(keypair.pubkey(), wallclock, 0, gossip);
        CrdsValue::new(CrdsData::ContactInfo(node), keypair)
    }

    fn seed_contact_infos(cluster_info: &ClusterInfo, keypairs: &[Keypair], now: u64) {
        let mut crds = cluster_info.crds.write().unwrap();
        for (index, keypair) in keypairs.iter().enumerate() {
            let value = contact_info_value(keypair, now, 9000 + u16::try_from(index).unwrap());
            crds.insert(value, now).unwrap();
        }
    }

    #[test]
    fn test_handle_prune_message() {
        let mut rng = ChaChaRng::from_seed([61u8; 32]);
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let keypairs: Vec<Keypair> = repeat_with(Keypair::new).take(10).collect();
        seed_contact_infos(&cluster_info, &keypairs, now);
        cluster_info.rotate_active_set(&mut rng, now);
        assert!(!cluster_info.active_set.read().unwrap().is_empty());

        let peer0 = *cluster_info
            .active_set
            .read()
            .unwrap()
            .peers()
            .next()
            .unwrap();
        let peer0_keypair = keypairs
            .iter()
            .find(|keypair| keypair.pubkey() == peer0)
            .unwrap();
        let pruned_origin = Pubkey::new_unique();
        let data = PruneData::new(peer0_keypair, vec![pruned_origin], cluster_info.id(), now);
        assert!(data.verify());
        cluster_info.handle_prune_message(&data, now).unwrap();
        assert!(cluster_info
            .active_set
            .read()
            .unwrap()
            .is_pruned(&peer0, &pruned_origin));
    }

    #[test]
    fn test_handle_prune_message_rejections() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let sender = Keypair::new();
        // Stale wallclock.
        let stale = PruneData::new(
            &sender,
            vec![Pubkey::new_unique()],
            cluster_info.id(),
            now - CRDS_GOSSIP_PRUNE_MSG_TIMEOUT_MS - 1,
        );
        assert!(matches!(
            cluster_info.handle_prune_message(&stale, now),
            Err(GossipError::PruneMessageTimeout)
        ));
        // Someone else's destination.
        let misdirected = PruneData::new(&sender, vec![Pubkey::new_unique()], sender.pubkey(), now);
        assert!(matches!(
            cluster_info.handle_prune_message(&misdirected, now),
            Err(GossipError::BadPruneDestination)
        ));
    }

    #[test]
    fn test_handle_pull_response_idempotent() {
        let mut rng = ChaChaRng::from_seed([67u8; 32]);
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let values: Vec<CrdsValue> = repeat_with(|| {
            let keypair = Keypair::new();
            CrdsValue::new(
                CrdsData::EpochSlots(
                    rng.gen_range(0..crate::crds_data::MAX_EPOCH_SLOTS),
                    EpochSlots::new(keypair.pubkey(), now),
                ),
                &keypair,
            )
        })
        .take(5)
        .collect();
        let from = Pubkey::new_unique();
        cluster_info.handle_pull_response(&from, &values, now);
        {
            let crds = cluster_info.crds.read().unwrap();
            for value in &values {
                assert!(crds.get(&value.label()).is_some());
            }
        }
        assert!(cluster_info.failed_pull_hashes.lock().unwrap().is_empty());
        // Replaying the identical response inserts nothing and records every
        // value as a failed pull.
        cluster_info.handle_pull_response(&from, &values, now);
        assert_eq!(cluster_info.failed_pull_hashes.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_handle_pull_request_produces_responses() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        // Seed records whose hashes land in the lower half of the hash space.
        {
            let mut crds = cluster_info.crds.write().unwrap();
            let mut num_seeded = 0;
            while num_seeded < 8 {
                let keypair = Keypair::new();
                let value = contact_info_value(&keypair, now, 9100);
                let value_hash = hash(&bincode::serialize(&value).unwrap());
                if crate::crds_filter::CrdsFilter::hash_as_u64(&value_hash) >> 63 == 0 {
                    crds.insert(value, now).unwrap();
                    num_seeded += 1;
                }
            }
        }
        let filter = CrdsFilter {
            filter: Bloom::random(100, 0.1, 928 * 8),
            mask: !0u64 >> 1,
            mask_bits: 1,
        };
        let requester = Keypair::new();
        let caller = contact_info_value(&requester, now, 9200);
        let from_addr: SocketAddr = "127.0.0.1:9200".parse().unwrap();
        let packets = cluster_info
            .handle_pull_request(from_addr, filter, caller, now)
            .unwrap();
        assert!(!packets.is_empty());
        for packet in &packets {
            assert_eq!(packet.meta().socket_addr(), from_addr);
            assert!(packet.meta().size <= PACKET_DATA_SIZE);
            let protocol: Protocol = packet.deserialize_slice(..).unwrap();
            match protocol {
                Protocol::PullResponse(from, values) => {
                    assert_eq!(from, cluster_info.id());
                    assert!(!values.is_empty());
                }
                _ => panic!("expected a pull response"),
            }
        }
        // The requester's own contact info was folded into the table.
        assert!(cluster_info
            .crds
            .read()
            .unwrap()
            .get(&CrdsValueLabel::ContactInfo(requester.pubkey()))
            .is_some());
    }

    #[test]
    fn test_handle_push_message_builds_prunes() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let push_from = Keypair::new();
        cluster_info.insert_info(contact_info_value(&push_from, now, 9300));

        let values: Vec<CrdsValue> = repeat_with(|| {
            let keypair = Keypair::new();
            contact_info_value(&keypair, now, 9400)
        })
        .take(10)
        .collect();
        // First push inserts cleanly: no prunes owed.
        let packets = cluster_info.handle_push_message(&push_from.pubkey(), &values, now);
        assert!(packets.is_empty());
        // The identical push fails wholesale and earns a prune message.
        let packets = cluster_info.handle_push_message(&push_from.pubkey(), &values, now);
        assert!(!packets.is_empty());
        let protocol: Protocol = packets[0].deserialize_slice(..).unwrap();
        match protocol {
            Protocol::PruneMessage(from, data) => {
                assert_eq!(from, cluster_info.id());
                assert_eq!(data.pubkey, cluster_info.id());
                assert_eq!(data.destination, push_from.pubkey());
                assert_eq!(data.prunes.len(), 10);
                assert!(data.prunes.len() <= MAX_PRUNE_DATA_NODES);
                assert!(!data.prunes.contains(&cluster_info.id()));
                assert!(data.verify());
            }
            _ => panic!("expected a prune message"),
        }
    }

    #[test]
    fn test_build_prune_message_chunks_and_failures() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let destination = Keypair::new();
        let failed_origins: HashSet<Pubkey> =
            repeat_with(Pubkey::new_unique).take(70).collect();
        // Unknown destination.
        assert!(matches!(
            cluster_info.build_prune_message(&failed_origins, &destination.pubkey(), now),
            Err(GossipError::ContactInfoNotFound)
        ));
        // Destination with an unroutable gossip address.
        let unroutable = ContactInfo::new(
            destination.pubkey(),
            now,
            0,
            "0.0.0.0:0".parse().unwrap(),
        );
        cluster_info.insert_info(CrdsValue::new(
            CrdsData::ContactInfo(unroutable),
            &destination,
        ));
        assert!(matches!(
            cluster_info.build_prune_message(&failed_origins, &destination.pubkey(), now),
            Err(GossipError::InvalidGossipAddress)
        ));
        // Routable destination: 70 origins come out as three chunks of <= 32,
        // and this node never prunes itself.
        let destination = Keypair::new();
        cluster_info.insert_info(contact_info_value(&destination, now, 9500));
        let mut failed_origins = failed_origins;
        failed_origins.insert(cluster_info.id());
        let packets = cluster_info
            .build_prune_message(&failed_origins, &destination.pubkey(), now)
            .unwrap();
        assert_eq!(packets.len(), 3);
        let mut total = 0;
        for packet in &packets {
            let protocol: Protocol = packet.deserialize_slice(..).unwrap();
            let Protocol::PruneMessage(_, data) = protocol else {
                panic!("expected a prune message");
            };
            assert!(data.prunes.len() <= MAX_PRUNE_DATA_NODES);
            assert!(!data.prunes.contains(&cluster_info.id()));
            assert_eq!(data.destination, destination.pubkey());
            total += data.prunes.len();
        }
        assert_eq!(total, 70);
    }

    #[test]
    fn test_push_cursor_drains_table() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let keypairs: Vec<Keypair> = repeat_with(Keypair::new).take(30).collect();
        seed_contact_infos(&cluster_info, &keypairs, now);
        let mut rng = ChaChaRng::from_seed([71u8; 32]);
        cluster_info.rotate_active_set(&mut rng, now);

        let mut push_cursor = 0u64;
        let mut cursors = vec![push_cursor];
        // Repeated passes with no new writes advance the cursor monotonically
        // to the end of the stream and then hold it there.
        for _ in 0..4 {
            cluster_info
                .build_push_messages(&mut push_cursor, now)
                .unwrap();
            cursors.push(push_cursor);
        }
        assert!(cursors.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(push_cursor, 30);
        let packets = cluster_info
            .build_push_messages(&mut push_cursor, now)
            .unwrap();
        assert!(packets.is_empty());
        assert_eq!(push_cursor, 30);
    }

    #[test]
    fn test_push_skips_expired_values() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        let keypairs: Vec<Keypair> = repeat_with(Keypair::new).take(5).collect();
        seed_contact_infos(&cluster_info, &keypairs, now);
        let mut rng = ChaChaRng::from_seed([73u8; 32]);
        cluster_info.rotate_active_set(&mut rng, now);
        // A record far older than the push timeout, force-inserted.
        let expired = Keypair::new();
        {
            let mut crds = cluster_info.crds.write().unwrap();
            let value = contact_info_value(
                &expired,
                now - CRDS_GOSSIP_PUSH_MSG_TIMEOUT_MS - 1_000,
                9600,
            );
            crds.insert(value, now).unwrap();
        }
        let mut push_cursor = 0u64;
        let packets = cluster_info
            .build_push_messages(&mut push_cursor, now)
            .unwrap();
        // The expired record counts as considered: the cursor covers it and
        // it is never shipped.
        assert_eq!(push_cursor, 6);
        for packet in &packets {
            let protocol: Protocol = packet.deserialize_slice(..).unwrap();
            let Protocol::PushMessage(_, values) = protocol else {
                panic!("expected a push message");
            };
            assert!(values
                .iter()
                .all(|value| value.pubkey() != expired.pubkey()));
        }
    }

    #[test]
    fn test_build_pull_requests() {
        let cluster_info = new_test_cluster_info();
        let now = timestamp();
        assert!(matches!(
            cluster_info.build_pull_requests(now),
            Err(GossipError::NoPeers)
        ));
        let keypairs: Vec<Keypair> = repeat_with(Keypair::new).take(4).collect();
        seed_contact_infos(&cluster_info, &keypairs, now);
        let peer_sockets: Vec<SocketAddr> = (0..4)
            .map(|index| {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000 + index as u16)
            })
            .collect();
        let packets = cluster_info.build_pull_requests(now).unwrap();
        assert!(!packets.is_empty());
        for packet in &packets {
            assert!(packet.meta().size <= PACKET_DATA_SIZE);
            assert!(peer_sockets.contains(&packet.meta().socket_addr()));
            let protocol: Protocol = packet.deserialize_slice(..).unwrap();
            let Protocol::PullRequest(_, caller) = protocol else {
                panic!("expected a pull request");
            };
            // The advertised self record is refreshed and re-signed.
            assert_eq!(caller.pubkey(), cluster_info.id());
            assert_eq!(caller.wallclock(), now);
            assert!(caller.verify());
        }
    }

    #[test]
    fn test_gossip_nodes_filters() {
        // A node with a non-zero shred version ignores mismatched peers.
        let keypair = Arc::new(Keypair::new());
        let contact_info = ContactInfo::new(
            keypair.pubkey(),
            timestamp(),
            /*shred_version:*/ 1,
            "127.0.0.1:8000".parse().unwrap(),
        );
        let cluster_info = ClusterInfo::new(contact_info, keypair);
        let now = timestamp();
        let new_peer = |keypair: &Keypair, shred_version: u16, gossip: &str| {
            let node = ContactInfo::new(keypair.pubkey(), now, shred_version, gossip.parse().unwrap());
            CrdsValue::new(CrdsData::ContactInfo(node), keypair)
        };
        let good = Keypair::new();
        let stale = Keypair::new();
        let wrong_shred = Keypair::new();
        let bad_socket = Keypair::new();
        {
            let mut crds = cluster_info.crds.write().unwrap();
            crds.insert(new_peer(&good, 1, "127.0.0.1:9700"), now).unwrap();
            // Inserted long ago and never refreshed.
            crds.insert(
                new_peer(&stale, 1, "127.0.0.1:9701"),
                now - GOSSIP_ACTIVE_TIMEOUT - 1,
            )
            .unwrap();
            crds.insert(new_peer(&wrong_shred, 42, "127.0.0.1:9702"), now)
                .unwrap();
            crds.insert(new_peer(&bad_socket, 1, "0.0.0.0:0"), now)
                .unwrap();
            // This node's own record never counts as a peer.
            let value = cluster_info.refreshed_contact_info_value(now);
            crds.insert(value, now).unwrap();
        }
        let crds = cluster_info.crds.read().unwrap();
        let nodes = cluster_info.gossip_nodes(&crds, 25, now);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].pubkey(), &good.pubkey());
    }
}
