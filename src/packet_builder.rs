//! Chunks groups of records into MTU-sized gossip datagrams.

use {
    crate::{crds_value::CrdsValue, gossip_error::GossipError, protocol::Protocol},
    solana_packet::Packet,
    solana_pubkey::Pubkey,
    std::net::SocketAddr,
};

#[derive(Clone, Copy, Debug)]
pub(crate) enum PacketMode {
    PushMessage,
    PullResponse,
}

impl PacketMode {
    fn wrap(self, from: Pubkey, values: Vec<CrdsValue>) -> Protocol {
        match self {
            PacketMode::PushMessage => Protocol::PushMessage(from, values),
            PacketMode::PullResponse => Protocol::PullResponse(from, values),
        }
    }
}

/// Streams each group's values into payload chunks of at most
/// `max_chunk_bytes`, wrapping every chunk as one `Protocol` envelope
/// addressed to the group's endpoint. The chunk bound leaves room for the
/// envelope itself, so each resulting datagram fits `PACKET_DATA_SIZE`.
///
/// A single value larger than `max_chunk_bytes` cannot be shipped at all and
/// fails the whole batch.
pub(crate) fn build_gossip_packets(
    mode: PacketMode,
    self_pubkey: Pubkey,
    groups: impl IntoIterator<Item = (SocketAddr, Vec<CrdsValue>)>,
    max_chunk_bytes: u64,
) -> Result<Vec<Packet>, GossipError> {
    let mut packets = Vec::new();
    for (endpoint, values) in groups {
        let mut chunk = Vec::new();
        let mut chunk_bytes = 0u64;
        for value in values {
            let size = bincode::serialized_size(&value)?;
            if size > max_chunk_bytes {
                return Err(GossipError::ValueTooLarge(size));
            }
            if chunk_bytes + size > max_chunk_bytes {
                let protocol = mode.wrap(self_pubkey, std::mem::take(&mut chunk));
                packets.push(Packet::from_data(Some(&endpoint), &protocol)?);
                chunk_bytes = 0;
            }
            chunk_bytes += size;
            chunk.push(value);
        }
        if !chunk.is_empty() {
            let protocol = mode.wrap(self_pubkey, chunk);
            packets.push(Packet::from_data(Some(&endpoint), &protocol)?);
        }
    }
    Ok(packets)
}
