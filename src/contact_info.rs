use {
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    solana_sanitize::{Sanitize, SanitizeError},
    std::net::{IpAddr, Ipv4Addr, SocketAddr},
};

use crate::crds_data::MAX_WALLCLOCK;

/// A node's advertised identity and gossip endpoint.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContactInfo {
    pubkey: Pubkey,
    wallclock: u64,
    shred_version: u16,
    gossip: SocketAddr,
}

impl ContactInfo {
    pub fn new(pubkey: Pubkey, wallclock: u64, shred_version: u16, gossip: SocketAddr) -> Self {
        Self {
            pubkey,
            wallclock,
            shred_version,
            gossip,
        }
    }

    pub fn new_localhost(pubkey: &Pubkey, wallclock: u64) -> Self {
        let gossip = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000);
        Self::new(*pubkey, wallclock, 0u16, gossip)
    }

    #[inline]
    pub fn pubkey(&self) -> &Pubkey {
        &self.pubkey
    }

    #[inline]
    pub fn wallclock(&self) -> u64 {
        self.wallclock
    }

    #[inline]
    pub fn shred_version(&self) -> u16 {
        self.shred_version
    }

    #[inline]
    pub fn gossip(&self) -> SocketAddr {
        self.gossip
    }

    pub fn set_wallclock(&mut self, wallclock: u64) {
        self.wallclock = wallclock;
    }

    pub fn set_gossip(&mut self, gossip: SocketAddr) {
        self.gossip = gossip;
    }
}

impl Sanitize for ContactInfo {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        if self.wallclock >= MAX_WALLCLOCK {
            return Err(SanitizeError::ValueOutOfBounds);
        }
        Ok(())
    }
}

/// Rejects socket addresses a peer cannot actually be reached at.
pub fn sanitize_socket(socket: &SocketAddr) -> Result<(), SanitizeError> {
    if socket.port() == 0 {
        return Err(SanitizeError::InvalidValue);
    }
    if socket.ip().is_unspecified() || socket.ip().is_multicast() {
        return Err(SanitizeError::InvalidValue);
    }
    Ok(())
}
