use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("prune destination does not match this node")]
    BadPruneDestination,
    #[error("no contact info for destination")]
    ContactInfoNotFound,
    #[error("destination gossip address failed sanitization")]
    InvalidGossipAddress,
    #[error("no valid gossip peers")]
    NoPeers,
    #[error("prune message wallclock is too old")]
    PruneMessageTimeout,
    #[error(transparent)]
    Serialize(#[from] bincode::Error),
    #[error("value of {0} bytes exceeds the packet payload bound")]
    ValueTooLarge(u64),
}
