//! Wire-level gossip messages. Every variant travels as one bincode-encoded
//! UDP datagram of at most `PACKET_DATA_SIZE` bytes.

use {
    crate::{
        crds_data::MAX_WALLCLOCK,
        crds_filter::CrdsFilter,
        crds_value::CrdsValue,
        ping_pong::{Ping, Pong},
    },
    serde::{Deserialize, Serialize},
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_sanitize::{Sanitize, SanitizeError},
    solana_signature::Signature,
    solana_signer::Signer,
};

#[derive(Debug, Deserialize, Serialize)]
pub enum Protocol {
    PullRequest(CrdsFilter, CrdsValue),
    PullResponse(Pubkey, Vec<CrdsValue>),
    PushMessage(Pubkey, Vec<CrdsValue>),
    PruneMessage(Pubkey, PruneData),
    PingMessage(Ping),
    PongMessage(Pong),
}

impl Sanitize for Protocol {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        match self {
            Protocol::PullRequest(filter, value) => {
                filter.sanitize()?;
                value.sanitize()
            }
            Protocol::PullResponse(from, values) | Protocol::PushMessage(from, values) => {
                from.sanitize()?;
                for value in values {
                    value.sanitize()?;
                }
                Ok(())
            }
            Protocol::PruneMessage(from, data) => {
                from.sanitize()?;
                data.sanitize()
            }
            Protocol::PingMessage(ping) => ping.sanitize(),
            Protocol::PongMessage(pong) => pong.sanitize(),
        }
    }
}

impl Protocol {
    /// Checks every signature the message carries. Messages with any invalid
    /// component are dropped whole by the verifier.
    pub fn verify(&self) -> bool {
        match self {
            Protocol::PullRequest(_, caller) => caller.verify(),
            Protocol::PullResponse(_, values) | Protocol::PushMessage(_, values) => {
                values.iter().all(CrdsValue::verify)
            }
            Protocol::PruneMessage(_, data) => data.verify(),
            Protocol::PingMessage(ping) => ping.verify(),
            Protocol::PongMessage(pong) => pong.verify(),
        }
    }
}

/// A signed assertion that `destination` should stop forwarding records
/// originating at `prunes` to the sender.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PruneData {
    /// Pubkey of the node that sent this prune data
    pub pubkey: Pubkey,
    /// Pubkeys of origins that should no longer be sent to pubkey
    pub prunes: Vec<Pubkey>,
    /// Signature of this Prune Message
    pub signature: Signature,
    /// The Pubkey of the intended node/destination for this message
    pub destination: Pubkey,
    /// Wallclock of the node that generated this message
    pub wallclock: u64,
}

impl PruneData {
    pub fn new(
        keypair: &Keypair,
        prunes: Vec<Pubkey>,
        destination: Pubkey,
        wallclock: u64,
    ) -> Self {
        let mut data = Self {
            pubkey: keypair.pubkey(),
            prunes,
            signature: Signature::default(),
            destination,
            wallclock,
        };
        data.signature = keypair.sign_message(&data.signable_data());
        data
    }

    fn signable_data(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct SignData<'a> {
            pubkey: &'a Pubkey,
            prunes: &'a [Pubkey],
            destination: &'a Pubkey,
            wallclock: u64,
        }
        bincode::serialize(&SignData {
            pubkey: &self.pubkey,
            prunes: &self.prunes,
            destination: &self.destination,
            wallclock: self.wallclock,
        })
        .unwrap()
    }

    pub fn verify(&self) -> bool {
        self.signature
            .verify(self.pubkey.as_ref(), &self.signable_data())
    }
}

impl Sanitize for PruneData {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        if self.wallclock >= MAX_WALLCLOCK {
            return Err(SanitizeError::ValueOutOfBounds);
        }
        if self.prunes.is_empty() {
            return Err(SanitizeError::InvalidValue);
        }
        Ok(())
    }
}
