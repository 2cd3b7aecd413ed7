use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    serde_big_array::BigArray,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_sanitize::{Sanitize, SanitizeError},
    solana_signature::Signature,
    solana_signer::Signer,
};

pub const GOSSIP_PING_TOKEN_SIZE: usize = 32;
const PING_PONG_HASH_PREFIX: &[u8] = "CLUSTER_PING_PONG".as_bytes();

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Ping {
    from: Pubkey,
    #[serde(with = "BigArray")]
    token: [u8; GOSSIP_PING_TOKEN_SIZE],
    signature: Signature,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Pong {
    from: Pubkey,
    hash: Hash, // Hash of received ping token.
    signature: Signature,
}

impl Ping {
    pub fn new(token: [u8; GOSSIP_PING_TOKEN_SIZE], keypair: &Keypair) -> Self {
        let signature = keypair.sign_message(&token);
        Ping {
            from: keypair.pubkey(),
            token,
            signature,
        }
    }

    pub fn new_rand<R: Rng>(rng: &mut R, keypair: &Keypair) -> Self {
        let token = rng.gen::<[u8; GOSSIP_PING_TOKEN_SIZE]>();
        Self::new(token, keypair)
    }

    #[inline]
    pub fn from(&self) -> &Pubkey {
        &self.from
    }

    pub fn verify(&self) -> bool {
        self.signature.verify(self.from.as_ref(), &self.token)
    }
}

impl Sanitize for Ping {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        self.from.sanitize()?;
        self.signature.sanitize()
    }
}

impl Pong {
    pub fn new(ping: &Ping, keypair: &Keypair) -> Self {
        let hash = hash_ping_token(&ping.token);
        Pong {
            from: keypair.pubkey(),
            hash,
            signature: keypair.sign_message(hash.as_ref()),
        }
    }

    #[inline]
    pub fn from(&self) -> &Pubkey {
        &self.from
    }

    pub fn verify(&self) -> bool {
        self.signature.verify(self.from.as_ref(), self.hash.as_ref())
    }

    /// True when this pong answers the given ping's token.
    pub fn matches(&self, ping: &Ping) -> bool {
        self.hash == hash_ping_token(&ping.token)
    }
}

impl Sanitize for Pong {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        self.from.sanitize()?;
        self.hash.sanitize()?;
        self.signature.sanitize()
    }
}

fn hash_ping_token(token: &[u8; GOSSIP_PING_TOKEN_SIZE]) -> Hash {
    solana_sha256_hasher::hashv(&[PING_PONG_HASH_PREFIX, token])
}
