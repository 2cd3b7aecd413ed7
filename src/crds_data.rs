use {
    crate::contact_info::ContactInfo,
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    solana_sanitize::{Sanitize, SanitizeError},
};

pub(crate) const MAX_WALLCLOCK: u64 = 1_000_000_000_000_000;

pub type EpochSlotsIndex = u8;
pub const MAX_EPOCH_SLOTS: EpochSlotsIndex = 255;

/// CrdsData that defines the different types of items CrdsValues can hold.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum CrdsData {
    ContactInfo(ContactInfo),
    EpochSlots(EpochSlotsIndex, EpochSlots),
    Version(Version),
}

impl Sanitize for CrdsData {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        match self {
            CrdsData::ContactInfo(node) => node.sanitize(),
            CrdsData::EpochSlots(ix, slots) => {
                if *ix >= MAX_EPOCH_SLOTS {
                    return Err(SanitizeError::ValueOutOfBounds);
                }
                slots.sanitize()
            }
            CrdsData::Version(version) => version.sanitize(),
        }
    }
}

impl CrdsData {
    pub(crate) fn wallclock(&self) -> u64 {
        match self {
            CrdsData::ContactInfo(node) => node.wallclock(),
            CrdsData::EpochSlots(_, slots) => slots.wallclock,
            CrdsData::Version(version) => version.wallclock,
        }
    }

    pub(crate) fn pubkey(&self) -> Pubkey {
        match self {
            CrdsData::ContactInfo(node) => *node.pubkey(),
            CrdsData::EpochSlots(_, slots) => slots.from,
            CrdsData::Version(version) => version.from,
        }
    }
}

/// Compressed bitmap of slots a node has completed for one epoch window.
/// The payload stays opaque to the gossip engine; only the origin and
/// wallclock take part in table semantics.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EpochSlots {
    pub from: Pubkey,
    pub wallclock: u64,
    pub first_slot: u64,
    #[serde(with = "serde_bytes")]
    pub slots: Vec<u8>,
}

impl Sanitize for EpochSlots {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        if self.wallclock >= MAX_WALLCLOCK {
            return Err(SanitizeError::ValueOutOfBounds);
        }
        Ok(())
    }
}

impl EpochSlots {
    pub fn new(from: Pubkey, wallclock: u64) -> Self {
        Self {
            from,
            wallclock,
            ..Self::default()
        }
    }

    pub fn new_rand<R: rand::Rng>(rng: &mut R, pubkey: Option<Pubkey>) -> Self {
        let from = pubkey.unwrap_or_else(Pubkey::new_unique);
        let mut slots = vec![0u8; rng.gen_range(0..128)];
        rng.fill(&mut slots[..]);
        Self {
            from,
            wallclock: rng.gen_range(0..MAX_WALLCLOCK),
            first_slot: rng.gen(),
            slots,
        }
    }
}

/// Software version a node advertises about itself.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Version {
    pub from: Pubkey,
    pub wallclock: u64,
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Sanitize for Version {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        if self.wallclock >= MAX_WALLCLOCK {
            return Err(SanitizeError::ValueOutOfBounds);
        }
        Ok(())
    }
}

impl Version {
    pub fn new(from: Pubkey, wallclock: u64) -> Self {
        Self {
            from,
            wallclock,
            major: 0,
            minor: 1,
            patch: 0,
        }
    }
}
