use {
    crate::{
        contact_info::ContactInfo,
        crds_data::{CrdsData, EpochSlotsIndex},
    },
    serde::{Deserialize, Serialize},
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_sanitize::{Sanitize, SanitizeError},
    solana_signature::Signature,
    solana_signer::Signer,
    std::fmt,
};

/// CrdsValue that is replicated across the cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CrdsValue {
    signature: Signature,
    data: CrdsData,
}

impl CrdsValue {
    pub fn new(data: CrdsData, keypair: &Keypair) -> Self {
        let bincode_serialized_data = bincode::serialize(&data).unwrap();
        let signature = keypair.sign_message(&bincode_serialized_data);
        Self { signature, data }
    }

    /// Unsigned value; will not pass `verify`. Useful as a stand-in where
    /// signatures are checked separately.
    pub fn new_unsigned(data: CrdsData) -> Self {
        Self {
            signature: Signature::default(),
            data,
        }
    }

    #[inline]
    pub fn data(&self) -> &CrdsData {
        &self.data
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn verify(&self) -> bool {
        let bincode_serialized_data = bincode::serialize(&self.data).unwrap();
        self.signature
            .verify(self.pubkey().as_ref(), &bincode_serialized_data)
    }

    pub fn pubkey(&self) -> Pubkey {
        self.data.pubkey()
    }

    pub fn wallclock(&self) -> u64 {
        self.data.wallclock()
    }

    pub fn label(&self) -> CrdsValueLabel {
        match &self.data {
            CrdsData::ContactInfo(node) => CrdsValueLabel::ContactInfo(*node.pubkey()),
            CrdsData::EpochSlots(ix, slots) => CrdsValueLabel::EpochSlots(*ix, slots.from),
            CrdsData::Version(version) => CrdsValueLabel::Version(version.from),
        }
    }

    pub fn contact_info(&self) -> Option<&ContactInfo> {
        match &self.data {
            CrdsData::ContactInfo(node) => Some(node),
            _ => None,
        }
    }

}

impl Sanitize for CrdsValue {
    fn sanitize(&self) -> Result<(), SanitizeError> {
        self.data.sanitize()
    }
}

/// Identity of a record in the replicated table: origin plus kind (plus the
/// kind's index where a node may advertise several records of that kind).
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum CrdsValueLabel {
    ContactInfo(Pubkey),
    EpochSlots(EpochSlotsIndex, Pubkey),
    Version(Pubkey),
}

impl CrdsValueLabel {
    pub fn pubkey(&self) -> Pubkey {
        match self {
            CrdsValueLabel::ContactInfo(p) => *p,
            CrdsValueLabel::EpochSlots(_, p) => *p,
            CrdsValueLabel::Version(p) => *p,
        }
    }
}

impl fmt::Display for CrdsValueLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CrdsValueLabel::ContactInfo(p) => write!(f, "ContactInfo({p})"),
            CrdsValueLabel::EpochSlots(ix, p) => write!(f, "EpochSlots({ix}, {p})"),
            CrdsValueLabel::Version(p) => write!(f, "Version({p})"),
        }
    }
}
