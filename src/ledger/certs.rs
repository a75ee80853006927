use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use minicbor::data::Type;
use minicbor::Decoder;

use super::common::{
    AddrKeyHash, Blake2b224, Coin, Epoch, GenesisDelegateHash, GenesisHash, PoolKeyHash,
    PoolMetadataHash, ScriptHash, VrfKeyHash,
};
use crate::cbor::{
    self, array_len, fixed_bytes, skip_tag, write_tag, CborEncoder, CodecError, Fields, Preserved,
    TaggedVariant,
};

pub const CERTIFICATE_TYPE_STAKE_REGISTRATION: u64 = 0;
pub const CERTIFICATE_TYPE_STAKE_DEREGISTRATION: u64 = 1;
pub const CERTIFICATE_TYPE_STAKE_DELEGATION: u64 = 2;
pub const CERTIFICATE_TYPE_POOL_REGISTRATION: u64 = 3;
pub const CERTIFICATE_TYPE_POOL_RETIREMENT: u64 = 4;
pub const CERTIFICATE_TYPE_GENESIS_KEY_DELEGATION: u64 = 5;
pub const CERTIFICATE_TYPE_MOVE_INSTANTANEOUS_REWARDS: u64 = 6;

pub const STAKE_CREDENTIAL_TYPE_ADDR_KEY_HASH: u64 = 0;
pub const STAKE_CREDENTIAL_TYPE_SCRIPT_HASH: u64 = 1;

pub const POOL_RELAY_TYPE_SINGLE_HOST_ADDRESS: u64 = 0;
pub const POOL_RELAY_TYPE_SINGLE_HOST_NAME: u64 = 1;
pub const POOL_RELAY_TYPE_MULTI_HOST_NAME: u64 = 2;

const TAG_UNIT_INTERVAL: u64 = 30;
const TAG_SET: u64 = 258;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StakeCredential {
    AddrKeyHash(AddrKeyHash),
    ScriptHash(ScriptHash),
}

impl StakeCredential {
    pub fn hash(&self) -> &Blake2b224 {
        match self {
            StakeCredential::AddrKeyHash(hash) | StakeCredential::ScriptHash(hash) => hash,
        }
    }
}

impl TaggedVariant for StakeCredential {
    const KIND: &'static str = "stake credential";

    fn discriminant(&self) -> u64 {
        match self {
            StakeCredential::AddrKeyHash(_) => STAKE_CREDENTIAL_TYPE_ADDR_KEY_HASH,
            StakeCredential::ScriptHash(_) => STAKE_CREDENTIAL_TYPE_SCRIPT_HASH,
        }
    }

    fn field_count(&self) -> u64 {
        1
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        encoder.bytes(self.hash())?;
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        match discriminant {
            STAKE_CREDENTIAL_TYPE_ADDR_KEY_HASH => {
                fields.expect_len(1)?;
                Ok(StakeCredential::AddrKeyHash(fields.fixed_bytes()?))
            }
            STAKE_CREDENTIAL_TYPE_SCRIPT_HASH => {
                fields.expect_len(1)?;
                Ok(StakeCredential::ScriptHash(fields.fixed_bytes()?))
            }
            _ => Err(CodecError::UnknownVariant {
                kind: Self::KIND,
                discriminant,
            }),
        }
    }
}

/// A rational in `[0, 1]`, encoded as `30([numerator, denominator])`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitInterval {
    pub numerator: u64,
    pub denominator: u64,
}

impl UnitInterval {
    pub fn decode(decoder: &mut Decoder) -> Result<Self, CodecError> {
        skip_tag(decoder, TAG_UNIT_INTERVAL)?;
        let len = array_len(decoder)?;
        if len != 2 {
            return Err(CodecError::SchemaMismatch {
                kind: "unit interval",
                expected: 2,
                found: len,
            });
        }
        let numerator = decoder.u64()?;
        let denominator = decoder.u64()?;
        if denominator == 0 || numerator > denominator {
            return Err(CodecError::malformed(format!(
                "unit interval {}/{} out of range",
                numerator, denominator
            )));
        }
        Ok(UnitInterval {
            numerator,
            denominator,
        })
    }

    pub fn encode(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        write_tag(encoder, TAG_UNIT_INTERVAL)?;
        encoder.array(2)?.u64(self.numerator)?.u64(self.denominator)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetadata {
    pub url: String,
    pub hash: PoolMetadataHash,
}

impl PoolMetadata {
    fn decode(decoder: &mut Decoder) -> Result<Self, CodecError> {
        let len = array_len(decoder)?;
        if len != 2 {
            return Err(CodecError::SchemaMismatch {
                kind: "pool metadata",
                expected: 2,
                found: len,
            });
        }
        Ok(PoolMetadata {
            url: decoder.str()?.to_string(),
            hash: fixed_bytes(decoder)?,
        })
    }

    fn encode(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        encoder.array(2)?.str(&self.url)?.bytes(&self.hash)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolRelay {
    SingleHostAddress {
        port: Option<u16>,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    },
    SingleHostName {
        port: Option<u16>,
        dns_name: String,
    },
    MultiHostName {
        dns_name: String,
    },
}

fn encode_optional_port(encoder: &mut CborEncoder, port: Option<u16>) -> Result<(), CodecError> {
    match port {
        Some(port) => encoder.u16(port)?,
        None => encoder.null()?,
    };
    Ok(())
}

impl TaggedVariant for PoolRelay {
    const KIND: &'static str = "pool relay";

    fn discriminant(&self) -> u64 {
        match self {
            PoolRelay::SingleHostAddress { .. } => POOL_RELAY_TYPE_SINGLE_HOST_ADDRESS,
            PoolRelay::SingleHostName { .. } => POOL_RELAY_TYPE_SINGLE_HOST_NAME,
            PoolRelay::MultiHostName { .. } => POOL_RELAY_TYPE_MULTI_HOST_NAME,
        }
    }

    fn field_count(&self) -> u64 {
        match self {
            PoolRelay::SingleHostAddress { .. } => 3,
            PoolRelay::SingleHostName { .. } => 2,
            PoolRelay::MultiHostName { .. } => 1,
        }
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        match self {
            PoolRelay::SingleHostAddress { port, ipv4, ipv6 } => {
                encode_optional_port(encoder, *port)?;
                match ipv4 {
                    Some(ipv4) => encoder.bytes(&ipv4.octets())?,
                    None => encoder.null()?,
                };
                match ipv6 {
                    Some(ipv6) => encoder.bytes(&ipv6.octets())?,
                    None => encoder.null()?,
                };
            }
            PoolRelay::SingleHostName { port, dns_name } => {
                encode_optional_port(encoder, *port)?;
                encoder.str(dns_name)?;
            }
            PoolRelay::MultiHostName { dns_name } => {
                encoder.str(dns_name)?;
            }
        }
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        match discriminant {
            POOL_RELAY_TYPE_SINGLE_HOST_ADDRESS => {
                fields.expect_len(3)?;
                Ok(PoolRelay::SingleHostAddress {
                    port: fields.optional(|d| Ok(d.u16()?))?,
                    ipv4: fields.optional(|d| Ok(Ipv4Addr::from(fixed_bytes::<4>(d)?)))?,
                    ipv6: fields.optional(|d| Ok(Ipv6Addr::from(fixed_bytes::<16>(d)?)))?,
                })
            }
            POOL_RELAY_TYPE_SINGLE_HOST_NAME => {
                fields.expect_len(2)?;
                Ok(PoolRelay::SingleHostName {
                    port: fields.optional(|d| Ok(d.u16()?))?,
                    dns_name: fields.text()?,
                })
            }
            POOL_RELAY_TYPE_MULTI_HOST_NAME => {
                fields.expect_len(1)?;
                Ok(PoolRelay::MultiHostName {
                    dns_name: fields.text()?,
                })
            }
            _ => Err(CodecError::UnknownVariant {
                kind: Self::KIND,
                discriminant,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRegistration {
    pub operator: PoolKeyHash,
    pub vrf_key_hash: VrfKeyHash,
    pub pledge: Coin,
    pub cost: Coin,
    pub margin: UnitInterval,
    /// Reward address bytes, header byte included.
    pub reward_account: Vec<u8>,
    pub owners: Vec<AddrKeyHash>,
    pub relays: Vec<PoolRelay>,
    pub metadata: Option<PoolMetadata>,
}

fn decode_owners(decoder: &mut Decoder) -> Result<Vec<AddrKeyHash>, CodecError> {
    // sets carry tag 258 from the Conway era on
    skip_tag(decoder, TAG_SET)?;
    let len = array_len(decoder)?;
    (0..len).map(|_| fixed_bytes(decoder)).collect()
}

fn decode_relays(decoder: &mut Decoder) -> Result<Vec<PoolRelay>, CodecError> {
    let len = array_len(decoder)?;
    (0..len).map(|_| cbor::decode_from(decoder)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirSource {
    Reserves,
    Treasury,
}

impl MirSource {
    pub fn code(self) -> u64 {
        match self {
            MirSource::Reserves => 0,
            MirSource::Treasury => 1,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, CodecError> {
        match code {
            0 => Ok(MirSource::Reserves),
            1 => Ok(MirSource::Treasury),
            _ => Err(CodecError::UnknownVariant {
                kind: "mir source",
                discriminant: code,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirTarget {
    /// Reward deltas per stake credential. Deltas may be negative.
    StakeCredentials(BTreeMap<StakeCredential, i64>),
    /// Coin moved to the other pot.
    OtherPot(Coin),
}

///
/// The payload of a move instantaneous rewards certificate,
/// `[source, target]`. The target is either a map of stake credentials to
/// reward deltas or a single coin amount for the other pot; which one is
/// decided by the CBOR type of the second element. Any other type is an
/// `UnexpectedType` error, and a map or integer with broken contents fails
/// with the underlying error instead of being read as the other shape.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirReward {
    pub source: MirSource,
    pub target: MirTarget,
}

impl MirReward {
    pub fn decode(decoder: &mut Decoder) -> Result<Self, CodecError> {
        let len = array_len(decoder)?;
        if len != 2 {
            return Err(CodecError::SchemaMismatch {
                kind: "mir reward",
                expected: 2,
                found: len,
            });
        }
        let source = MirSource::from_code(decoder.u64()?)?;
        let target = match decoder.datatype()? {
            Type::Map => {
                let entries = decoder
                    .map()?
                    .ok_or_else(|| CodecError::malformed("indefinite-length mir reward map"))?;
                let mut rewards = BTreeMap::new();
                for _ in 0..entries {
                    let credential: StakeCredential = cbor::decode_from(decoder)?;
                    let delta = decoder.i64()?;
                    if rewards.insert(credential, delta).is_some() {
                        return Err(CodecError::malformed("duplicate stake credential in mir reward"));
                    }
                }
                MirTarget::StakeCredentials(rewards)
            }
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => MirTarget::OtherPot(decoder.u64()?),
            other => {
                return Err(CodecError::UnexpectedType {
                    kind: "mir reward",
                    expected: "map or unsigned integer",
                    found: format!("{:?}", other),
                })
            }
        };
        Ok(MirReward { source, target })
    }

    pub fn encode(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        encoder.array(2)?.u64(self.source.code())?;
        match &self.target {
            MirTarget::StakeCredentials(rewards) => {
                encoder.map(rewards.len() as u64)?;
                for (credential, delta) in rewards {
                    cbor::encode_into(credential, encoder)?;
                    encoder.i64(*delta)?;
                }
            }
            MirTarget::OtherPot(coin) => {
                encoder.u64(*coin)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Certificate {
    StakeRegistration(StakeCredential),
    StakeDeregistration(StakeCredential),
    StakeDelegation {
        credential: StakeCredential,
        pool: PoolKeyHash,
    },
    PoolRegistration(PoolRegistration),
    PoolRetirement {
        pool: PoolKeyHash,
        epoch: Epoch,
    },
    GenesisKeyDelegation {
        genesis_hash: GenesisHash,
        delegate_hash: GenesisDelegateHash,
        vrf_key_hash: VrfKeyHash,
    },
    MoveInstantaneousRewards(MirReward),
}

impl TaggedVariant for Certificate {
    const KIND: &'static str = "certificate";

    fn discriminant(&self) -> u64 {
        match self {
            Certificate::StakeRegistration(_) => CERTIFICATE_TYPE_STAKE_REGISTRATION,
            Certificate::StakeDeregistration(_) => CERTIFICATE_TYPE_STAKE_DEREGISTRATION,
            Certificate::StakeDelegation { .. } => CERTIFICATE_TYPE_STAKE_DELEGATION,
            Certificate::PoolRegistration(_) => CERTIFICATE_TYPE_POOL_REGISTRATION,
            Certificate::PoolRetirement { .. } => CERTIFICATE_TYPE_POOL_RETIREMENT,
            Certificate::GenesisKeyDelegation { .. } => CERTIFICATE_TYPE_GENESIS_KEY_DELEGATION,
            Certificate::MoveInstantaneousRewards(_) => CERTIFICATE_TYPE_MOVE_INSTANTANEOUS_REWARDS,
        }
    }

    fn field_count(&self) -> u64 {
        match self {
            Certificate::StakeRegistration(_)
            | Certificate::StakeDeregistration(_)
            | Certificate::MoveInstantaneousRewards(_) => 1,
            Certificate::StakeDelegation { .. } | Certificate::PoolRetirement { .. } => 2,
            Certificate::GenesisKeyDelegation { .. } => 3,
            Certificate::PoolRegistration(_) => 9,
        }
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        match self {
            Certificate::StakeRegistration(credential) | Certificate::StakeDeregistration(credential) => {
                cbor::encode_into(credential, encoder)?;
            }
            Certificate::StakeDelegation { credential, pool } => {
                cbor::encode_into(credential, encoder)?;
                encoder.bytes(pool)?;
            }
            Certificate::PoolRegistration(params) => {
                encoder
                    .bytes(&params.operator)?
                    .bytes(&params.vrf_key_hash)?
                    .u64(params.pledge)?
                    .u64(params.cost)?;
                params.margin.encode(encoder)?;
                encoder
                    .bytes(&params.reward_account)?
                    .array(params.owners.len() as u64)?;
                for owner in &params.owners {
                    encoder.bytes(owner)?;
                }
                encoder.array(params.relays.len() as u64)?;
                for relay in &params.relays {
                    cbor::encode_into(relay, encoder)?;
                }
                match &params.metadata {
                    Some(metadata) => metadata.encode(encoder)?,
                    None => {
                        encoder.null()?;
                    }
                }
            }
            Certificate::PoolRetirement { pool, epoch } => {
                encoder.bytes(pool)?.u64(*epoch)?;
            }
            Certificate::GenesisKeyDelegation {
                genesis_hash,
                delegate_hash,
                vrf_key_hash,
            } => {
                encoder
                    .bytes(genesis_hash)?
                    .bytes(delegate_hash)?
                    .bytes(vrf_key_hash)?;
            }
            Certificate::MoveInstantaneousRewards(reward) => {
                reward.encode(encoder)?;
            }
        }
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        match discriminant {
            CERTIFICATE_TYPE_STAKE_REGISTRATION => {
                fields.expect_len(1)?;
                Ok(Certificate::StakeRegistration(fields.tagged()?))
            }
            CERTIFICATE_TYPE_STAKE_DEREGISTRATION => {
                fields.expect_len(1)?;
                Ok(Certificate::StakeDeregistration(fields.tagged()?))
            }
            CERTIFICATE_TYPE_STAKE_DELEGATION => {
                fields.expect_len(2)?;
                Ok(Certificate::StakeDelegation {
                    credential: fields.tagged()?,
                    pool: fields.fixed_bytes()?,
                })
            }
            CERTIFICATE_TYPE_POOL_REGISTRATION => {
                fields.expect_len(9)?;
                Ok(Certificate::PoolRegistration(PoolRegistration {
                    operator: fields.fixed_bytes()?,
                    vrf_key_hash: fields.fixed_bytes()?,
                    pledge: fields.u64()?,
                    cost: fields.u64()?,
                    margin: fields.decode_with(UnitInterval::decode)?,
                    reward_account: fields.bytes()?,
                    owners: fields.decode_with(decode_owners)?,
                    relays: fields.decode_with(decode_relays)?,
                    metadata: fields.optional(PoolMetadata::decode)?,
                }))
            }
            CERTIFICATE_TYPE_POOL_RETIREMENT => {
                fields.expect_len(2)?;
                Ok(Certificate::PoolRetirement {
                    pool: fields.fixed_bytes()?,
                    epoch: fields.u64()?,
                })
            }
            CERTIFICATE_TYPE_GENESIS_KEY_DELEGATION => {
                fields.expect_len(3)?;
                Ok(Certificate::GenesisKeyDelegation {
                    genesis_hash: fields.fixed_bytes()?,
                    delegate_hash: fields.fixed_bytes()?,
                    vrf_key_hash: fields.fixed_bytes()?,
                })
            }
            CERTIFICATE_TYPE_MOVE_INSTANTANEOUS_REWARDS => {
                fields.expect_len(1)?;
                Ok(Certificate::MoveInstantaneousRewards(
                    fields.decode_with(MirReward::decode)?,
                ))
            }
            _ => Err(CodecError::UnknownVariant {
                kind: Self::KIND,
                discriminant,
            }),
        }
    }
}

/// A certificate with the bytes it arrived as.
pub type StoredCertificate = Preserved<Certificate>;

impl Certificate {
    pub fn from_cbor(bytes: &[u8]) -> Result<StoredCertificate, CodecError> {
        cbor::decode_preserved(bytes)
    }
}

/// Decode the certificate list of a transaction body, which may carry the
/// set tag.
pub fn decode_certificates(decoder: &mut Decoder) -> Result<Vec<StoredCertificate>, CodecError> {
    skip_tag(decoder, TAG_SET)?;
    let len = array_len(decoder)?;
    (0..len).map(|_| cbor::decode_preserved_from(decoder)).collect()
}
