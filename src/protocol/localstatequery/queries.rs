use minicbor::Decoder;

use crate::cbor::{self, array_len, CborEncoder, CodecError, Fields, TaggedVariant};
use crate::protocol::common::Point;

pub const QUERY_TYPE_BLOCK: u64 = 0;
pub const QUERY_TYPE_SYSTEM_START: u64 = 1;
pub const QUERY_TYPE_CHAIN_BLOCK_NO: u64 = 2;
pub const QUERY_TYPE_CHAIN_POINT: u64 = 3;

pub const BLOCK_QUERY_TYPE_IF_CURRENT: u64 = 0;
pub const BLOCK_QUERY_TYPE_HARD_FORK: u64 = 2;
pub const HARD_FORK_QUERY_TYPE_CURRENT_ERA: u64 = 1;

pub const SHELLEY_QUERY_TYPE_EPOCH_NO: u64 = 1;
pub const SHELLEY_QUERY_TYPE_CURRENT_PROTOCOL_PARAMS: u64 = 3;
pub const SHELLEY_QUERY_TYPE_STAKE_DISTRIBUTION: u64 = 5;
pub const SHELLEY_QUERY_TYPE_GENESIS_CONFIG: u64 = 11;
pub const SHELLEY_QUERY_TYPE_REWARD_INFO_POOLS: u64 = 18;

///
/// An era specific query, kept as the exact CBOR the client sent. The
/// server hands it to the query callback untouched.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockQuery {
    raw: Vec<u8>,
}

impl BlockQuery {
    /// Wrap an encoded block query. Fails unless `raw` is one complete item.
    pub fn from_raw(raw: Vec<u8>) -> Result<Self, CodecError> {
        match cbor::item_length(&raw)? {
            Some(length) if length == raw.len() => Ok(BlockQuery { raw }),
            _ => Err(CodecError::malformed("block query is not a single data item")),
        }
    }

    /// `[0, [era, [query_type]]]`, a query without arguments sent to the
    /// ledger of the current era.
    pub fn shelley(era: u64, query_type: u64) -> Result<Self, CodecError> {
        let mut encoder = CborEncoder::new(Vec::new());
        encoder
            .array(2)?
            .u64(BLOCK_QUERY_TYPE_IF_CURRENT)?
            .array(2)?
            .u64(era)?
            .array(1)?
            .u64(query_type)?;
        Ok(BlockQuery {
            raw: encoder.into_writer(),
        })
    }

    /// `[2, [1]]`, the index of the era the node is currently in.
    pub fn current_era() -> Self {
        BlockQuery {
            raw: vec![0x82, 0x02, 0x81, 0x01],
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn block_query_type(&self) -> Option<u64> {
        cbor::decode_discriminant(&self.raw).ok()
    }

    /// The Shelley query type of a `[0, [era, [query_type, ...]]]` query.
    pub fn shelley_query_type(&self) -> Option<u64> {
        let mut decoder = Decoder::new(&self.raw);
        if array_len(&mut decoder).ok()? != 2 || decoder.u64().ok()? != BLOCK_QUERY_TYPE_IF_CURRENT {
            return None;
        }
        if array_len(&mut decoder).ok()? != 2 {
            return None;
        }
        decoder.u64().ok()?;
        if array_len(&mut decoder).ok()? == 0 {
            return None;
        }
        decoder.u64().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Block(BlockQuery),
    GetSystemStart,
    GetChainBlockNo,
    GetChainPoint,
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Block(query) => match query.shelley_query_type() {
                Some(SHELLEY_QUERY_TYPE_REWARD_INFO_POOLS) => "GetRewardInfoPools",
                _ => "BlockQuery",
            },
            Query::GetSystemStart => "GetSystemStart",
            Query::GetChainBlockNo => "GetChainBlockNo",
            Query::GetChainPoint => "GetChainPoint",
        }
    }

    /// Lowest protocol version that supports this query.
    pub fn required_version(&self) -> Option<u16> {
        match self {
            Query::GetChainBlockNo | Query::GetChainPoint => Some(10),
            Query::Block(query) => match query.shelley_query_type() {
                Some(SHELLEY_QUERY_TYPE_REWARD_INFO_POOLS) => Some(11),
                _ => None,
            },
            Query::GetSystemStart => None,
        }
    }
}

impl TaggedVariant for Query {
    const KIND: &'static str = "query";

    fn discriminant(&self) -> u64 {
        match self {
            Query::Block(_) => QUERY_TYPE_BLOCK,
            Query::GetSystemStart => QUERY_TYPE_SYSTEM_START,
            Query::GetChainBlockNo => QUERY_TYPE_CHAIN_BLOCK_NO,
            Query::GetChainPoint => QUERY_TYPE_CHAIN_POINT,
        }
    }

    fn field_count(&self) -> u64 {
        match self {
            Query::Block(_) => 1,
            _ => 0,
        }
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        if let Query::Block(query) = self {
            cbor::write_raw(encoder, query.raw());
        }
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        match discriminant {
            QUERY_TYPE_BLOCK => {
                fields.expect_len(1)?;
                Ok(Query::Block(BlockQuery { raw: fields.raw()? }))
            }
            QUERY_TYPE_SYSTEM_START => {
                fields.expect_len(0)?;
                Ok(Query::GetSystemStart)
            }
            QUERY_TYPE_CHAIN_BLOCK_NO => {
                fields.expect_len(0)?;
                Ok(Query::GetChainBlockNo)
            }
            QUERY_TYPE_CHAIN_POINT => {
                fields.expect_len(0)?;
                Ok(Query::GetChainPoint)
            }
            _ => Err(CodecError::UnknownVariant {
                kind: Self::KIND,
                discriminant,
            }),
        }
    }
}

/// Queries enabled by a negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub version: u16,
    pub get_chain_block_no: bool,
    pub get_chain_point: bool,
    pub get_reward_info_pools: bool,
}

impl Features {
    pub fn for_version(version: u16) -> Self {
        Features {
            version,
            get_chain_block_no: version >= 10,
            get_chain_point: version >= 10,
            get_reward_info_pools: version >= 11,
        }
    }

    pub fn permits(&self, query: &Query) -> bool {
        match query {
            Query::GetChainBlockNo => self.get_chain_block_no,
            Query::GetChainPoint => self.get_chain_point,
            Query::Block(_) if query.required_version() == Some(11) => self.get_reward_info_pools,
            _ => true,
        }
    }
}

// results

/// Chain start as reported by `GetSystemStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStart {
    pub year: u64,
    pub day: u64,
    pub picoseconds: u64,
}

impl SystemStart {
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut decoder = Decoder::new(bytes);
        let len = array_len(&mut decoder)?;
        if len != 3 {
            return Err(CodecError::SchemaMismatch {
                kind: "system start",
                expected: 3,
                found: len,
            });
        }
        Ok(SystemStart {
            year: decoder.u64()?,
            day: decoder.u64()?,
            picoseconds: decoder.u64()?,
        })
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, CodecError> {
        let mut encoder = CborEncoder::new(Vec::new());
        encoder
            .array(3)?
            .u64(self.year)?
            .u64(self.day)?
            .u64(self.picoseconds)?;
        Ok(encoder.into_writer())
    }
}

/// `GetChainBlockNo` result: `[0]` before the first block, `[1, block_no]` after.
pub fn chain_block_no_from_cbor(bytes: &[u8]) -> Result<Option<u64>, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let len = array_len(&mut decoder)?;
    match (decoder.u64()?, len) {
        (0, 1) => Ok(None),
        (1, 2) => Ok(Some(decoder.u64()?)),
        (0, _) | (1, _) => Err(CodecError::SchemaMismatch {
            kind: "chain block number",
            expected: 2,
            found: len,
        }),
        (discriminant, _) => Err(CodecError::UnknownVariant {
            kind: "chain block number",
            discriminant,
        }),
    }
}

pub fn chain_block_no_to_cbor(block_no: Option<u64>) -> Result<Vec<u8>, CodecError> {
    let mut encoder = CborEncoder::new(Vec::new());
    match block_no {
        Some(block_no) => {
            encoder.array(2)?.u64(1)?.u64(block_no)?;
        }
        None => {
            encoder.array(1)?.u64(0)?;
        }
    }
    Ok(encoder.into_writer())
}

pub fn chain_point_from_cbor(bytes: &[u8]) -> Result<Point, CodecError> {
    Point::decode(&mut Decoder::new(bytes))
}

pub fn chain_point_to_cbor(point: &Point) -> Result<Vec<u8>, CodecError> {
    let mut encoder = CborEncoder::new(Vec::new());
    point.encode(&mut encoder)?;
    Ok(encoder.into_writer())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shelley_query_type_is_found_through_the_era_wrapper() {
        let query = BlockQuery::shelley(5, SHELLEY_QUERY_TYPE_REWARD_INFO_POOLS).unwrap();
        // [0, [5, [18]]]
        assert_eq!(query.raw(), &[0x82, 0x00, 0x82, 0x05, 0x81, 0x12]);
        assert_eq!(query.block_query_type(), Some(BLOCK_QUERY_TYPE_IF_CURRENT));
        assert_eq!(query.shelley_query_type(), Some(SHELLEY_QUERY_TYPE_REWARD_INFO_POOLS));
        assert_eq!(BlockQuery::current_era().shelley_query_type(), None);
        assert_eq!(
            BlockQuery::current_era().block_query_type(),
            Some(BLOCK_QUERY_TYPE_HARD_FORK)
        );
    }

    #[test]
    fn block_query_must_be_one_item() {
        assert!(BlockQuery::from_raw(vec![0x82, 0x02, 0x81, 0x01]).is_ok());
        assert!(BlockQuery::from_raw(vec![0x82, 0x02]).is_err());
        assert!(BlockQuery::from_raw(vec![0x01, 0x02]).is_err());
    }

    #[test]
    fn query_encoding() {
        assert_eq!(cbor::encode(&Query::GetChainPoint), Ok(vec![0x81, 0x03]));
        let query = Query::Block(BlockQuery::current_era());
        let bytes = cbor::encode(&query).unwrap();
        assert_eq!(bytes, vec![0x82, 0x00, 0x82, 0x02, 0x81, 0x01]);
        assert_eq!(cbor::decode::<Query>(&bytes), Ok(query));
        assert_eq!(
            cbor::decode::<Query>(&[0x81, 0x09]),
            Err(CodecError::UnknownVariant {
                kind: "query",
                discriminant: 9
            })
        );
    }

    #[test]
    fn features_follow_version() {
        let reward_info = Query::Block(BlockQuery::shelley(5, SHELLEY_QUERY_TYPE_REWARD_INFO_POOLS).unwrap());
        let v9 = Features::for_version(9);
        assert!(!v9.permits(&Query::GetChainBlockNo));
        assert!(!v9.permits(&Query::GetChainPoint));
        assert!(v9.permits(&Query::GetSystemStart));
        let v10 = Features::for_version(10);
        assert!(v10.permits(&Query::GetChainBlockNo));
        assert!(!v10.permits(&reward_info));
        assert!(v10.permits(&Query::Block(BlockQuery::current_era())));
        assert!(Features::for_version(11).permits(&reward_info));
        assert_eq!(reward_info.name(), "GetRewardInfoPools");
    }

    #[test]
    fn result_shapes() {
        assert_eq!(chain_block_no_from_cbor(&[0x81, 0x00]), Ok(None));
        assert_eq!(
            chain_block_no_from_cbor(&chain_block_no_to_cbor(Some(1000)).unwrap()),
            Ok(Some(1000))
        );
        let start = SystemStart {
            year: 2017,
            day: 266,
            picoseconds: 0,
        };
        assert_eq!(SystemStart::from_cbor(&start.to_cbor().unwrap()), Ok(start));
        let point = Point::new(10, vec![1; 32]);
        assert_eq!(chain_point_from_cbor(&chain_point_to_cbor(&point).unwrap()), Ok(point));
    }
}
