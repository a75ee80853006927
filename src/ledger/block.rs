use std::fmt;

use minicbor::data::Type;
use minicbor::Decoder;

use super::common::{blake2b_256, Blake2b256, BYRON_SLOTS_PER_EPOCH};
use crate::cbor::{array_len, skip_tag, write_tag, CborEncoder, CodecError, Fields, TaggedVariant};

const TAG_ENCODED_CBOR: u64 = 24;

/// The era a block belongs to, as numbered on the node-to-client wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    ByronEbb,
    ByronMain,
    Shelley,
    Allegra,
    Mary,
    Alonzo,
    Babbage,
    Conway,
}

impl BlockType {
    pub fn code(self) -> u64 {
        match self {
            BlockType::ByronEbb => 0,
            BlockType::ByronMain => 1,
            BlockType::Shelley => 2,
            BlockType::Allegra => 3,
            BlockType::Mary => 4,
            BlockType::Alonzo => 5,
            BlockType::Babbage => 6,
            BlockType::Conway => 7,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, CodecError> {
        let block_type = match code {
            0 => BlockType::ByronEbb,
            1 => BlockType::ByronMain,
            2 => BlockType::Shelley,
            3 => BlockType::Allegra,
            4 => BlockType::Mary,
            5 => BlockType::Alonzo,
            6 => BlockType::Babbage,
            7 => BlockType::Conway,
            _ => {
                return Err(CodecError::UnknownVariant {
                    kind: Block::KIND,
                    discriminant: code,
                })
            }
        };
        Ok(block_type)
    }

    pub fn era_name(self) -> &'static str {
        match self {
            BlockType::ByronEbb | BlockType::ByronMain => "Byron",
            BlockType::Shelley => "Shelley",
            BlockType::Allegra => "Allegra",
            BlockType::Mary => "Mary",
            BlockType::Alonzo => "Alonzo",
            BlockType::Babbage => "Babbage",
            BlockType::Conway => "Conway",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::ByronEbb => write!(f, "Byron EBB"),
            other => write!(f, "{}", other.era_name()),
        }
    }
}

///
/// A block as carried between node and client: `[block_type, 24(bytes)]`.
/// The block itself stays encoded; `header` parses just enough of it to
/// locate the block on the chain.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub block_type: BlockType,
    pub cbor: Vec<u8>,
}

impl TaggedVariant for Block {
    const KIND: &'static str = "block";

    fn discriminant(&self) -> u64 {
        self.block_type.code()
    }

    fn field_count(&self) -> u64 {
        1
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        write_tag(encoder, TAG_ENCODED_CBOR)?;
        encoder.bytes(&self.cbor)?;
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        let block_type = BlockType::from_code(discriminant)?;
        fields.expect_len(1)?;
        let cbor = fields.decode_with(|d| {
            skip_tag(d, TAG_ENCODED_CBOR)?;
            Ok(d.bytes()?.to_vec())
        })?;
        Ok(Block { block_type, cbor })
    }
}

impl Block {
    pub fn header(&self) -> Result<BlockHeader, CodecError> {
        BlockHeader::from_block_cbor(self.block_type, &self.cbor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: BlockType,
    pub block_number: u64,
    /// Absolute slot. Byron slots are converted from epoch and slot in epoch.
    pub slot: u64,
    /// Not present in epoch boundary blocks.
    pub issuer_vkey: Option<Vec<u8>>,
    pub block_body_size: Option<u64>,
    /// The header exactly as it was encoded.
    pub cbor: Vec<u8>,
}

fn expect_array(decoder: &mut Decoder, kind: &'static str, expected: u64) -> Result<(), CodecError> {
    let found = array_len(decoder)?;
    if found != expected {
        return Err(CodecError::SchemaMismatch {
            kind,
            expected,
            found,
        });
    }
    Ok(())
}

fn byron_slot(epoch: u64, slot_in_epoch: u64) -> Result<u64, CodecError> {
    epoch
        .checked_mul(BYRON_SLOTS_PER_EPOCH)
        .and_then(|slot| slot.checked_add(slot_in_epoch))
        .ok_or_else(|| CodecError::malformed("byron slot out of range"))
}

fn skip(decoder: &mut Decoder, count: usize) -> Result<(), CodecError> {
    for _ in 0..count {
        decoder.skip()?;
    }
    Ok(())
}

impl BlockHeader {
    /// Parse the header at the start of an encoded block.
    pub fn from_block_cbor(block_type: BlockType, block: &[u8]) -> Result<Self, CodecError> {
        let mut decoder = Decoder::new(block);
        let len = array_len(&mut decoder)?;
        if len < 3 {
            return Err(CodecError::SchemaMismatch {
                kind: "block",
                expected: 3,
                found: len,
            });
        }
        Self::decode(block_type, &mut decoder)
    }

    /// Parse an encoded header on its own.
    pub fn from_cbor(block_type: BlockType, header: &[u8]) -> Result<Self, CodecError> {
        let mut decoder = Decoder::new(header);
        let parsed = Self::decode(block_type, &mut decoder)?;
        if decoder.position() != header.len() {
            return Err(CodecError::malformed("trailing bytes after block header"));
        }
        Ok(parsed)
    }

    ///
    /// Blake2b-256 of the encoded header. Byron headers sit inside a
    /// two-element list tagged with their kind, `[0, header]` for an epoch
    /// boundary block and `[1, header]` for a main block, and that list
    /// header is hashed in front of the header bytes.
    ///
    pub fn hash(&self) -> Blake2b256 {
        let prefix: &[u8] = match self.block_type {
            BlockType::ByronEbb => &[0x82, 0x00],
            BlockType::ByronMain => &[0x82, 0x01],
            _ => &[],
        };
        blake2b_256(prefix, &self.cbor)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    fn decode(block_type: BlockType, decoder: &mut Decoder) -> Result<Self, CodecError> {
        let start = decoder.position();
        let mut header = match block_type {
            BlockType::ByronEbb => Self::decode_byron_ebb(decoder)?,
            BlockType::ByronMain => Self::decode_byron_main(decoder)?,
            _ => Self::decode_shelley(block_type, decoder)?,
        };
        header.cbor = decoder.input()[start..decoder.position()].to_vec();
        Ok(header)
    }

    // [protocol_magic, prev_block, body_proof, [epoch, [difficulty]], extra]
    fn decode_byron_ebb(decoder: &mut Decoder) -> Result<Self, CodecError> {
        expect_array(decoder, "byron ebb header", 5)?;
        skip(decoder, 3)?;
        expect_array(decoder, "byron ebb consensus data", 2)?;
        let epoch = decoder.u64()?;
        expect_array(decoder, "chain difficulty", 1)?;
        let block_number = decoder.u64()?;
        skip(decoder, 1)?;
        Ok(BlockHeader {
            block_type: BlockType::ByronEbb,
            block_number,
            slot: byron_slot(epoch, 0)?,
            issuer_vkey: None,
            block_body_size: None,
            cbor: vec![],
        })
    }

    // [protocol_magic, prev_block, body_proof,
    //  [[epoch, slot], pubkey, [difficulty], signature], extra]
    fn decode_byron_main(decoder: &mut Decoder) -> Result<Self, CodecError> {
        expect_array(decoder, "byron header", 5)?;
        skip(decoder, 3)?;
        expect_array(decoder, "byron consensus data", 4)?;
        expect_array(decoder, "byron slot id", 2)?;
        let epoch = decoder.u64()?;
        let slot_in_epoch = decoder.u64()?;
        let issuer_vkey = decoder.bytes()?.to_vec();
        expect_array(decoder, "chain difficulty", 1)?;
        let block_number = decoder.u64()?;
        skip(decoder, 2)?;
        Ok(BlockHeader {
            block_type: BlockType::ByronMain,
            block_number,
            slot: byron_slot(epoch, slot_in_epoch)?,
            issuer_vkey: Some(issuer_vkey),
            block_body_size: None,
            cbor: vec![],
        })
    }

    // [header_body, body_signature] where header_body starts with
    // [block_number, slot, prev_hash, issuer_vkey, vrf_vkey, ...]
    fn decode_shelley(block_type: BlockType, decoder: &mut Decoder) -> Result<Self, CodecError> {
        expect_array(decoder, "header", 2)?;
        // Babbage merged the two VRF results into one and grouped the
        // operational certificate and protocol version fields
        let (body_len, vrf_fields) = match block_type {
            BlockType::Babbage | BlockType::Conway => (10, 2),
            _ => (15, 3),
        };
        expect_array(decoder, "header body", body_len)?;
        let block_number = decoder.u64()?;
        let slot = decoder.u64()?;
        if decoder.datatype()? == Type::Null {
            decoder.null()?;
        } else {
            decoder.bytes()?;
        }
        let issuer_vkey = decoder.bytes()?.to_vec();
        skip(decoder, vrf_fields)?;
        let block_body_size = decoder.u64()?;
        // the rest of the body: 7 fields before Babbage, 3 after
        skip(decoder, (body_len - 4 - vrf_fields as u64 - 1) as usize)?;
        skip(decoder, 1)?;
        Ok(BlockHeader {
            block_type,
            block_number,
            slot,
            issuer_vkey: Some(issuer_vkey),
            block_body_size: Some(block_body_size),
            cbor: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor;

    fn encoder() -> CborEncoder {
        CborEncoder::new(Vec::new())
    }

    fn shelley_block(block_type: BlockType, block_number: u64, slot: u64) -> (Vec<u8>, Vec<u8>) {
        let babbage = matches!(block_type, BlockType::Babbage | BlockType::Conway);
        let mut e = encoder();
        e.array(2).unwrap();
        e.array(if babbage { 10 } else { 15 }).unwrap();
        e.u64(block_number).unwrap().u64(slot).unwrap();
        // prev hash, issuer vkey, vrf vkey
        e.bytes(&[0xaa; 32]).unwrap().bytes(&[0xcc; 32]).unwrap();
        e.bytes(&[0xbb; 32]).unwrap();
        if babbage {
            e.array(2).unwrap().bytes(&[0x01; 32]).unwrap().bytes(&[0x02; 80]).unwrap();
        } else {
            e.array(2).unwrap().bytes(&[0x01; 32]).unwrap().bytes(&[0x02; 80]).unwrap();
            e.array(2).unwrap().bytes(&[0x03; 32]).unwrap().bytes(&[0x04; 80]).unwrap();
        }
        e.u64(1024).unwrap().bytes(&[0xdd; 32]).unwrap();
        if babbage {
            e.array(4).unwrap();
            e.bytes(&[0x05; 32]).unwrap().u64(1).unwrap().u64(2).unwrap().bytes(&[0x06; 64]).unwrap();
            e.array(2).unwrap().u64(8).unwrap().u64(0).unwrap();
        } else {
            e.bytes(&[0x05; 32]).unwrap().u64(1).unwrap().u64(2).unwrap().bytes(&[0x06; 64]).unwrap();
            e.u64(6).unwrap().u64(0).unwrap();
        }
        e.bytes(&[0x07; 448]).unwrap();
        let header = e.into_writer();

        let mut e = encoder();
        e.array(4).unwrap();
        cbor::write_raw(&mut e, &header);
        e.array(0).unwrap().array(0).unwrap().map(0).unwrap();
        (e.into_writer(), header)
    }

    #[test]
    fn shelley_family_headers() {
        for block_type in [BlockType::Shelley, BlockType::Alonzo, BlockType::Babbage, BlockType::Conway] {
            let (block_cbor, header_cbor) = shelley_block(block_type, 7_000_000, 90_000_000);
            let block = Block {
                block_type,
                cbor: block_cbor,
            };
            let header = block.header().unwrap();
            assert_eq!(header.block_number, 7_000_000);
            assert_eq!(header.slot, 90_000_000);
            assert_eq!(header.issuer_vkey, Some(vec![0xcc; 32]));
            assert_eq!(header.block_body_size, Some(1024));
            assert_eq!(header.cbor, header_cbor);
            assert_eq!(BlockHeader::from_cbor(block_type, &header_cbor), Ok(header));
        }
    }

    #[test]
    fn wrong_header_shape_for_era() {
        let (_, header_cbor) = shelley_block(BlockType::Mary, 1, 2);
        assert_eq!(
            BlockHeader::from_cbor(BlockType::Babbage, &header_cbor),
            Err(CodecError::SchemaMismatch {
                kind: "header body",
                expected: 10,
                found: 15
            })
        );
    }

    #[test]
    fn byron_headers() {
        let mut e = encoder();
        e.array(5).unwrap();
        e.u64(764824073).unwrap().bytes(&[0x01; 32]).unwrap().array(0).unwrap();
        e.array(4).unwrap();
        e.array(2).unwrap().u64(100).unwrap().u64(5).unwrap();
        e.bytes(&[0x02; 64]).unwrap();
        e.array(1).unwrap().u64(2_160_005).unwrap();
        e.array(0).unwrap();
        e.array(0).unwrap();
        let header = e.into_writer();
        let parsed = BlockHeader::from_cbor(BlockType::ByronMain, &header).unwrap();
        assert_eq!(parsed.slot, 100 * 21600 + 5);
        assert_eq!(parsed.block_number, 2_160_005);
        assert_eq!(parsed.issuer_vkey, Some(vec![0x02; 64]));

        let mut e = encoder();
        e.array(5).unwrap();
        e.u64(764824073).unwrap().bytes(&[0x01; 32]).unwrap().array(0).unwrap();
        e.array(2).unwrap().u64(100).unwrap().array(1).unwrap().u64(2_160_000).unwrap();
        e.array(0).unwrap();
        let header = e.into_writer();
        let parsed = BlockHeader::from_cbor(BlockType::ByronEbb, &header).unwrap();
        assert_eq!(parsed.slot, 100 * 21600);
        assert_eq!(parsed.block_number, 2_160_000);
        assert_eq!(parsed.issuer_vkey, None);
    }

    #[test]
    fn byron_epoch_overflow_is_an_error() {
        let mut e = encoder();
        e.array(5).unwrap();
        e.u64(764824073).unwrap().bytes(&[0x01; 32]).unwrap().array(0).unwrap();
        e.array(2).unwrap().u64(u64::MAX).unwrap().array(1).unwrap().u64(1).unwrap();
        e.array(0).unwrap();
        assert!(matches!(
            BlockHeader::from_cbor(BlockType::ByronEbb, &e.into_writer()),
            Err(CodecError::MalformedEncoding { .. })
        ));

        let mut e = encoder();
        e.array(5).unwrap();
        e.u64(764824073).unwrap().bytes(&[0x01; 32]).unwrap().array(0).unwrap();
        e.array(4).unwrap();
        e.array(2).unwrap().u64(u64::MAX / BYRON_SLOTS_PER_EPOCH).unwrap().u64(u64::MAX).unwrap();
        e.bytes(&[0x02; 64]).unwrap();
        e.array(1).unwrap().u64(1).unwrap();
        e.array(0).unwrap();
        e.array(0).unwrap();
        assert!(matches!(
            BlockHeader::from_cbor(BlockType::ByronMain, &e.into_writer()),
            Err(CodecError::MalformedEncoding { .. })
        ));
    }

    #[test]
    fn header_hashes() {
        let ebb = hex::decode(
            "851a2d964a0958200101010101010101010101010101010101010101010101010101010101010101\
             80821864811a0020f58080",
        )
        .unwrap();
        let header = BlockHeader::from_cbor(BlockType::ByronEbb, &ebb).unwrap();
        assert_eq!(
            header.hash_hex(),
            "1ef01bf5c41bb4b1a5ac18965d7672862f7fa8db310b65bf94b72d870f5c2040"
        );
        // the same bytes hashed as a main block header get the other prefix
        let main = BlockHeader {
            block_type: BlockType::ByronMain,
            ..header.clone()
        };
        assert_eq!(
            main.hash_hex(),
            "b8cb8226d2a479c55cfdc5dc29da5660d474bdeffe07ede06362b64b1616d83d"
        );
        // later eras hash the header bytes alone
        let shelley = BlockHeader {
            block_type: BlockType::Shelley,
            ..header
        };
        assert_eq!(
            shelley.hash_hex(),
            "9ef447a77ce368b7f43a397881c8ac835d428c28198489fe54df09ab57bcb72d"
        );

        let (block_cbor, header_cbor) = shelley_block(BlockType::Babbage, 3, 4);
        let block = Block {
            block_type: BlockType::Babbage,
            cbor: block_cbor,
        };
        assert_eq!(block.header().unwrap().hash(), blake2b_256(&[], &header_cbor));
    }

    #[test]
    fn blake2b_256_of_nothing() {
        assert_eq!(
            hex::encode(blake2b_256(&[], &[])),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn block_wrapper() {
        let (block_cbor, _) = shelley_block(BlockType::Babbage, 3, 4);
        let block = Block {
            block_type: BlockType::Babbage,
            cbor: block_cbor,
        };
        let bytes = cbor::encode(&block).unwrap();
        // [6, 24(h'...')]
        assert_eq!(&bytes[..4], &[0x82, 0x06, 0xd8, 0x18]);
        assert_eq!(cbor::decode::<Block>(&bytes), Ok(block));

        assert_eq!(
            cbor::decode::<Block>(&[0x82, 0x08, 0x40]),
            Err(CodecError::UnknownVariant {
                kind: "block",
                discriminant: 8
            })
        );
        assert_eq!(BlockType::ByronEbb.to_string(), "Byron EBB");
        assert_eq!(BlockType::from_code(5), Ok(BlockType::Alonzo));
    }
}
