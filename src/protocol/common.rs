use std::fmt;

use minicbor::Decoder;

use crate::cbor::{array_len, CborEncoder, CodecError};

/// A position on the chain: a slot and the hash of the block in it. The
/// origin (before the first block) has no hash and is encoded as `[]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Point {
    pub slot: u64,
    pub hash: Vec<u8>,
}

impl Point {
    pub fn new(slot: u64, hash: Vec<u8>) -> Self {
        Point { slot, hash }
    }

    pub fn origin() -> Self {
        Point {
            slot: 0,
            hash: vec![],
        }
    }

    pub fn is_origin(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn encode(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        if self.is_origin() {
            encoder.array(0)?;
        } else {
            encoder.array(2)?.u64(self.slot)?.bytes(&self.hash)?;
        }
        Ok(())
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, CodecError> {
        match array_len(decoder)? {
            0 => Ok(Point::origin()),
            2 => {
                let slot = decoder.u64()?;
                let hash = decoder.bytes()?.to_vec();
                Ok(Point { slot, hash })
            }
            found => Err(CodecError::SchemaMismatch {
                kind: "point",
                expected: 2,
                found,
            }),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_origin() {
            write!(f, "origin")
        } else {
            write!(f, "{}.{}", self.slot, hex::encode(&self.hash))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::Encoder;

    #[test]
    fn point_encoding() {
        let point = Point::new(42, vec![0xab; 32]);
        let mut encoder = Encoder::new(Vec::new());
        point.encode(&mut encoder).unwrap();
        let bytes = encoder.into_writer();
        assert_eq!(&bytes[..4], &[0x82, 0x18, 0x2a, 0x58]);
        assert_eq!(Point::decode(&mut Decoder::new(&bytes)).unwrap(), point);

        let mut encoder = Encoder::new(Vec::new());
        Point::origin().encode(&mut encoder).unwrap();
        assert_eq!(encoder.into_writer(), vec![0x80]);
        assert!(Point::decode(&mut Decoder::new(&[0x80])).unwrap().is_origin());
        assert_eq!(format!("{}", Point::new(1, vec![0x0f])), "1.0f");
    }
}
