/*!
# Tagged Variant Codec

Every polymorphic structure exchanged between Ouroboros nodes is encoded as a
CBOR array whose first element is an unsigned integer discriminant:

```bytes
[discriminant, field1, field2, ...]
```

No field names and no type names travel on the wire. A decoder reads the
discriminant, looks up the matching shape in a closed table and decodes the
remaining elements positionally. Types implementing `TaggedVariant` supply the
table (`decode_fields`) and the inverse (`encode_fields`); this module supplies
the framing around them.
*/
use std::convert::{Infallible, TryFrom};
use std::ops::Deref;

use minicbor::data::{Tag, Type};
use minicbor::{Decoder, Encoder};
use thiserror::Error;

/// Encoder writing into an owned buffer.
pub type CborEncoder = Encoder<Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown {kind} discriminant: {discriminant}")]
    UnknownVariant {
        kind: &'static str,
        discriminant: u64,
    },
    #[error("malformed encoding: {reason}")]
    MalformedEncoding { reason: String },
    #[error("{kind}: expected {expected} fields, found {found}")]
    SchemaMismatch {
        kind: &'static str,
        expected: u64,
        found: u64,
    },
    #[error("{kind}: expected {expected}, found {found}")]
    UnexpectedType {
        kind: &'static str,
        expected: &'static str,
        found: String,
    },
}

impl CodecError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        CodecError::MalformedEncoding {
            reason: reason.into(),
        }
    }
}

impl From<minicbor::decode::Error> for CodecError {
    fn from(err: minicbor::decode::Error) -> Self {
        CodecError::malformed(err.to_string())
    }
}

impl From<minicbor::encode::Error<Infallible>> for CodecError {
    fn from(err: minicbor::encode::Error<Infallible>) -> Self {
        CodecError::malformed(err.to_string())
    }
}

/// A closed union encoded as `[discriminant, field...]`.
pub trait TaggedVariant: Sized {
    /// Human readable name of the union, used in errors.
    const KIND: &'static str;

    fn discriminant(&self) -> u64;

    /// Number of fields following the discriminant.
    fn field_count(&self) -> u64;

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError>;

    /// Decode the fields of the variant selected by `discriminant`. Must return
    /// `CodecError::UnknownVariant` for discriminants outside the closed set.
    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError>;
}

/// Positional cursor over the fields of one tagged variant.
pub struct Fields<'a, 'b> {
    kind: &'static str,
    decoder: &'a mut Decoder<'b>,
    len: u64,
    read: u64,
}

impl<'a, 'b> Fields<'a, 'b> {
    /// Number of fields present after the discriminant.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fail with `SchemaMismatch` unless exactly `expected` fields follow the
    /// discriminant.
    pub fn expect_len(&self, expected: u64) -> Result<(), CodecError> {
        if self.len != expected {
            return Err(CodecError::SchemaMismatch {
                kind: self.kind,
                expected,
                found: self.len,
            });
        }
        Ok(())
    }

    fn next(&mut self) -> Result<&mut Decoder<'b>, CodecError> {
        if self.read >= self.len {
            return Err(CodecError::SchemaMismatch {
                kind: self.kind,
                expected: self.read + 1,
                found: self.len,
            });
        }
        self.read += 1;
        Ok(&mut *self.decoder)
    }

    /// CBOR type of the next field, without consuming it.
    pub fn peek_type(&self) -> Result<Type, CodecError> {
        Ok(self.decoder.datatype()?)
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(self.next()?.u64()?)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let value = self.u64()?;
        u32::try_from(value).map_err(|_| CodecError::malformed(format!("{value} out of range for u32")))
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let value = self.u64()?;
        u16::try_from(value).map_err(|_| CodecError::malformed(format!("{value} out of range for u16")))
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.next()?.i64()?)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(self.next()?.bytes()?.to_vec())
    }

    pub fn fixed_bytes<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        fixed_bytes(self.next()?)
    }

    pub fn text(&mut self) -> Result<String, CodecError> {
        Ok(self.next()?.str()?.to_string())
    }

    /// A nullable field. `f` is only called when the field is not `null`.
    pub fn optional<T, F>(&mut self, f: F) -> Result<Option<T>, CodecError>
    where
        F: FnOnce(&mut Decoder<'b>) -> Result<T, CodecError>,
    {
        let decoder = self.next()?;
        if decoder.datatype()? == Type::Null {
            decoder.null()?;
            return Ok(None);
        }
        f(decoder).map(Some)
    }

    /// A nested tagged variant.
    pub fn tagged<T: TaggedVariant>(&mut self) -> Result<T, CodecError> {
        decode_from(self.next()?)
    }

    /// The exact bytes of the next data item, undecoded.
    pub fn raw(&mut self) -> Result<Vec<u8>, CodecError> {
        raw_item(self.next()?)
    }

    /// Decode the next field with a custom shape.
    pub fn decode_with<T, F>(&mut self, f: F) -> Result<T, CodecError>
    where
        F: FnOnce(&mut Decoder<'b>) -> Result<T, CodecError>,
    {
        f(self.next()?)
    }
}

/// Read a definite-length array header.
pub fn array_len(decoder: &mut Decoder) -> Result<u64, CodecError> {
    match decoder.array()? {
        Some(len) => Ok(len),
        None => Err(CodecError::malformed("indefinite-length array")),
    }
}

pub fn fixed_bytes<const N: usize>(decoder: &mut Decoder) -> Result<[u8; N], CodecError> {
    let bytes = decoder.bytes()?;
    <[u8; N]>::try_from(bytes).map_err(|_| {
        CodecError::malformed(format!("expected {} bytes, found {}", N, bytes.len()))
    })
}

/// Read an optional CBOR tag, failing if it is present and not `expected`.
pub fn skip_tag(decoder: &mut Decoder, expected: u64) -> Result<(), CodecError> {
    if decoder.datatype()? == Type::Tag {
        let tag = decoder.tag()?;
        if tag.as_u64() != expected {
            return Err(CodecError::malformed(format!(
                "unexpected tag {}, expected {}",
                tag.as_u64(),
                expected
            )));
        }
    }
    Ok(())
}

pub fn write_tag(encoder: &mut CborEncoder, tag: u64) -> Result<(), CodecError> {
    encoder.tag(Tag::new(tag))?;
    Ok(())
}

/// Copy the bytes of one complete data item out of the decoder.
pub fn raw_item(decoder: &mut Decoder) -> Result<Vec<u8>, CodecError> {
    let start = decoder.position();
    decoder.skip()?;
    Ok(decoder.input()[start..decoder.position()].to_vec())
}

/// Append already encoded CBOR to the encoder output.
pub fn write_raw(encoder: &mut CborEncoder, raw: &[u8]) {
    encoder.writer_mut().extend_from_slice(raw);
}

/// Read only the leading discriminant of a tagged variant.
pub fn decode_discriminant(bytes: &[u8]) -> Result<u64, CodecError> {
    let mut decoder = Decoder::new(bytes);
    if array_len(&mut decoder)? == 0 {
        return Err(CodecError::malformed("missing discriminant"));
    }
    Ok(decoder.u64()?)
}

/// Decode a tagged variant starting at the decoder's position.
pub fn decode_from<T: TaggedVariant>(decoder: &mut Decoder) -> Result<T, CodecError> {
    let len = array_len(decoder)?;
    if len == 0 {
        return Err(CodecError::malformed(format!("{}: missing discriminant", T::KIND)));
    }
    let discriminant = decoder.u64()?;
    let mut fields = Fields {
        kind: T::KIND,
        decoder,
        len: len - 1,
        read: 0,
    };
    let value = T::decode_fields(discriminant, &mut fields)?;
    if fields.read != fields.len {
        return Err(CodecError::SchemaMismatch {
            kind: T::KIND,
            expected: fields.read,
            found: fields.len,
        });
    }
    Ok(value)
}

/// Decode a complete buffer holding exactly one tagged variant.
pub fn decode<T: TaggedVariant>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let value = decode_from(&mut decoder)?;
    if decoder.position() != bytes.len() {
        return Err(CodecError::malformed(format!(
            "{}: {} trailing bytes",
            T::KIND,
            bytes.len() - decoder.position()
        )));
    }
    Ok(value)
}

///
/// A decoded tagged variant together with the bytes it was decoded from.
/// Re-encoding the value gives the canonical form, which need not match what
/// the peer sent (optional tags, non-minimal integers); `cbor` returns the
/// original.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preserved<T> {
    value: T,
    cbor: Vec<u8>,
}

impl<T: TaggedVariant> Preserved<T> {
    /// Wrap a locally built value with its canonical encoding.
    pub fn new(value: T) -> Result<Self, CodecError> {
        let cbor = encode(&value)?;
        Ok(Preserved { value, cbor })
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cbor(&self) -> &[u8] {
        &self.cbor
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    /// Write the original bytes, not a re-encoding.
    pub fn encode_into(&self, encoder: &mut CborEncoder) {
        write_raw(encoder, &self.cbor);
    }
}

impl<T> Deref for Preserved<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

pub fn decode_preserved_from<T: TaggedVariant>(decoder: &mut Decoder) -> Result<Preserved<T>, CodecError> {
    let start = decoder.position();
    let value = decode_from(decoder)?;
    let cbor = decoder.input()[start..decoder.position()].to_vec();
    Ok(Preserved { value, cbor })
}

pub fn decode_preserved<T: TaggedVariant>(bytes: &[u8]) -> Result<Preserved<T>, CodecError> {
    let value = decode(bytes)?;
    Ok(Preserved {
        value,
        cbor: bytes.to_vec(),
    })
}

pub fn encode_into<T: TaggedVariant>(value: &T, encoder: &mut CborEncoder) -> Result<(), CodecError> {
    encoder
        .array(1 + value.field_count())?
        .u64(value.discriminant())?;
    value.encode_fields(encoder)
}

pub fn encode<T: TaggedVariant>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(Vec::new());
    encode_into(value, &mut encoder)?;
    Ok(encoder.into_writer())
}

/// Length of the first complete data item in `bytes`, or `None` when the
/// buffer ends before the item does.
pub fn item_length(bytes: &[u8]) -> Result<Option<usize>, CodecError> {
    let mut decoder = Decoder::new(bytes);
    match decoder.skip() {
        Ok(()) => Ok(Some(decoder.position())),
        Err(err) if err.is_end_of_input() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Shape {
        Point { x: u64, y: u64 },
        Label(String),
        Empty,
    }

    impl TaggedVariant for Shape {
        const KIND: &'static str = "shape";

        fn discriminant(&self) -> u64 {
            match self {
                Shape::Point { .. } => 0,
                Shape::Label(_) => 1,
                Shape::Empty => 2,
            }
        }

        fn field_count(&self) -> u64 {
            match self {
                Shape::Point { .. } => 2,
                Shape::Label(_) => 1,
                Shape::Empty => 0,
            }
        }

        fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
            match self {
                Shape::Point { x, y } => {
                    encoder.u64(*x)?.u64(*y)?;
                }
                Shape::Label(label) => {
                    encoder.str(label)?;
                }
                Shape::Empty => {}
            }
            Ok(())
        }

        fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
            match discriminant {
                0 => {
                    fields.expect_len(2)?;
                    Ok(Shape::Point {
                        x: fields.u64()?,
                        y: fields.u64()?,
                    })
                }
                1 => {
                    fields.expect_len(1)?;
                    Ok(Shape::Label(fields.text()?))
                }
                2 => {
                    fields.expect_len(0)?;
                    Ok(Shape::Empty)
                }
                _ => Err(CodecError::UnknownVariant {
                    kind: Self::KIND,
                    discriminant,
                }),
            }
        }
    }

    #[test]
    fn decode_discriminant_reads_leading_tag_only() {
        // [1, <truncated text>]
        let bytes = [0x82, 0x01, 0x65, b'a'];
        assert_eq!(decode_discriminant(&bytes), Ok(1));
    }

    #[test]
    fn decode_point_fixture() {
        let bytes = [0x83, 0x00, 0x05, 0x18, 0x2a];
        assert_eq!(decode::<Shape>(&bytes), Ok(Shape::Point { x: 5, y: 42 }));
        assert_eq!(encode(&Shape::Point { x: 5, y: 42 }).unwrap(), bytes.to_vec());
    }

    #[test]
    fn unknown_discriminant_is_not_defaulted() {
        let bytes = [0x81, 0x07];
        assert_eq!(
            decode::<Shape>(&bytes),
            Err(CodecError::UnknownVariant {
                kind: "shape",
                discriminant: 7
            })
        );
    }

    #[test]
    fn field_count_mismatch() {
        // [0, 5] is missing y
        let bytes = [0x82, 0x00, 0x05];
        assert_eq!(
            decode::<Shape>(&bytes),
            Err(CodecError::SchemaMismatch {
                kind: "shape",
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn truncated_and_trailing_bytes_are_malformed() {
        let truncated = [0x83, 0x00, 0x05];
        assert!(matches!(
            decode::<Shape>(&truncated),
            Err(CodecError::SchemaMismatch { .. }) | Err(CodecError::MalformedEncoding { .. })
        ));
        let trailing = [0x81, 0x02, 0x00];
        assert!(matches!(
            decode::<Shape>(&trailing),
            Err(CodecError::MalformedEncoding { .. })
        ));
        assert!(matches!(
            decode_discriminant(&[0x80]),
            Err(CodecError::MalformedEncoding { .. })
        ));
    }

    #[test]
    fn item_length_detects_partial_items() {
        let bytes = encode(&Shape::Label(String::from("hello"))).unwrap();
        assert_eq!(item_length(&bytes), Ok(Some(bytes.len())));
        assert_eq!(item_length(&bytes[..bytes.len() - 2]), Ok(None));

        let mut two = bytes.clone();
        two.extend(encode(&Shape::Empty).unwrap());
        assert_eq!(item_length(&two), Ok(Some(bytes.len())));
    }

    #[test]
    fn raw_items_are_copied_verbatim() {
        let inner = encode(&Shape::Point { x: 1, y: 2 }).unwrap();
        let mut encoder = Encoder::new(Vec::new());
        encoder.array(2).unwrap().u64(9).unwrap();
        write_raw(&mut encoder, &inner);
        let bytes = encoder.into_writer();

        let mut decoder = Decoder::new(&bytes);
        assert_eq!(array_len(&mut decoder), Ok(2));
        assert_eq!(decoder.u64().unwrap(), 9);
        assert_eq!(raw_item(&mut decoder).unwrap(), inner);
    }
}
