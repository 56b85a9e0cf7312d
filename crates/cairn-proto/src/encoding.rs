//! Ordered field lists over CBOR values.
//!
//! [`FieldWriter`] builds the field list of a message or state and
//! [`FieldReader`] walks it back. Both sides agree only on field order; the
//! CBOR major type of each field makes the list self-describing.
//!
//! # Invariants
//!
//! - Kind Prefix: [`encode_tagged`] always produces an array whose first
//!   element is the unsigned kind discriminator
//! - Forward Compatibility: [`FieldReader`] never fails because of trailing
//!   fields it does not read

use ciborium::value::{Integer, Value};

use crate::{
    errors::{Result, WireError},
    ids::{DeviceUid, Identity, Uid},
};

/// Self-describing encoded value.
pub type Encoded = Value;

/// Maximum size of any encoded value accepted by [`from_bytes`] (1 MiB)
pub const MAX_ENCODED_SIZE: usize = 1024 * 1024;

/// Types with a canonical wire form.
pub trait Encode {
    /// Encode into a CBOR value.
    fn encode(&self) -> Encoded;
}

/// Types that can be rebuilt from their wire form.
pub trait Decode: Sized {
    /// Decode from a CBOR value.
    fn decode(encoded: &Encoded) -> Result<Self>;
}

impl Encode for u64 {
    fn encode(&self) -> Encoded {
        Value::Integer(Integer::from(*self))
    }
}

impl Decode for u64 {
    fn decode(encoded: &Encoded) -> Result<Self> {
        match encoded {
            Value::Integer(i) => {
                u64::try_from(*i).map_err(|_| WireError::IntegerOutOfRange { context: "u64" })
            },
            _ => Err(WireError::UnexpectedType { context: "u64", index: 0, expected: "integer" }),
        }
    }
}

impl Encode for bool {
    fn encode(&self) -> Encoded {
        Value::Bool(*self)
    }
}

impl Decode for bool {
    fn decode(encoded: &Encoded) -> Result<Self> {
        match encoded {
            Value::Bool(b) => Ok(*b),
            _ => Err(WireError::UnexpectedType { context: "bool", index: 0, expected: "bool" }),
        }
    }
}

impl Encode for String {
    fn encode(&self) -> Encoded {
        Value::Text(self.clone())
    }
}

impl Decode for String {
    fn decode(encoded: &Encoded) -> Result<Self> {
        match encoded {
            Value::Text(text) => Ok(text.clone()),
            _ => Err(WireError::UnexpectedType { context: "text", index: 0, expected: "text" }),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self) -> Encoded {
        Value::Array(self.iter().map(Encode::encode).collect())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(encoded: &Encoded) -> Result<Self> {
        match encoded {
            Value::Array(items) => items.iter().map(T::decode).collect(),
            _ => Err(WireError::UnexpectedType { context: "list", index: 0, expected: "array" }),
        }
    }
}

macro_rules! impl_id_codec {
    ($ty:ty, $context:literal) => {
        impl Encode for $ty {
            fn encode(&self) -> Encoded {
                Value::Bytes(self.as_bytes().to_vec())
            }
        }

        impl Decode for $ty {
            fn decode(encoded: &Encoded) -> Result<Self> {
                match encoded {
                    Value::Bytes(bytes) => <$ty>::from_slice(bytes),
                    _ => Err(WireError::UnexpectedType {
                        context: $context,
                        index: 0,
                        expected: "bytes",
                    }),
                }
            }
        }
    };
}

impl_id_codec!(Uid, "uid");
impl_id_codec!(DeviceUid, "device uid");
impl_id_codec!(Identity, "identity");

/// Builder for an ordered field list.
#[derive(Debug, Default)]
pub struct FieldWriter {
    fields: Vec<Encoded>,
}

impl FieldWriter {
    /// Start an empty field list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an encodable field.
    #[must_use]
    pub fn push<T: Encode + ?Sized>(mut self, value: &T) -> Self {
        self.fields.push(value.encode());
        self
    }

    /// Append a byte string field.
    #[must_use]
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.fields.push(Value::Bytes(bytes.to_vec()));
        self
    }

    /// Finished field list.
    pub fn finish(self) -> Vec<Encoded> {
        self.fields
    }
}

/// Sequential reader over an ordered field list.
///
/// Errors carry the field index and a context string naming the message or
/// state being decoded.
#[derive(Debug)]
pub struct FieldReader<'a> {
    fields: &'a [Encoded],
    position: usize,
    context: &'static str,
}

impl<'a> FieldReader<'a> {
    /// Read `fields`, labelling errors with `context`.
    pub fn new(fields: &'a [Encoded], context: &'static str) -> Self {
        Self { fields, position: 0, context }
    }

    fn advance(&mut self) -> Result<(usize, &'a Encoded)> {
        let index = self.position;
        let field = self
            .fields
            .get(index)
            .ok_or(WireError::MissingField { context: self.context, index })?;
        self.position += 1;
        Ok((index, field))
    }

    /// Decode the next field.
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        let (index, field) = self.advance()?;
        T::decode(field).map_err(|e| match e {
            WireError::UnexpectedType { expected, .. } => {
                WireError::UnexpectedType { context: self.context, index, expected }
            },
            other => other,
        })
    }

    /// Next field as a byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let (index, field) = self.advance()?;
        match field {
            Value::Bytes(bytes) => Ok(bytes),
            _ => Err(WireError::UnexpectedType { context: self.context, index, expected: "bytes" }),
        }
    }

    /// Next field as a fixed-size byte array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let context = self.context;
        let bytes = self.bytes()?;
        bytes.try_into().map_err(|_| WireError::InvalidLength {
            context,
            expected: N,
            got: bytes.len(),
        })
    }

    /// Number of fields not yet read.
    pub fn remaining(&self) -> usize {
        self.fields.len().saturating_sub(self.position)
    }
}

/// Build `[kind, fields...]`.
pub fn encode_tagged(kind: u64, fields: Vec<Encoded>) -> Encoded {
    let mut items = Vec::with_capacity(fields.len() + 1);
    items.push(kind.encode());
    items.extend(fields);
    Value::Array(items)
}

/// Split `[kind, fields...]` into the kind and its fields.
pub fn decode_tagged<'a>(encoded: &'a Encoded, context: &'static str) -> Result<(u64, &'a [Encoded])> {
    let Value::Array(items) = encoded else {
        return Err(WireError::UnexpectedType { context, index: 0, expected: "array" });
    };
    let (kind, fields) =
        items.split_first().ok_or(WireError::MissingField { context, index: 0 })?;
    let kind = u64::decode(kind)
        .map_err(|_| WireError::UnexpectedType { context, index: 0, expected: "kind integer" })?;
    Ok((kind, fields))
}

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// - `WireError::CborEncode` if serialization fails
pub fn to_bytes(encoded: &Encoded) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(encoded, &mut bytes).map_err(|e| WireError::CborEncode(e.to_string()))?;
    Ok(bytes)
}

/// Parse CBOR bytes into a value.
///
/// # Errors
///
/// - `WireError::TooLarge` if `bytes` exceeds [`MAX_ENCODED_SIZE`]
/// - `WireError::CborDecode` if the bytes are not valid CBOR
pub fn from_bytes(bytes: &[u8]) -> Result<Encoded> {
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(WireError::TooLarge { size: bytes.len(), max: MAX_ENCODED_SIZE });
    }
    ciborium::from_reader(bytes).map_err(|e| WireError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_list_roundtrip() {
        let fields = FieldWriter::new()
            .push(&42u64)
            .bytes(b"ciphertext")
            .push(&DeviceUid::from_bytes([3u8; 32]))
            .push(&vec!["a".to_string(), "b".to_string()])
            .finish();
        let encoded = encode_tagged(7, fields);
        let bytes = to_bytes(&encoded).unwrap();

        let decoded = from_bytes(&bytes).unwrap();
        let (kind, fields) = decode_tagged(&decoded, "test").unwrap();
        assert_eq!(kind, 7);

        let mut reader = FieldReader::new(fields, "test");
        assert_eq!(reader.read::<u64>().unwrap(), 42);
        assert_eq!(reader.bytes().unwrap(), b"ciphertext");
        assert_eq!(reader.read::<DeviceUid>().unwrap(), DeviceUid::from_bytes([3u8; 32]));
        assert_eq!(reader.read::<Vec<String>>().unwrap(), vec!["a", "b"]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn trailing_fields_are_ignored() {
        let fields = FieldWriter::new().push(&1u64).push(&2u64).push(&3u64).finish();
        let mut reader = FieldReader::new(&fields, "test");
        assert_eq!(reader.read::<u64>().unwrap(), 1);
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn missing_field_reports_index() {
        let fields = FieldWriter::new().push(&1u64).finish();
        let mut reader = FieldReader::new(&fields, "ping");
        reader.read::<u64>().unwrap();
        assert_eq!(reader.read::<u64>(), Err(WireError::MissingField { context: "ping", index: 1 }));
    }

    #[test]
    fn wrong_type_reports_index() {
        let fields = FieldWriter::new().bytes(b"x").finish();
        let mut reader = FieldReader::new(&fields, "ack");
        assert_eq!(
            reader.read::<u64>(),
            Err(WireError::UnexpectedType { context: "ack", index: 0, expected: "integer" })
        );
    }

    #[test]
    fn array_checks_length() {
        let fields = FieldWriter::new().bytes(&[0u8; 31]).finish();
        let mut reader = FieldReader::new(&fields, "key");
        assert!(matches!(reader.array::<32>(), Err(WireError::InvalidLength { got: 31, .. })));
    }

    #[test]
    fn negative_integer_is_out_of_range() {
        let value = Value::Integer(Integer::from(-1i64));
        assert!(matches!(u64::decode(&value), Err(WireError::IntegerOutOfRange { .. })));
    }

    #[test]
    fn non_array_is_rejected() {
        assert!(decode_tagged(&Value::Bool(true), "test").is_err());
        assert!(decode_tagged(&Value::Array(vec![]), "test").is_err());
    }

    #[test]
    fn oversized_input_is_rejected_before_parsing() {
        let bytes = vec![0u8; MAX_ENCODED_SIZE + 1];
        assert!(matches!(from_bytes(&bytes), Err(WireError::TooLarge { .. })));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(from_bytes(&[0xFF, 0xFF, 0xFF]), Err(WireError::CborDecode(_))));
    }
}
