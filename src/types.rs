// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in value model for DataSet fields.
//!
//! PubSub field values are scalars from the OPC UA built-in type set. The
//! model is deliberately closed: structured/custom types live in the
//! information model, which this crate does not carry.

use std::fmt;

/// Kind of a DataSet field, mirroring the OPC UA built-in type ids used
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    ByteString,
}

impl DataType {
    /// OPC UA built-in type id (Part 6, Table 1). Used as the Variant
    /// encoding mask on the wire.
    #[must_use]
    pub fn type_id(self) -> u8 {
        match self {
            DataType::Boolean => 1,
            DataType::SByte => 2,
            DataType::Byte => 3,
            DataType::Int16 => 4,
            DataType::UInt16 => 5,
            DataType::Int32 => 6,
            DataType::UInt32 => 7,
            DataType::Int64 => 8,
            DataType::UInt64 => 9,
            DataType::Float => 10,
            DataType::Double => 11,
            DataType::String => 12,
            DataType::ByteString => 15,
        }
    }

    /// Reverse of [`DataType::type_id`].
    #[must_use]
    pub fn from_type_id(id: u8) -> Option<DataType> {
        Some(match id {
            1 => DataType::Boolean,
            2 => DataType::SByte,
            3 => DataType::Byte,
            4 => DataType::Int16,
            5 => DataType::UInt16,
            6 => DataType::Int32,
            7 => DataType::UInt32,
            8 => DataType::Int64,
            9 => DataType::UInt64,
            10 => DataType::Float,
            11 => DataType::Double,
            12 => DataType::String,
            15 => DataType::ByteString,
            _ => return None,
        })
    }

    /// True for the numeric types (integers and floats).
    #[must_use]
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Boolean | DataType::String | DataType::ByteString)
    }

    /// Encoded size in bytes when the type has a fixed wire size.
    /// `None` for variable-length types (String, ByteString).
    #[must_use]
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::SByte | DataType::Byte => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Double => Some(8),
            DataType::String | DataType::ByteString => None,
        }
    }
}

/// Scalar field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    ByteString(Vec<u8>),
}

impl Variant {
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Variant::Boolean(_) => DataType::Boolean,
            Variant::SByte(_) => DataType::SByte,
            Variant::Byte(_) => DataType::Byte,
            Variant::Int16(_) => DataType::Int16,
            Variant::UInt16(_) => DataType::UInt16,
            Variant::Int32(_) => DataType::Int32,
            Variant::UInt32(_) => DataType::UInt32,
            Variant::Int64(_) => DataType::Int64,
            Variant::UInt64(_) => DataType::UInt64,
            Variant::Float(_) => DataType::Float,
            Variant::Double(_) => DataType::Double,
            Variant::String(_) => DataType::String,
            Variant::ByteString(_) => DataType::ByteString,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Boolean(v) => write!(f, "{}", v),
            Variant::SByte(v) => write!(f, "{}", v),
            Variant::Byte(v) => write!(f, "{}", v),
            Variant::Int16(v) => write!(f, "{}", v),
            Variant::UInt16(v) => write!(f, "{}", v),
            Variant::Int32(v) => write!(f, "{}", v),
            Variant::UInt32(v) => write!(f, "{}", v),
            Variant::Int64(v) => write!(f, "{}", v),
            Variant::UInt64(v) => write!(f, "{}", v),
            Variant::Float(v) => write!(f, "{}", v),
            Variant::Double(v) => write!(f, "{}", v),
            Variant::String(v) => write!(f, "{:?}", v),
            Variant::ByteString(v) => write!(f, "{} bytes", v.len()),
        }
    }
}

/// Field value plus the optional qualifiers the DataValue field encoding
/// carries on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataValue {
    pub value: Option<Variant>,
    /// OPC UA status code word; `None` encodes as Good (0).
    pub status: Option<u32>,
    /// Source timestamp, 100 ns ticks since 1601-01-01 (OPC UA DateTime).
    pub source_timestamp: Option<i64>,
}

impl DataValue {
    #[must_use]
    pub fn from_variant(value: Variant) -> Self {
        DataValue {
            value: Some(value),
            status: None,
            source_timestamp: None,
        }
    }
}

/// PublisherId of a NetworkMessage or the expected PublisherId of a
/// DataSetReader. Comparison is type-aware: `UInt16(7)` never matches
/// `UInt32(7)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublisherId {
    Byte(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    String(String),
}

impl PublisherId {
    /// True when the id has a fixed wire size. String ids are excluded
    /// from the real-time fast path.
    #[must_use]
    pub fn is_fixed_size(&self) -> bool {
        !matches!(self, PublisherId::String(_))
    }

    /// Wire tag for the ExtendedFlags1 PublisherId-type bits.
    #[must_use]
    pub(crate) fn wire_type(&self) -> u8 {
        match self {
            PublisherId::Byte(_) => 0,
            PublisherId::UInt16(_) => 1,
            PublisherId::UInt32(_) => 2,
            PublisherId::UInt64(_) => 3,
            PublisherId::String(_) => 4,
        }
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublisherId::Byte(v) => write!(f, "{}", v),
            PublisherId::UInt16(v) => write!(f, "{}", v),
            PublisherId::UInt32(v) => write!(f, "{}", v),
            PublisherId::UInt64(v) => write!(f, "{}", v),
            PublisherId::String(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_roundtrip() {
        for dt in [
            DataType::Boolean,
            DataType::SByte,
            DataType::Byte,
            DataType::Int16,
            DataType::UInt16,
            DataType::Int32,
            DataType::UInt32,
            DataType::Int64,
            DataType::UInt64,
            DataType::Float,
            DataType::Double,
            DataType::String,
            DataType::ByteString,
        ] {
            assert_eq!(DataType::from_type_id(dt.type_id()), Some(dt));
        }
        assert_eq!(DataType::from_type_id(0), None);
        assert_eq!(DataType::from_type_id(13), None);
    }

    #[test]
    fn test_numeric_classification() {
        assert!(DataType::Int32.is_numeric());
        assert!(DataType::Double.is_numeric());
        assert!(!DataType::Boolean.is_numeric());
        assert!(!DataType::String.is_numeric());
        assert!(!DataType::ByteString.is_numeric());
    }

    #[test]
    fn test_publisher_id_type_aware_compare() {
        assert_ne!(PublisherId::UInt16(7), PublisherId::UInt32(7));
        assert_eq!(PublisherId::UInt16(7), PublisherId::UInt16(7));
        assert!(!PublisherId::String("pub".into()).is_fixed_size());
        assert!(PublisherId::UInt64(1).is_fixed_size());
    }

    #[test]
    fn test_variant_data_type() {
        assert_eq!(Variant::Int32(99).data_type(), DataType::Int32);
        assert_eq!(Variant::ByteString(vec![1]).data_type(), DataType::ByteString);
    }
}
