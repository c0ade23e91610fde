//! Column values and their packed encodings.
//!
//! Every column type knows three things: an upper bound on its encoded size,
//! how to pack a value into a caller-provided window, and how to unpack it
//! again. The packed format is length-implicit: fixed-width types carry no
//! framing at all, variable-width types carry a length prefix sized by the
//! column's declared maximum. This keeps packed rows as small as possible
//! while still being decodable with nothing but the schema in hand.

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit signed integer, packed as 8 bytes little-endian.
    Int64,
    /// 64-bit IEEE float, packed as 8 bytes little-endian.
    Float64,
    /// Variable-length byte string with a declared maximum length. The
    /// length prefix is 1, 2 or 4 bytes depending on the maximum.
    VarBytes { max_len: u32 },
    /// Unbounded byte string (BLOB/TEXT-like). The packed size can only be
    /// computed from the value currently held, never from metadata alone.
    Blob,
}

impl ColumnType {
    /// Width of the length prefix for variable-length values of this type.
    fn length_prefix_bytes(self) -> usize {
        match self {
            Self::Int64 | Self::Float64 => 0,
            Self::VarBytes { max_len } => {
                if max_len < 256 {
                    1
                } else if max_len < 65_536 {
                    2
                } else {
                    4
                }
            }
            Self::Blob => 4,
        }
    }

    /// Whether the encoded size depends on the value currently held, rather
    /// than being derivable from metadata alone.
    pub fn is_blob_like(self) -> bool {
        matches!(self, Self::Blob)
    }

    /// Upper bound on the packed size of `value` in this column.
    ///
    /// For blob-like columns this reads the current value's length; for
    /// everything else it is a pure function of the type.
    pub fn max_packed_len(self, value: &Value) -> usize {
        match self {
            Self::Int64 | Self::Float64 => 8,
            Self::VarBytes { max_len } => self.length_prefix_bytes() + max_len as usize,
            Self::Blob => {
                let len = match value {
                    Value::Bytes(b) => b.len(),
                    _ => 0,
                };
                self.length_prefix_bytes() + len
            }
        }
    }

    /// Pack `value` into the front of `dst`, returning the number of bytes
    /// written. `dst` must hold at least [`Self::max_packed_len`] bytes.
    /// NULL values are never packed; the caller encodes them in the row's
    /// null bitmap instead.
    pub fn pack(self, value: &Value, dst: &mut [u8]) -> usize {
        match (self, value) {
            (Self::Int64, Value::Int(v)) => {
                dst[..8].copy_from_slice(&v.to_le_bytes());
                8
            }
            (Self::Float64, Value::Float(v)) => {
                dst[..8].copy_from_slice(&v.to_bits().to_le_bytes());
                8
            }
            (Self::VarBytes { .. } | Self::Blob, Value::Bytes(b)) => {
                let prefix = self.length_prefix_bytes();
                match prefix {
                    1 => dst[0] = b.len() as u8,
                    2 => dst[..2].copy_from_slice(&(b.len() as u16).to_le_bytes()),
                    _ => dst[..4].copy_from_slice(&(b.len() as u32).to_le_bytes()),
                }
                dst[prefix..prefix + b.len()].copy_from_slice(b);
                prefix + b.len()
            }
            _ => unreachable!("type/value mismatch in pack"),
        }
    }

    /// Unpack a value from the front of `src`, returning it along with the
    /// number of bytes consumed.
    ///
    /// `src` must start with the output of a prior [`Self::pack`] for the
    /// same column type; anything else is a caller bug.
    pub fn unpack(self, src: &[u8]) -> (Value, usize) {
        match self {
            Self::Int64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[..8]);
                (Value::Int(i64::from_le_bytes(raw)), 8)
            }
            Self::Float64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[..8]);
                (Value::Float(f64::from_bits(u64::from_le_bytes(raw))), 8)
            }
            Self::VarBytes { .. } | Self::Blob => {
                let prefix = self.length_prefix_bytes();
                let len = match prefix {
                    1 => src[0] as usize,
                    2 => u16::from_le_bytes([src[0], src[1]]) as usize,
                    _ => u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize,
                };
                let data = src[prefix..prefix + len].to_vec();
                (Value::Bytes(data), prefix + len)
            }
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Append this value's canonical comparison form to a join-key buffer.
    ///
    /// Byte equality of the appended form coincides with SQL equality for
    /// non-NULL values of the same type: floats are normalized so that
    /// `-0.0` and `0.0` encode identically, and variable-length parts are
    /// length-delimited when the key has more than one part so that
    /// `("ab","c")` and `("a","bc")` cannot collide.
    ///
    /// Returns `true` (appending nothing) if the value is SQL NULL.
    pub fn append_comparable(&self, multi_part: bool, buf: &mut Vec<u8>) -> bool {
        match self {
            Self::Null => true,
            Self::Int(v) => {
                buf.extend_from_slice(&v.to_le_bytes());
                false
            }
            Self::Float(v) => {
                let normalized = if *v == 0.0 { 0.0 } else { *v };
                buf.extend_from_slice(&normalized.to_bits().to_le_bytes());
                false
            }
            Self::Bytes(b) => {
                if multi_part {
                    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                }
                buf.extend_from_slice(b);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(ty: ColumnType, value: &Value) {
        let mut buf = vec![0u8; ty.max_packed_len(value)];
        let written = ty.pack(value, &mut buf);
        assert!(written <= buf.len());
        let (decoded, consumed) = ty.unpack(&buf);
        assert_eq!(consumed, written);
        assert_eq!(&decoded, value);
    }

    #[test]
    fn int_roundtrip() {
        roundtrip(ColumnType::Int64, &Value::Int(-42));
        roundtrip(ColumnType::Int64, &Value::Int(i64::MAX));
    }

    #[test]
    fn float_roundtrip_preserves_bits() {
        roundtrip(ColumnType::Float64, &Value::Float(-0.0));
        roundtrip(ColumnType::Float64, &Value::Float(1.5e300));
    }

    #[test]
    fn varbytes_prefix_width_follows_declared_max() {
        assert_eq!(ColumnType::VarBytes { max_len: 255 }.length_prefix_bytes(), 1);
        assert_eq!(ColumnType::VarBytes { max_len: 256 }.length_prefix_bytes(), 2);
        assert_eq!(
            ColumnType::VarBytes { max_len: 70_000 }.length_prefix_bytes(),
            4
        );
    }

    #[test]
    fn blob_upper_bound_reads_current_value() {
        let v = Value::Bytes(vec![7u8; 100]);
        assert_eq!(ColumnType::Blob.max_packed_len(&v), 104);
        roundtrip(ColumnType::Blob, &v);
    }

    #[test]
    fn negative_zero_normalizes_in_key_encoding() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        assert!(!Value::Float(-0.0).append_comparable(false, &mut a));
        assert!(!Value::Float(0.0).append_comparable(false, &mut b));
        assert_eq!(a, b);
    }

    #[test]
    fn multi_part_keys_are_length_delimited() {
        let mut a = Vec::new();
        Value::Bytes(b"ab".to_vec()).append_comparable(true, &mut a);
        Value::Bytes(b"c".to_vec()).append_comparable(true, &mut a);

        let mut b = Vec::new();
        Value::Bytes(b"a".to_vec()).append_comparable(true, &mut b);
        Value::Bytes(b"bc".to_vec()).append_comparable(true, &mut b);

        assert_ne!(a, b);
    }

    #[test]
    fn null_appends_nothing() {
        let mut buf = Vec::new();
        assert!(Value::Null.append_comparable(false, &mut buf));
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn prop_varbytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..200)) {
            roundtrip(ColumnType::VarBytes { max_len: 200 }, &Value::Bytes(data));
        }

        #[test]
        fn prop_int_roundtrip(v in any::<i64>()) {
            roundtrip(ColumnType::Int64, &Value::Int(v));
        }
    }
}
