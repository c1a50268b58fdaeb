//! The value types known to the code generator.
//!
//! The type checker has already validated every expression, so this model
//! only carries what code generation needs: ABI sizing, stack footprint and
//! canonical names for signature hashing.

use std::fmt;

/// A fully resolved Covenant type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    /// Unsigned integer of the given bit width (8..=256, multiple of 8).
    Uint(u16),
    Bool,
    Address,
    /// Dynamically sized byte string.
    Bytes,
}

impl Type {
    pub const UINT256: Type = Type::Uint(256);

    /// True for types whose encoded length is only known at runtime.
    pub fn is_dynamically_sized(&self) -> bool {
        matches!(self, Type::Bytes)
    }

    /// Number of bytes the value occupies in the ABI encoding before padding.
    /// For `Bytes` this is the size of the length word in the head area.
    pub fn unpadded_byte_size(&self) -> u32 {
        match self {
            Type::Uint(bits) => u32::from(*bits) / 8,
            Type::Bool => 1,
            Type::Address => 20,
            Type::Bytes => 32,
        }
    }

    /// Number of 32-byte stack slots a value of this type occupies.
    /// `Bytes` values are a (data offset, length) pair.
    pub fn size_on_stack(&self) -> u32 {
        match self {
            Type::Uint(_) | Type::Bool | Type::Address => 1,
            Type::Bytes => 2,
        }
    }

    /// The name used in canonical function signatures.
    pub fn canonical_name(&self) -> String {
        match self {
            Type::Uint(bits) => format!("uint{bits}"),
            Type::Bool => "bool".into(),
            Type::Address => "address".into(),
            Type::Bytes => "bytes".into(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

/// Rounds `size` up to the next multiple of the 32-byte EVM word.
pub fn padded_size(size: u32) -> u32 {
    size.div_ceil(32) * 32
}
