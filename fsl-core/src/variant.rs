//! Feature-flag variants and the container that packs them per output.
//!
//! Container layout (all integers little-endian):
//!
//! ```text
//! "FSLV" | version: u32 | count: u32
//! count x { target: u32 | flags: u64 | offset: u64 | len: u64 }   sorted by (target, flags)
//! payloads
//! ```

use crate::err_container;
use crate::error::{CompilerError, Result};
use crate::target::Target;
use bitflags::bitflags;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FeatureFlags: u64 {
        const PRIM_ID      = 1 << 0;
        const RAYTRACING   = 1 << 1;
        const MULTIVIEW    = 1 << 2;
        const VRS          = 1 << 3;
        const ICB          = 1 << 4;
        const SUBGROUP_OPS = 1 << 5;
    }
}

const FLAG_NAMES: [(&str, FeatureFlags); 6] = [
    ("FT_PRIM_ID", FeatureFlags::PRIM_ID),
    ("FT_RAYTRACING", FeatureFlags::RAYTRACING),
    ("FT_MULTIVIEW", FeatureFlags::MULTIVIEW),
    ("FT_VRS", FeatureFlags::VRS),
    ("FT_ICB", FeatureFlags::ICB),
    ("FT_SUBGROUP_OPS", FeatureFlags::SUBGROUP_OPS),
];

impl FeatureFlags {
    /// Looks up a source-level flag name such as `FT_PRIM_ID`.
    pub fn from_symbol(name: &str) -> Option<FeatureFlags> {
        FLAG_NAMES.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
    }

    /// Source-level names of the set flags, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn is_defined(self, symbol: &str) -> bool {
        FeatureFlags::from_symbol(symbol).is_some_and(|f| self.contains(f))
    }

    /// `FT_A+FT_B`, or an empty string for no flags.
    pub fn label(self) -> String {
        self.names().join("+")
    }
}

pub fn serialize_flags<S: Serializer>(flags: &FeatureFlags, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    flags.names().serialize(serializer)
}

/// One compiled (or generated) payload for a `(target, flags)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderVariant {
    pub target: Target,
    pub flags: FeatureFlags,
    pub bytes: Vec<u8>,
}

const MAGIC: &[u8; 4] = b"FSLV";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 12;
const ENTRY_LEN: usize = 28;

/// Variants of one output, keyed by `(target, flags)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantContainer {
    variants: BTreeMap<(u32, u64), ShaderVariant>,
}

impl VariantContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, variant: ShaderVariant) -> Result<()> {
        let key = (variant.target.code(), variant.flags.bits());
        if self.variants.contains_key(&key) {
            return Err(err_container!(
                "duplicate variant for {} with flags [{}]",
                variant.target,
                variant.flags.label()
            ));
        }
        self.variants.insert(key, variant);
        Ok(())
    }

    /// Exact-match lookup. A variant with a superset or subset of `flags` is a miss.
    pub fn lookup(&self, target: Target, flags: FeatureFlags) -> Result<&[u8]> {
        self.variants
            .get(&(target.code(), flags.bits()))
            .map(|v| v.bytes.as_slice())
            .ok_or_else(|| CompilerError::NoMatchingVariant {
                target,
                flags: flags.label(),
            })
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShaderVariant> {
        self.variants.values()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let directory_end = HEADER_LEN + ENTRY_LEN * self.variants.len();
        let payload_len: usize = self.variants.values().map(|v| v.bytes.len()).sum();
        let mut out = Vec::with_capacity(directory_end + payload_len);

        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.variants.len() as u32).to_le_bytes());

        let mut offset = directory_end as u64;
        for ((target, flags), variant) in &self.variants {
            out.extend_from_slice(&target.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(variant.bytes.len() as u64).to_le_bytes());
            offset += variant.bytes.len() as u64;
        }
        for variant in self.variants.values() {
            out.extend_from_slice(&variant.bytes);
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return Err(err_container!("not a variant container"));
        }
        let version = read_u32(data, 4)?;
        if version != VERSION {
            return Err(err_container!("unsupported container version {}", version));
        }
        let count = read_u32(data, 8)? as usize;

        let mut container = VariantContainer::new();
        for i in 0..count {
            let at = HEADER_LEN + i * ENTRY_LEN;
            let code = read_u32(data, at)?;
            let bits = read_u64(data, at + 4)?;
            let offset = read_u64(data, at + 12)? as usize;
            let len = read_u64(data, at + 20)? as usize;

            let target = Target::from_code(code).ok_or_else(|| err_container!("unknown target code {}", code))?;
            let flags = FeatureFlags::from_bits(bits).ok_or_else(|| err_container!("unknown feature bits {:#x}", bits))?;
            let bytes = offset
                .checked_add(len)
                .and_then(|end| data.get(offset..end))
                .ok_or_else(|| err_container!("variant {} lies outside the container", i))?;
            container.insert(ShaderVariant {
                target,
                flags,
                bytes: bytes.to_vec(),
            })?;
        }
        Ok(container)
    }
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| err_container!("truncated container"))
}

fn read_u64(data: &[u8], at: usize) -> Result<u64> {
    data.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| err_container!("truncated container"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(target: Target, flags: FeatureFlags, payload: &str) -> ShaderVariant {
        ShaderVariant {
            target,
            flags,
            bytes: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_flag_names() {
        let flags = FeatureFlags::from_symbol("FT_VRS").unwrap() | FeatureFlags::PRIM_ID;
        assert_eq!(flags.names(), vec!["FT_PRIM_ID", "FT_VRS"]);
        assert_eq!(flags.label(), "FT_PRIM_ID+FT_VRS");
        assert!(flags.is_defined("FT_VRS"));
        assert!(!flags.is_defined("FT_ICB"));
        assert!(!flags.is_defined("VULKAN"));
        assert_eq!(FeatureFlags::empty().label(), "");
    }

    #[test]
    fn test_source_symbols_are_distinct_from_constant_names() {
        assert_eq!(FeatureFlags::from_symbol("FT_ICB"), Some(FeatureFlags::ICB));
        assert_eq!(FeatureFlags::from_symbol("ICB"), None);
        // The generated lookup uses the constant names.
        assert_eq!(FeatureFlags::from_name("ICB"), Some(FeatureFlags::ICB));
        assert_eq!(FeatureFlags::from_name("FT_ICB"), None);
    }

    #[test]
    fn test_lookup_is_exact_match() {
        let mut container = VariantContainer::new();
        container.insert(variant(Target::Vulkan, FeatureFlags::PRIM_ID, "a")).unwrap();
        container
            .insert(variant(Target::Vulkan, FeatureFlags::PRIM_ID | FeatureFlags::VRS, "b"))
            .unwrap();

        assert_eq!(container.lookup(Target::Vulkan, FeatureFlags::PRIM_ID).unwrap(), b"a");
        assert!(matches!(
            container.lookup(Target::Vulkan, FeatureFlags::empty()),
            Err(CompilerError::NoMatchingVariant { .. })
        ));
        assert!(container
            .lookup(Target::Vulkan, FeatureFlags::PRIM_ID | FeatureFlags::VRS | FeatureFlags::ICB)
            .is_err());
        assert!(container.lookup(Target::Metal, FeatureFlags::PRIM_ID).is_err());
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut container = VariantContainer::new();
        container.insert(variant(Target::Metal, FeatureFlags::ICB, "x")).unwrap();
        let err = container.insert(variant(Target::Metal, FeatureFlags::ICB, "y")).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn test_serialized_container_reads_back() {
        let mut container = VariantContainer::new();
        container.insert(variant(Target::Direct3D12, FeatureFlags::VRS, "vrs")).unwrap();
        container.insert(variant(Target::Direct3D12, FeatureFlags::empty(), "base")).unwrap();

        let bytes = container.to_bytes();
        assert_eq!(&bytes[..4], b"FSLV");
        // Directory is sorted: the empty flag set comes first.
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 0);

        let decoded = VariantContainer::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, container);
        assert!(VariantContainer::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(VariantContainer::from_bytes(b"NOPE\0\0\0\0\0\0\0\0").is_err());
    }
}
