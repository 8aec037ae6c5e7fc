//! Effective partition key (EPK) hashing, pinned to partition key version 2.
//!
//! The service routes a document by the hash of its partition key tuple. Each
//! component is encoded in a small typed binary form, hashed with MurmurHash3
//! x64 128, byte-reversed and rendered as upper-case hex. Any change to this
//! encoding is a wire break, so it is kept isolated here.

use cosmosql_common::models::{
    PartitionKey, PartitionKeyDefinition, PartitionKeyValue, PartitionKind,
};
use cosmosql_error::{CosmosError, ErrorCode, Result};

/// Lower bound of the whole EPK space.
pub const MIN_EPK: &str = "";
/// Exclusive upper bound of the whole EPK space.
pub const MAX_EPK: &str = "FF";

/// Hex digits one MultiHash component contributes.
const COMPONENT_HEX_LEN: usize = 16;

const MARKER_UNDEFINED: u8 = 0x00;
const MARKER_NULL: u8 = 0x01;
const MARKER_FALSE: u8 = 0x02;
const MARKER_TRUE: u8 = 0x03;
const MARKER_NUMBER: u8 = 0x05;
const MARKER_STRING: u8 = 0x08;
const STRING_TERMINATOR: u8 = 0xFF;

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3, x64 128-bit variant. Returns `(h1, h2)`.
pub fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let mut k1 = u64::from_le_bytes(block[..8].try_into().unwrap_or_default());
        let mut k2 = u64::from_le_bytes(block[8..].try_into().unwrap_or_default());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for (i, byte) in tail.iter().enumerate() {
        if i < 8 {
            k1 |= u64::from(*byte) << (8 * i);
        } else {
            k2 |= u64::from(*byte) << (8 * (i - 8));
        }
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    let len = data.len() as u64;
    h1 ^= len;
    h2 ^= len;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

fn encode_component(value: &PartitionKeyValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        PartitionKeyValue::Undefined => out.push(MARKER_UNDEFINED),
        PartitionKeyValue::Null => out.push(MARKER_NULL),
        PartitionKeyValue::Bool(false) => out.push(MARKER_FALSE),
        PartitionKeyValue::Bool(true) => out.push(MARKER_TRUE),
        PartitionKeyValue::Number(n) => {
            let f = n.as_f64().ok_or_else(|| {
                CosmosError::new(
                    ErrorCode::InvalidArgument,
                    format!("Partition key number {} is not representable as f64", n),
                )
            })?;
            out.push(MARKER_NUMBER);
            out.extend_from_slice(&f.to_le_bytes());
        }
        PartitionKeyValue::String(s) => {
            out.push(MARKER_STRING);
            out.extend_from_slice(s.as_bytes());
            out.push(STRING_TERMINATOR);
        }
    }
    Ok(())
}

/// Hash one encoded key into its 32-digit hex form.
fn hash_hex(encoded: &[u8]) -> String {
    let (h1, h2) = murmur3_x64_128(encoded, 0);
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&h1.to_le_bytes());
    bytes[8..].copy_from_slice(&h2.to_le_bytes());
    bytes.reverse();
    bytes[0] &= 0x3F;
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn ensure_hashable(def: &PartitionKeyDefinition) -> Result<()> {
    def.validate()?;
    if def.effective_version() != 2 {
        return Err(CosmosError::new(
            ErrorCode::UnsupportedPartitionKeyVersion,
            format!(
                "Partition key version {} cannot be hashed by this driver",
                def.effective_version()
            ),
        )
        .with_hint("Use single-partition operations or recreate the container with version 2"));
    }
    Ok(())
}

/// Effective partition key of a tuple. For MultiHash, a prefix yields the
/// hash of the supplied components only.
pub fn effective_partition_key(def: &PartitionKeyDefinition, pk: &PartitionKey) -> Result<String> {
    ensure_hashable(def)?;
    pk.check_arity(def, true)?;
    match def.kind {
        PartitionKind::Hash => {
            let mut encoded = Vec::new();
            for component in pk.components() {
                encode_component(component, &mut encoded)?;
            }
            Ok(hash_hex(&encoded))
        }
        PartitionKind::MultiHash => {
            let mut epk = String::with_capacity(COMPONENT_HEX_LEN * pk.len());
            for component in pk.components() {
                let mut encoded = Vec::new();
                encode_component(component, &mut encoded)?;
                epk.push_str(&hash_hex(&encoded)[..COMPONENT_HEX_LEN]);
            }
            Ok(epk)
        }
    }
}

/// Inclusive EPK interval every key with the given (possibly partial) tuple hashes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpkRange {
    pub min: String,
    pub max: String,
}

impl EpkRange {
    pub fn is_point(&self) -> bool {
        self.min == self.max
    }
}

pub fn effective_range(def: &PartitionKeyDefinition, pk: &PartitionKey) -> Result<EpkRange> {
    let min = effective_partition_key(def, pk)?;
    let missing = def.paths.len().saturating_sub(pk.len());
    if def.kind == PartitionKind::MultiHash && missing > 0 {
        let max = format!("{}{}", min, "F".repeat(COMPONENT_HEX_LEN * missing));
        return Ok(EpkRange { min, max });
    }
    Ok(EpkRange {
        max: min.clone(),
        min,
    })
}
