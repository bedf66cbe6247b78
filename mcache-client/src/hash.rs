//! # Key Hashing
//!
//! Purpose: Hash functions behind the key-to-server pickers.
//!
//! ## Design Principles
//! 1. **Cross-Client Stability**: `murmur3` reproduces the 64-bit seeded
//!    MurmurHash3 variant bit for bit (block mix, tail ladder, finalizer) so
//!    placements agree with other clients of the same cluster.
//! 2. **Library Where Standard**: CRC32-IEEE comes from `crc32fast`.

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// CRC32-IEEE of `key`.
#[inline]
pub fn crc32(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Seeded 64-bit MurmurHash3.
pub fn murmur3(key: &[u8], seed: u64) -> u64 {
    let mut hash = seed;

    let mut blocks = key.chunks_exact(8);
    for block in &mut blocks {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(block);
        let k = mix_k(u64::from_le_bytes(bytes));

        hash ^= k;
        hash = hash.rotate_left(27);
        hash = hash.wrapping_mul(5).wrapping_add(0x52dc_e729);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        // Little-endian tail, same as the fallthrough ladder over 7..1 bytes.
        let k = tail
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc ^ ((*b as u64) << (8 * i)));
        hash ^= mix_k(k);
    }

    hash ^= key.len() as u64;
    fmix(hash)
}

#[inline]
fn mix_k(k: u64) -> u64 {
    k.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

#[inline]
fn fmix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
