//! MurmurHash3_x64_128.
//!
//! Scripts observe hash output directly (`str.hash` returns the four 32-bit
//! words), and native commands are addressed by the low 64 bits of the hash
//! of their qualified name. Both must match the reference MurmurHash3
//! exactly, so the implementation is written out here rather than pulled
//! from a hashing crate with its own tweaks.

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3_x64_128 over `data` with the given seed.
///
/// Returns `(h1, h2)`; the canonical 16-byte digest is `h1` then `h2`,
/// little-endian.
pub fn hash128(data: &[u8], seed: u64) -> (u64, u64) {
    let len = data.len();
    let mut h1 = seed;
    let mut h2 = seed;

    let nblocks = len / 16;
    for i in 0..nblocks {
        let base = i * 16;
        let mut k1 = u64::from_le_bytes(data[base..base + 8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(data[base + 8..base + 16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    if tail.len() > 8 {
        for (i, &b) in tail[8..].iter().enumerate() {
            k2 |= (b as u64) << (i * 8);
        }
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for (i, &b) in tail.iter().take(8).enumerate() {
            k1 |= (b as u64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

/// The 64-bit hash used to address native commands: the low half of
/// [`hash128`] with seed 0 over the qualified command name.
#[inline]
pub fn hash64(name: &[u8]) -> u64 {
    hash128(name, 0).0
}

/// `str.hash` view of [`hash128`]: four 32-bit words, low to high.
#[inline]
pub fn hash_words(data: &[u8], seed: u64) -> [u32; 4] {
    let (h1, h2) = hash128(data, seed);
    [
        (h1 & 0xFFFF_FFFF) as u32,
        (h1 >> 32) as u32,
        (h2 & 0xFFFF_FFFF) as u32,
        (h2 >> 32) as u32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from the canonical MurmurHash3 implementation.

    #[test]
    fn test_empty_seed_zero() {
        assert_eq!(hash128(b"", 0), (0, 0));
        assert_eq!(hash_words(b"", 0), [0, 0, 0, 0]);
    }

    #[test]
    fn test_hello() {
        let (h1, h2) = hash128(b"hello", 0);
        assert_eq!(h1, 0xcbd8_a7b3_41bd_9b02);
        assert_eq!(h2, 0x5b1e_906a_48ae_1d19);
    }

    #[test]
    fn test_hello_words() {
        assert_eq!(
            hash_words(b"hello", 0),
            [0x41bd_9b02, 0xcbd8_a7b3, 0x48ae_1d19, 0x5b1e_906a]
        );
    }

    #[test]
    fn test_block_boundary_lengths() {
        // 16 and 17 bytes exercise the block loop and the tail together.
        let a = hash128(b"0123456789abcdef", 0);
        let b = hash128(b"0123456789abcdefg", 0);
        assert_ne!(a, b);
        assert_ne!(a, (0, 0));
    }

    #[test]
    fn test_seed_changes_hash() {
        assert_ne!(hash128(b"wisp", 0), hash128(b"wisp", 1));
    }

    #[test]
    fn test_hash64_is_h1() {
        assert_eq!(hash64(b"hello"), 0xcbd8_a7b3_41bd_9b02);
    }
}
