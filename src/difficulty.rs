/// Difficulty predicate.
///
/// Both `hash` and `difficulty` are treated as fixed-length big-endian byte
/// sequences. A hash is accepted iff every bit set in the hash is also set
/// in the difficulty mask: `(hash | difficulty) == difficulty`. The
/// difficulty is shorter than the hash in practice (it only constrains a
/// prefix); bytes of the hash beyond the difficulty's length are
/// unconstrained, matching the service's own dominance check over the
/// difficulty-length prefix (grounded in the reference ShadowHarvester
/// check of `(prefix | mask) == mask`).
pub fn matches_difficulty(hash: &[u8], difficulty: &[u8]) -> bool {
    if hash.len() < difficulty.len() {
        return false;
    }
    hash.iter()
        .zip(difficulty.iter())
        .all(|(h, d)| (h | d) == *d)
}

/// Number of leading zero bits in `difficulty`, exposed for logging only
/// — it plays no role in acceptance.
pub fn zero_bit_prefix(difficulty: &[u8]) -> usize {
    let mut zero_bits = 0;
    for byte in difficulty {
        if *byte == 0 {
            zero_bits += 8;
        } else {
            zero_bits += byte.leading_zeros() as usize;
            break;
        }
    }
    zero_bits
}

/// Decode an even-length hex string into bytes, for difficulty/hash values
/// that arrive as hex over the wire.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ones_difficulty_accepts_every_hash() {
        let difficulty = decode_hex("ffffffff").unwrap();
        let hash = decode_hex("00000000111111112222222233333333").unwrap();
        assert!(matches_difficulty(&hash, &difficulty));
        let hash = decode_hex("ffffffffffffffffffffffffffffffff").unwrap();
        assert!(matches_difficulty(&hash, &difficulty));
    }

    #[test]
    fn all_zero_difficulty_accepts_only_all_zero_prefix() {
        let difficulty = decode_hex("00000000").unwrap();
        let zero_hash = decode_hex("00000000111111112222222233333333").unwrap();
        assert!(matches_difficulty(&zero_hash, &difficulty));

        let nonzero_hash = decode_hex("ff00000011111111222222223333333344").unwrap();
        assert!(!matches_difficulty(&nonzero_hash, &difficulty));
    }

    #[test]
    fn partial_mask_dominance() {
        // 0x7fffffff requires the top bit of the hash prefix to be 0.
        let difficulty = decode_hex("7fffffff").unwrap();
        let good = decode_hex("0000000011111111").unwrap();
        assert!(matches_difficulty(&good, &difficulty));

        let bad = decode_hex("8000000011111111").unwrap();
        assert!(!matches_difficulty(&bad, &difficulty));
    }

    #[test]
    fn zero_bit_prefix_counts_leading_zero_bits() {
        assert_eq!(zero_bit_prefix(&decode_hex("00000000").unwrap()), 32);
        assert_eq!(zero_bit_prefix(&decode_hex("00ffffff").unwrap()), 8);
        assert_eq!(zero_bit_prefix(&decode_hex("7fffffff").unwrap()), 1);
        assert_eq!(zero_bit_prefix(&decode_hex("ffffffff").unwrap()), 0);
    }

    #[test]
    fn short_hash_never_matches() {
        let difficulty = decode_hex("ffffffff").unwrap();
        let hash = decode_hex("ff").unwrap();
        assert!(!matches_difficulty(&hash, &difficulty));
    }
}
