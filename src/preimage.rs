use crate::challenge::Challenge;

/// Assembles the byte sequence hashed for a given nonce/address/challenge.
/// The exact ordering and concatenation is a bit-exact
/// protocol contract with the remote service, not a design choice: nonce,
/// address, latest_submission, then no_pre_mine_hour, all concatenated as
/// their wire-format strings.
pub fn build_preimage(nonce_hex: &str, address: &str, challenge: &Challenge) -> Vec<u8> {
    let mut s = String::with_capacity(
        nonce_hex.len() + address.len() + challenge.latest_submission.len() + challenge.no_pre_mine_hour.len(),
    );
    s.push_str(nonce_hex);
    s.push_str(address);
    s.push_str(&challenge.latest_submission);
    s.push_str(&challenge.no_pre_mine_hour);
    s.into_bytes()
}

/// Formats a nonce as the fixed-width 16-hex-char string the preimage and
/// the submission URL expect.
pub fn nonce_to_hex(nonce: u64) -> String {
    format!("{:016x}", nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeCode;

    fn challenge() -> Challenge {
        Challenge {
            challenge_id: "**D07C10".into(),
            difficulty: "ffffffff".into(),
            latest_submission: "abc123".into(),
            no_pre_mine: "e8a195800b".into(),
            no_pre_mine_hour: "def456".into(),
            starts_at: "2026-01-01T00:00:00Z".into(),
            code: ChallengeCode::Active,
        }
    }

    #[test]
    fn preimage_concatenation_order() {
        let nonce = "0000000000000001";
        let address = "addr1test123";
        let preimage = build_preimage(nonce, address, &challenge());
        let expected = b"0000000000000001addr1test123abc123def456";
        assert_eq!(preimage, expected);
    }

    #[test]
    fn nonce_formatting_is_16_hex_chars() {
        assert_eq!(nonce_to_hex(1), "0000000000000001");
        assert_eq!(nonce_to_hex(0xdeadbeef), "00000000deadbeef");
        assert_eq!(nonce_to_hex(u64::MAX).len(), 16);
    }

    #[test]
    fn different_nonces_change_only_the_prefix() {
        let a = build_preimage(&nonce_to_hex(1), "addr1xyz", &challenge());
        let b = build_preimage(&nonce_to_hex(2), "addr1xyz", &challenge());
        assert_ne!(a, b);
        assert_eq!(&a[16..], &b[16..]);
    }
}
