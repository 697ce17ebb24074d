//
// Random values, digests and constant time compares
//
use data_encoding::{Encoding, HEXLOWER};
use ring::digest::{digest, SHA256};

use crate::error::Error;

pub fn get_random_bytes<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut array = [0; N];
    SystemRandom::new().fill(&mut array).expect("Error generating random values");

    array
}

/// Encodes random bytes using the provided function.
pub fn encode_random_bytes<const N: usize>(e: Encoding) -> String {
    e.encode(&get_random_bytes::<N>())
}

/// Opaque bearer material: N random bytes, hex encoded.
pub fn generate_token<const N: usize>() -> String {
    encode_random_bytes::<N>(HEXLOWER)
}

/// Generates a numeric code of up to 19 digits, zero padded.
pub fn generate_numeric_code(token_size: u32) -> Result<String, Error> {
    if token_size > 19 {
        err!("Token size is limited to 19 digits")
    }

    // 8 bytes to create an u64 for up to 19 token digits
    let bytes = get_random_bytes::<8>();
    let number = u64::from_be_bytes(bytes) % 10u64.pow(token_size);
    Ok(format!("{number:0size$}", size = token_size as usize))
}

/// SHA-256 of the input, hex encoded. Stored tokens only ever exist in
/// this form; the plaintext is handed out once at mint time.
pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(digest(&SHA256, data).as_ref())
}

//
// Constant time compare
//
pub fn ct_eq<T: AsRef<[u8]>, U: AsRef<[u8]>>(a: T, b: U) -> bool {
    use ring::constant_time::verify_slices_are_equal;

    verify_slices_are_equal(a.as_ref(), b.as_ref()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_is_hex_of_expected_length() {
        let token = generate_token::<32>();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_numeric_code_has_requested_digits() {
        for _ in 0..32 {
            let code = generate_numeric_code(6).unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_generate_numeric_code_rejects_oversized_request() {
        assert!(generate_numeric_code(20).is_err());
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // Empty input digest, straight from FIPS 180-4 test vectors.
        assert_eq!(sha256_hex(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq("abc", "abc"));
        assert!(!ct_eq("abc", "abd"));
        assert!(!ct_eq("abc", "abcd"));
    }
}
