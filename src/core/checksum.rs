use sha2::{Digest, Sha256};

/// Deterministic fingerprints for cache keys and connection identity.
///
/// Digests are SHA-256 rendered as 64 uppercase hex characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumService;

impl ChecksumService {
    pub fn new() -> Self {
        Self
    }

    /// Digest of the UTF-8 bytes of `input`.
    pub fn generate(&self, input: &str) -> String {
        self.generate_bytes(input.as_bytes())
    }

    pub fn generate_bytes(&self, input: &[u8]) -> String {
        hex::encode_upper(Sha256::digest(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let checksum = ChecksumService::new();
        let cases = [
            (
                "zxmQUjcyAA2c0rWMeGvpke8cUabxX4kwk8KPIlIw",
                "F04AF32B23E11325909A7F74F23925BAA033CD1C97329C0826FEECFBF8AD683C",
            ),
            (
                "TJvVZtoU0FbQGLY9KR34RYFXv6ShrwkSubsH7MGK",
                "9077870EE69DD8BA15E5DC7E5E21E9C04A9120815078EF8CC70CE2EC9F48ABB1",
            ),
            (
                "asdjasdhuoi2e9u12498!&$*(",
                "29D09A6BD8916C541D5DF2BD1628EBB8EFB10366A7ADC5E5B9D6E1F79C7A1827",
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(checksum.generate(input), expected);
        }
    }

    #[test]
    fn test_string_and_bytes_agree() {
        let checksum = ChecksumService::new();
        assert_eq!(
            checksum.generate("same input"),
            checksum.generate_bytes(b"same input")
        );
        assert_eq!(checksum.generate("a").len(), 64);
        assert_ne!(checksum.generate("a"), checksum.generate("b"));
    }
}
