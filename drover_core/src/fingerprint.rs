use serde::Deserialize;

/// Hash used to derive a job id from its command line.
///
/// Job ids are fingerprints, not cryptographic identities. Two different command
/// lines may map to the same id; the registry treats that as an existing job and
/// rejects the second one (see [`crate::registry::RegistryError::Conflict`]).
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintAlgorithm {
    /// 32-bit CRC rendered in decimal. Narrow, but ids stay short enough to type.
    #[default]
    Crc32,
    /// 128-bit MD5 rendered as lowercase hex.
    Md5,
}

impl FingerprintAlgorithm {
    pub fn fingerprint(&self, command: &str) -> String {
        match self {
            FingerprintAlgorithm::Crc32 => crc32fast::hash(command.as_bytes()).to_string(),
            FingerprintAlgorithm::Md5 => format!("{:x}", md5::compute(command.as_bytes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_reference_value() {
        // CRC-32/ISO-HDLC check value.
        assert_eq!(FingerprintAlgorithm::Crc32.fingerprint("123456789"), "3421780262");
    }

    #[yare::parameterized(
        crc32 = { FingerprintAlgorithm::Crc32 },
        md5 = { FingerprintAlgorithm::Md5 },
    )]
    fn fingerprint_is_deterministic(algorithm: FingerprintAlgorithm) {
        let a = algorithm.fingerprint("prog --input @@");
        let b = algorithm.fingerprint("prog --input @@");
        assert_eq!(a, b);
        assert_ne!(a, algorithm.fingerprint("prog --input @@ -x"));
    }

    #[test]
    fn md5_is_full_width_hex() {
        let id = FingerprintAlgorithm::Md5.fingerprint("prog");
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
