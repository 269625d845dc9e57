use bytes::Bytes;
use depot_core::{DomainConfig, ModuleConfig, StorageConfig};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of data as hex string
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Storage configuration with small multipart thresholds.
#[allow(dead_code)]
pub fn storage_config(chunk_size: u64, min_part_size: u64) -> StorageConfig {
    StorageConfig {
        bucket: "depot-test".to_string(),
        chunk_size,
        min_part_size,
        ..StorageConfig::default()
    }
}

/// A `files` module with a quota-exempt `system` domain and a signed `private` domain.
#[allow(dead_code)]
pub fn module_config() -> ModuleConfig {
    ModuleConfig {
        name: "files".to_string(),
        domains: vec![
            DomainConfig {
                name: "system".to_string(),
                acl: None,
                expires_secs: None,
                content_as_attachment: None,
                quota_exempt: true,
            },
            DomainConfig {
                name: "private".to_string(),
                acl: None,
                expires_secs: Some(600),
                content_as_attachment: None,
                quota_exempt: false,
            },
        ],
        ..ModuleConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash() {
        let data = b"hello world";
        let hash = sha256_hash(data);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_seeded_bytes_deterministic() {
        let data1 = seeded_bytes(42, 1000);
        let data2 = seeded_bytes(42, 1000);
        assert_eq!(data1, data2);
    }

    #[test]
    fn test_storage_config_is_valid() {
        assert!(storage_config(2048, 512).validate().is_ok());
    }
}
