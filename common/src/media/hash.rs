use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument};
use xxhash_rust::xxh3::Xxh3;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

// hashing worker pool
//
// content hashing is cpu-bound and must not occupy a download slot, so all
// digests run on the blocking pool behind this process-wide permit count
const HASH_WORKERS: usize = 3;

static HASH_SLOTS: Semaphore = Semaphore::const_new(HASH_WORKERS);

// the digest family is pinned per store; mixing algorithms would break the
// (hash, size) identity, so the choice is recorded in backup_metadata and
// checked on open
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgorithm {
    Xxh3_128,
    Sha256,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "xxh3-128" => Ok(HashAlgorithm::Xxh3_128),
            "sha-256" => Ok(HashAlgorithm::Sha256),
            _ => Err(anyhow::Error::msg(format!(
                "unknown hash algorithm {name:?}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Xxh3_128 => "xxh3-128",
            HashAlgorithm::Sha256 => "sha-256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[instrument(skip_all)]
pub async fn content_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let _permit = HASH_SLOTS.acquire().await?;

    debug!({ path = ?path }, "calculating content hash");

    let path: PathBuf = path.to_owned();

    spawn_blocking(move || hash_file(&path, algorithm)).await?
}

fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    match algorithm {
        HashAlgorithm::Xxh3_128 => {
            let mut hasher = Xxh3::new();

            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }

            Ok(format!("{:032x}", hasher.digest128()))
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();

            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }

            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[tokio::test]
    async fn digests_are_stable_across_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");

        // larger than one chunk so the streaming path is exercised
        let data = vec![0xabu8; HASH_CHUNK_SIZE * 2 + 17];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let first = content_hash(&path, HashAlgorithm::Xxh3_128).await.unwrap();
        let second = content_hash(&path, HashAlgorithm::Xxh3_128).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[tokio::test]
    async fn sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");

        std::fs::write(&path, b"abc").unwrap();

        let digest = content_hash(&path, HashAlgorithm::Sha256).await.unwrap();

        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        assert!(
            content_hash(&dir.path().join("nope"), HashAlgorithm::Xxh3_128)
                .await
                .is_err()
        );
    }

    #[test]
    fn algorithm_names_round_trip() {
        for algorithm in [HashAlgorithm::Xxh3_128, HashAlgorithm::Sha256] {
            assert_eq!(
                HashAlgorithm::from_name(algorithm.name()).unwrap(),
                algorithm
            );
        }

        assert!(HashAlgorithm::from_name("md5").is_err());
    }
}
