//! Streaming SHA-256 content hashing.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::IntakeError;
use crate::models::ContentDigest;

const CHUNK_SIZE: usize = 8 * 1024;

/// Compute the SHA-256 digest and byte length of a file without loading it
/// into memory at once.
pub async fn digest_file(path: &Path) -> Result<(ContentDigest, u64), IntakeError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IntakeError::io(path, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| IntakeError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);

    tracing::debug!(
        path = %path.display(),
        size_bytes = total,
        digest_prefix = %hex::encode(&out[..4]),
        "Computed content digest"
    );

    Ok((ContentDigest(out), total))
}
