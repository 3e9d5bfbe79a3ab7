use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use log::debug;
use sha2::{Digest, Sha256};

use crate::connections::errors::SftpError;
use crate::core::session::Session;
use crate::protocol::{decode_check_file_reply, Request, Response, StatusCode};

pub const DIGEST_ALGORITHM: &str = "sha256";

/// Hex SHA-256 of a local file, computed on the blocking pool.
pub async fn sha256_file(path: &Path) -> Result<String, SftpError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String, SftpError> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| SftpError::Protocol(format!("checksum task failed: {e}")))?
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of an open remote file via `check-file-handle`.
///
/// `Ok(None)` means the server cannot compute it.
pub async fn remote_sha256(session: &Session, handle: &Bytes) -> Result<Option<String>, SftpError> {
    if !session.supports_check_file() {
        return Ok(None);
    }
    let response = session
        .request(&Request::CheckFile {
            handle: handle.clone(),
            algorithms: DIGEST_ALGORITHM.into(),
            offset: 0,
            length: 0,
            block_size: 0,
        })
        .await?;
    match response {
        Response::ExtendedReply(data) => {
            let (algorithm, hash) = decode_check_file_reply(&data)?;
            if algorithm != DIGEST_ALGORITHM {
                return Err(SftpError::Protocol(format!(
                    "asked for {DIGEST_ALGORITHM} digest, got {algorithm}"
                )));
            }
            Ok(Some(hex::encode(hash)))
        }
        Response::Status {
            code: StatusCode::OpUnsupported,
            message,
        } => {
            debug!("check-file-handle unsupported: {}", message);
            Ok(None)
        }
        other => other.check().and_then(|other| {
            Err(SftpError::Protocol(format!(
                "unexpected reply to check-file-handle: {other:?}"
            )))
        }),
    }
}
