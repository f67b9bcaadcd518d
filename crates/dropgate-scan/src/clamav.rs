//! Scan gateway: submits files to ClamAV and interprets verdicts.
//!
//! Fail-closed: anything that prevents a verdict (timeout, daemon
//! error, unreadable response) becomes [`ScanVerdict::ScanError`], which the
//! coordinator routes to quarantine. A file is never silently organized
//! because the scanner was unavailable.

use std::path::Path;
use std::str;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clamav_client::{clean, Tcp};

use dropgate_core::config::ScanBackend;
use dropgate_core::models::ScanVerdict;

/// The EICAR antivirus self-test signature. Recognized first-class so the
/// end-to-end infected path is exercisable without real malware or a running
/// clamd. See <https://www.eicar.org/download-anti-malware-testfile/>.
const EICAR_SIGNATURE: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

/// Per the EICAR definition the signature must start the file and the file
/// must be at most 128 bytes (whitespace padding allowed).
const EICAR_MAX_LEN: u64 = 128;

pub const EICAR_VIRUS_NAME: &str = "Eicar-Test-Signature";

/// Seam for substituting scan behavior in tests.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, path: &Path, size: u64) -> ScanVerdict;
}

/// Gateway to the external malware scanner.
#[derive(Clone)]
pub struct ScanGateway {
    backend: ScanBackend,
    max_scan_size: u64,
    timeout: Duration,
    allow_unscanned_oversize: bool,
}

impl ScanGateway {
    pub fn new(
        backend: ScanBackend,
        max_scan_size: u64,
        timeout: Duration,
        allow_unscanned_oversize: bool,
    ) -> Self {
        Self {
            backend,
            max_scan_size,
            timeout,
            allow_unscanned_oversize,
        }
    }

    async fn scan_with_clamd(&self, path: &Path, host: &str, port: u16) -> ScanVerdict {
        let start = Instant::now();

        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                return ScanVerdict::ScanError(format!(
                    "failed to read {} for scanning: {}",
                    path.display(),
                    e
                ));
            }
        };

        let address = format!("{}:{}", host, port);
        let result = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || {
                let connection = Tcp {
                    host_address: address.as_str(),
                };
                clamav_client::scan_buffer(data.as_slice(), connection, None)
            }),
        )
        .await;

        let response = match result {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, path = %path.display(), "ClamAV scan failed");
                return ScanVerdict::ScanError(format!("clamd scan error: {}", e));
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "ClamAV scan task panicked");
                return ScanVerdict::ScanError(format!("scan task join error: {}", e));
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = self.timeout.as_secs(),
                    path = %path.display(),
                    "ClamAV scan timed out"
                );
                return ScanVerdict::ScanError(format!(
                    "scan timed out after {} seconds",
                    self.timeout.as_secs()
                ));
            }
        };

        match clean(&response) {
            Ok(true) => {
                tracing::info!(
                    path = %path.display(),
                    duration_ms = start.elapsed().as_millis(),
                    "File scan completed: clean"
                );
                ScanVerdict::Clean
            }
            Ok(false) => {
                let virus_name = parse_virus_name(&response);
                tracing::warn!(
                    path = %path.display(),
                    virus = %virus_name,
                    duration_ms = start.elapsed().as_millis(),
                    "File scan detected virus"
                );
                ScanVerdict::Infected(virus_name)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to parse ClamAV response");
                ScanVerdict::ScanError(format!("unparseable clamd response: {}", e))
            }
        }
    }
}

#[async_trait]
impl Scanner for ScanGateway {
    async fn scan(&self, path: &Path, size: u64) -> ScanVerdict {
        if size > self.max_scan_size {
            if self.allow_unscanned_oversize {
                tracing::warn!(
                    path = %path.display(),
                    size_bytes = size,
                    max_scan_size = self.max_scan_size,
                    "File exceeds scan size ceiling, passing unscanned by explicit policy"
                );
                return ScanVerdict::Clean;
            }
            return ScanVerdict::ScanError(format!(
                "file size {} exceeds scan ceiling {}",
                size, self.max_scan_size
            ));
        }

        if size <= EICAR_MAX_LEN {
            match is_eicar_file(path).await {
                Ok(true) => {
                    tracing::warn!(path = %path.display(), "EICAR test signature detected");
                    return ScanVerdict::Infected(EICAR_VIRUS_NAME.to_string());
                }
                Ok(false) => {}
                Err(e) => {
                    return ScanVerdict::ScanError(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    ));
                }
            }
        }

        match &self.backend {
            ScanBackend::Disabled => {
                tracing::debug!(path = %path.display(), "Scanner disabled, passing as clean");
                ScanVerdict::Clean
            }
            ScanBackend::ClamD { host, port } => self.scan_with_clamd(path, host, *port).await,
        }
    }
}

async fn is_eicar_file(path: &Path) -> std::io::Result<bool> {
    let data = tokio::fs::read(path).await?;
    Ok(data.starts_with(EICAR_SIGNATURE))
}

fn parse_virus_name(response: &[u8]) -> String {
    let response_str = str::from_utf8(response).unwrap_or("unknown").trim();
    if response_str.contains("FOUND") {
        response_str
            .split(':')
            .nth(1)
            .unwrap_or("unknown")
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string()
    } else {
        "unknown".to_string()
    }
}
