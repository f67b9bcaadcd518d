//! Configuration for the intake pipeline.
//!
//! Everything is env-driven with safe defaults, mirroring the deployment
//! story of the daemon: directories for the watch/organized/quarantine/
//! scratch trees, the scanner backend, and the numeric extraction limits.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// A named, ordered keyword group. Filenames containing any of the keywords
/// (case-insensitive) route to the group's folder. Declaration order is the
/// match order: a filename matching two groups resolves to the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordGroup {
    pub name: String,
    pub keywords: Vec<String>,
}

impl KeywordGroup {
    pub fn new(name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

/// Limits enforced by the archive inspector and safe extractor.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionLimits {
    /// Maximum number of entries across one archive.
    pub max_entry_count: usize,
    /// Maximum cumulative uncompressed size in bytes.
    pub max_total_uncompressed: u64,
    /// Maximum per-entry (or whole-archive, for tar.gz) compression ratio.
    pub max_compression_ratio: u64,
    /// Maximum nesting depth for archives inside archives.
    pub max_nesting_depth: u32,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_entry_count: DEFAULT_MAX_ENTRY_COUNT,
            max_total_uncompressed: DEFAULT_MAX_TOTAL_UNCOMPRESSED,
            max_compression_ratio: DEFAULT_MAX_COMPRESSION_RATIO,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

/// Which malware scanner backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanBackend {
    /// ClamAV daemon over TCP.
    ClamD { host: String, port: u16 },
    /// No external scanner; every file passes as clean. The EICAR self-test
    /// signature is still recognized, so the infected path stays testable.
    Disabled,
}

const DEFAULT_MAX_ENTRY_COUNT: usize = 1000;
const DEFAULT_MAX_TOTAL_UNCOMPRESSED: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_COMPRESSION_RATIO: u64 = 100;
const DEFAULT_MAX_NESTING_DEPTH: u32 = 3;
const DEFAULT_MAX_SCAN_SIZE: u64 = 200 * 1024 * 1024;
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_STABILITY_DELAY_MS: u64 = 200;
const DEFAULT_COALESCE_WINDOW_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub watch_dir: PathBuf,
    pub organized_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub scratch_dir: PathBuf,

    /// Image detection is extension-based only, never content-sniffed.
    pub image_extensions: Vec<String>,
    /// Temp/partial-download extensions skipped outright.
    pub ignore_extensions: Vec<String>,
    /// Archive container extensions the extractor understands.
    pub archive_extensions: Vec<String>,
    /// Ordered keyword groups; first declared wins.
    pub keyword_groups: Vec<KeywordGroup>,

    pub limits: ExtractionLimits,

    pub scan_backend: ScanBackend,
    pub max_scan_size: u64,
    pub scan_timeout: Duration,
    /// When true, files above `max_scan_size` pass unscanned with a warning
    /// instead of becoming scan errors. Off by default (fail closed).
    pub allow_unscanned_oversize: bool,

    pub max_retry_attempts: u32,
    pub max_workers: usize,
    pub stability_delay: Duration,
    pub coalesce_window: Duration,

    /// Optional path for persisting the dedup digest seed across restarts.
    pub dedup_seed_path: Option<PathBuf>,
}

impl IntakeConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let watch_dir = PathBuf::from(
            env::var("DROPGATE_WATCH_DIR").unwrap_or_else(|_| "downloads".to_string()),
        );
        let organized_dir = PathBuf::from(
            env::var("DROPGATE_ORGANIZED_DIR").unwrap_or_else(|_| "organized".to_string()),
        );
        let quarantine_dir = PathBuf::from(
            env::var("DROPGATE_QUARANTINE_DIR").unwrap_or_else(|_| "quarantine".to_string()),
        );
        let scratch_dir = PathBuf::from(
            env::var("DROPGATE_SCRATCH_DIR").unwrap_or_else(|_| "scratch".to_string()),
        );

        let scan_backend = match env::var("DROPGATE_CLAMD_HOST") {
            Ok(host) if !host.is_empty() => ScanBackend::ClamD {
                host,
                port: parse_env("DROPGATE_CLAMD_PORT", 3310),
            },
            _ => ScanBackend::Disabled,
        };

        let keyword_groups = env::var("DROPGATE_KEYWORD_GROUPS")
            .map(|raw| parse_keyword_groups(&raw))
            .unwrap_or_default();

        let config = Self {
            watch_dir,
            organized_dir,
            quarantine_dir,
            scratch_dir,
            image_extensions: parse_env_list(
                "DROPGATE_IMAGE_EXTENSIONS",
                "png,jpg,jpeg,tiff,tif,bmp,gif,webp,svg,ico,raw,heic,heif",
            ),
            ignore_extensions: parse_env_list("DROPGATE_IGNORE_EXTENSIONS", "part,crdownload,tmp"),
            archive_extensions: parse_env_list("DROPGATE_ARCHIVE_EXTENSIONS", "zip,tar,gz,tgz"),
            keyword_groups,
            limits: ExtractionLimits {
                max_entry_count: parse_env("DROPGATE_MAX_EXTRACTION_FILES", DEFAULT_MAX_ENTRY_COUNT),
                max_total_uncompressed: parse_env(
                    "DROPGATE_MAX_EXTRACTION_BYTES",
                    DEFAULT_MAX_TOTAL_UNCOMPRESSED,
                ),
                max_compression_ratio: parse_env(
                    "DROPGATE_MAX_COMPRESSION_RATIO",
                    DEFAULT_MAX_COMPRESSION_RATIO,
                ),
                max_nesting_depth: parse_env(
                    "DROPGATE_MAX_EXTRACTION_DEPTH",
                    DEFAULT_MAX_NESTING_DEPTH,
                ),
            },
            scan_backend,
            max_scan_size: parse_env("DROPGATE_MAX_SCAN_SIZE", DEFAULT_MAX_SCAN_SIZE),
            scan_timeout: Duration::from_secs(parse_env(
                "DROPGATE_SCAN_TIMEOUT_SECS",
                DEFAULT_SCAN_TIMEOUT_SECS,
            )),
            allow_unscanned_oversize: parse_env("DROPGATE_ALLOW_UNSCANNED_OVERSIZE", false),
            max_retry_attempts: parse_env("DROPGATE_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS),
            max_workers: parse_env("DROPGATE_MAX_WORKERS", DEFAULT_MAX_WORKERS),
            stability_delay: Duration::from_millis(parse_env(
                "DROPGATE_STABILITY_DELAY_MS",
                DEFAULT_STABILITY_DELAY_MS,
            )),
            coalesce_window: Duration::from_millis(parse_env(
                "DROPGATE_COALESCE_WINDOW_MS",
                DEFAULT_COALESCE_WINDOW_MS,
            )),
            dedup_seed_path: env::var("DROPGATE_DEDUP_SEED").ok().map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// A config rooted under one directory, with defaults everywhere else.
    /// Used by tests and by the daemon's `--root` shorthand.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            watch_dir: root.join("downloads"),
            organized_dir: root.join("organized"),
            quarantine_dir: root.join("quarantine"),
            scratch_dir: root.join("scratch"),
            image_extensions: "png,jpg,jpeg,tiff,tif,bmp,gif,webp,svg,ico,raw,heic,heif"
                .split(',')
                .map(str::to_string)
                .collect(),
            ignore_extensions: vec!["part".into(), "crdownload".into(), "tmp".into()],
            archive_extensions: vec!["zip".into(), "tar".into(), "gz".into(), "tgz".into()],
            keyword_groups: Vec::new(),
            limits: ExtractionLimits::default(),
            scan_backend: ScanBackend::Disabled,
            max_scan_size: DEFAULT_MAX_SCAN_SIZE,
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
            allow_unscanned_oversize: false,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_workers: DEFAULT_MAX_WORKERS,
            stability_delay: Duration::from_millis(10),
            coalesce_window: Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS),
            dedup_seed_path: None,
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.limits.max_nesting_depth == 0 {
            anyhow::bail!("DROPGATE_MAX_EXTRACTION_DEPTH must be at least 1");
        }
        if self.limits.max_compression_ratio == 0 {
            anyhow::bail!("DROPGATE_MAX_COMPRESSION_RATIO must be at least 1");
        }
        if self.max_workers == 0 {
            anyhow::bail!("DROPGATE_MAX_WORKERS must be at least 1");
        }
        let roots = [
            (&self.organized_dir, "organized"),
            (&self.quarantine_dir, "quarantine"),
            (&self.scratch_dir, "scratch"),
        ];
        for (dir, name) in roots {
            if dir == &self.watch_dir {
                anyhow::bail!("{} directory must not equal the watch directory", name);
            }
        }
        Ok(())
    }

    pub fn is_image_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.image_extensions.iter().any(|e| *e == ext)
    }

    pub fn is_ignored_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.ignore_extensions.iter().any(|e| *e == ext)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_env_list(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `Group1:kw1|kw2;Group2:kw3` into ordered keyword groups.
fn parse_keyword_groups(raw: &str) -> Vec<KeywordGroup> {
    raw.split(';')
        .filter_map(|part| {
            let (name, keywords) = part.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let keywords: Vec<String> = keywords
                .split('|')
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if keywords.is_empty() {
                return None;
            }
            Some(KeywordGroup {
                name: name.to_string(),
                keywords,
            })
        })
        .collect()
}
