//! Filename- and content-based routing for clean files.
//!
//! Decision order, first match wins:
//!   1. image extension -> `Photos`
//!   2. configured keyword group matched against the lowercased filename,
//!      in declaration order
//!   3. sender/date folder derived from the file's own content, falling
//!      back to `unknown` / the processing date when nothing is found
//!
//! The classifier reads at most a small prefix of the file and never fails
//! an intake: an unreadable file simply lands in the fallback bucket.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{NaiveDate, Utc};
use regex::Regex;

use dropgate_core::config::IntakeConfig;
use dropgate_core::models::{extension_of, Category};

/// Bytes of content sampled when probing for a sender address or a date.
const CONTENT_SAMPLE_LEN: usize = 64 * 1024;

/// Extensions whose content is worth sampling for sender/date hints.
/// Binary formats are skipped; their sample would be noise.
const TEXTUAL_EXTENSIONS: &[&str] = &[
    "txt", "md", "csv", "log", "eml", "html", "htm", "xml", "json", "pdf",
];

const FALLBACK_SENDER: &str = "unknown";

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+)")
            .expect("email regex is valid")
    })
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,4})[-/](\d{1,2})[-/](\d{1,4})\b").expect("date regex is valid")
    })
}

pub struct Classifier {
    image_extensions: Vec<String>,
    keyword_groups: Vec<dropgate_core::config::KeywordGroup>,
}

impl Classifier {
    pub fn from_config(config: &IntakeConfig) -> Self {
        Self {
            image_extensions: config.image_extensions.clone(),
            keyword_groups: config.keyword_groups.clone(),
        }
    }

    /// Decide the routing category for a file. Never fails the intake.
    pub fn classify(&self, path: &Path) -> Category {
        if let Some(ext) = extension_of(path) {
            if self.image_extensions.iter().any(|e| *e == ext) {
                return Category::Photos;
            }
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();

        for group in &self.keyword_groups {
            if group.keywords.iter().any(|kw| filename.contains(kw)) {
                return Category::ContentGroup(group.name.clone());
            }
        }

        let sample = read_content_sample(path);
        let sender = sample
            .as_deref()
            .and_then(extract_sender)
            .unwrap_or_else(|| FALLBACK_SENDER.to_string());
        let date = sample
            .as_deref()
            .and_then(extract_date)
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());

        Category::SenderDate { sender, date }
    }

    /// The directory a category maps to, relative to the organized root.
    pub fn relative_dir(category: &Category) -> PathBuf {
        match category {
            Category::Photos => PathBuf::from("Photos"),
            Category::ContentGroup(name) => PathBuf::from(name),
            Category::SenderDate { sender, date } => PathBuf::from(sender).join(date),
        }
    }
}

/// Read up to [`CONTENT_SAMPLE_LEN`] bytes as lossy UTF-8, but only for
/// extensions where textual content is plausible.
fn read_content_sample(path: &Path) -> Option<String> {
    let ext = extension_of(path)?;
    if !TEXTUAL_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    use std::io::Read;
    let file = std::fs::File::open(path).ok()?;
    let mut buf = Vec::with_capacity(CONTENT_SAMPLE_LEN);
    file.take(CONTENT_SAMPLE_LEN as u64).read_to_end(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// First email address in the sample, sanitized for use as a directory name.
fn extract_sender(sample: &str) -> Option<String> {
    let raw = email_regex().find(sample)?.as_str();
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    Some(sanitized)
}

/// First calendar-valid date in the sample, normalized to `YYYY-MM-DD`.
/// Accepts year-first (`2024-03-07`) and day-first (`07-03-2024`) forms;
/// the four-digit field decides which end is the year.
fn extract_date(sample: &str) -> Option<String> {
    for caps in date_regex().captures_iter(sample) {
        let (year, month, day) = if caps[1].len() == 4 {
            (&caps[1], &caps[2], &caps[3])
        } else if caps[3].len() == 4 {
            (&caps[3], &caps[2], &caps[1])
        } else {
            continue;
        };
        let (Ok(year), Ok(month), Ok(day)) =
            (year.parse::<i32>(), month.parse::<u32>(), day.parse::<u32>())
        else {
            continue;
        };
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropgate_core::config::KeywordGroup;

    fn classifier_with_groups(groups: Vec<KeywordGroup>) -> Classifier {
        let mut config = IntakeConfig::rooted_at("/tmp/classifier-test");
        config.keyword_groups = groups;
        Classifier::from_config(&config)
    }

    #[test]
    fn image_extension_routes_to_photos() {
        let c = classifier_with_groups(vec![KeywordGroup::new("Docs", &["photo"])]);
        // Extension beats any keyword match.
        assert_eq!(c.classify(Path::new("/in/photo_album.JPG")), Category::Photos);
        assert_eq!(c.classify(Path::new("/in/scan.heic")), Category::Photos);
    }

    #[test]
    fn first_declared_group_wins() {
        let c = classifier_with_groups(vec![
            KeywordGroup::new("Springfield", &["homer", "bart"]),
            KeywordGroup::new("Finance", &["invoice"]),
        ]);
        assert_eq!(
            c.classify(Path::new("/in/Invoice_HomerSimpson.pdf")),
            Category::ContentGroup("Springfield".into())
        );
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let c = classifier_with_groups(vec![KeywordGroup::new("Finance", &["invoice"])]);
        assert_eq!(
            c.classify(Path::new("/in/INVOICE-2024.docx")),
            Category::ContentGroup("Finance".into())
        );
    }

    #[test]
    fn sender_and_date_extracted_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "From: alice@example.com\nSent 2024/3/7\n").unwrap();

        let c = classifier_with_groups(Vec::new());
        assert_eq!(
            c.classify(&path),
            Category::SenderDate {
                sender: "alice@example.com".into(),
                date: "2024-03-07".into(),
            }
        );
    }

    #[test]
    fn fallback_sender_when_content_has_no_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "no addresses here").unwrap();

        let c = classifier_with_groups(Vec::new());
        match c.classify(&path) {
            Category::SenderDate { sender, date } => {
                assert_eq!(sender, "unknown");
                assert_eq!(date, Utc::now().format("%Y-%m-%d").to_string());
            }
            other => panic!("unexpected category {:?}", other),
        }
    }

    #[test]
    fn binary_extension_skips_content_probe() {
        let c = classifier_with_groups(Vec::new());
        // Nonexistent path with a binary extension must not error.
        match c.classify(Path::new("/does/not/exist/blob.bin")) {
            Category::SenderDate { sender, .. } => assert_eq!(sender, "unknown"),
            other => panic!("unexpected category {:?}", other),
        }
    }

    #[test]
    fn implausible_dates_rejected() {
        assert_eq!(extract_date("meeting on 2024-13-40"), None);
        // February 31st never exists; February 29th does in a leap year.
        assert_eq!(extract_date("due 2024-02-31"), None);
        assert_eq!(extract_date("2024-02-29 works"), Some("2024-02-29".into()));
        assert_eq!(extract_date("2023-02-29 does not"), None);
    }

    #[test]
    fn day_first_dates_are_normalized() {
        assert_eq!(extract_date("sent 07-03-2024"), Some("2024-03-07".into()));
        assert_eq!(extract_date("sent 07/03/2024"), Some("2024-03-07".into()));
        // An invalid match does not mask a later valid one.
        assert_eq!(
            extract_date("31-02-2024 then 2024-03-07"),
            Some("2024-03-07".into())
        );
    }

    #[test]
    fn category_directories() {
        assert_eq!(Classifier::relative_dir(&Category::Photos), PathBuf::from("Photos"));
        assert_eq!(
            Classifier::relative_dir(&Category::ContentGroup("Finance".into())),
            PathBuf::from("Finance")
        );
        assert_eq!(
            Classifier::relative_dir(&Category::SenderDate {
                sender: "a@b.c".into(),
                date: "2024-01-02".into()
            }),
            PathBuf::from("a@b.c/2024-01-02")
        );
    }
}
