// Local crates
use crate::helpers::load_config::FileSpecConfig;

// External crates
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Timelike};
use regex::Regex;
use std::path::{Path, PathBuf};

/// One configured file spec resolved against its directory: the basename
/// prefix, the rotation time pattern, the optional suffix, the destination
/// topic and a compiled matcher over candidate filenames.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub file_prefix: String,
    pub time_pattern: String,
    pub suffix: String,
    pub topic: String,
    matcher: Regex,
}

/// A directory under watch together with every pattern registered for it.
/// Multiple file specs may share a directory; the first matching entry wins.
#[derive(Debug, Clone)]
pub struct WatchedDir {
    pub dir: PathBuf,
    pub entries: Vec<PatternEntry>,
}

/// All configured file specs, grouped by watched directory.
#[derive(Debug, Clone)]
pub struct PatternRegistry {
    pub dirs: Vec<WatchedDir>,
}

impl PatternEntry {
    fn new(file_prefix: &str, time_pattern: &str, suffix: &str, topic: &str) -> Result<Self> {
        let expression = format!(
            "^{}{}{}$",
            regex::escape(file_prefix),
            translate_time_pattern(time_pattern),
            regex::escape(suffix)
        );
        let matcher = Regex::new(&expression)
            .with_context(|| format!("invalid filename matcher {expression:?}"))?;

        Ok(Self {
            file_prefix: file_prefix.to_string(),
            time_pattern: time_pattern.to_string(),
            suffix: suffix.to_string(),
            topic: topic.to_string(),
            matcher,
        })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.matcher.is_match(file_name)
    }

    /// The filename this spec produces for the rotation bucket containing
    /// `now`. A tracked file whose name differs is no longer being written.
    pub fn expected_name(&self, now: &DateTime<Local>) -> String {
        format!(
            "{}{}{}",
            self.file_prefix,
            materialize_time_pattern(&self.time_pattern, now),
            self.suffix
        )
    }
}

impl PatternRegistry {
    /// Resolve every configured file spec into its watched directory and
    /// compiled matcher. Directories are canonicalized so paths arriving from
    /// filesystem events compare equal to scanned ones; a missing directory
    /// is a configuration error.
    pub fn from_config(files: &[FileSpecConfig]) -> Result<Self> {
        let mut dirs: Vec<WatchedDir> = Vec::new();

        for spec in files {
            let (dir_part, base_prefix) = split_prefix(&spec.prefix);
            let dir = std::fs::canonicalize(dir_part)
                .with_context(|| format!("watched directory {dir_part:?} is not accessible"))?;

            let entry =
                PatternEntry::new(base_prefix, &spec.time_pattern, &spec.suffix, &spec.topic)?;

            match dirs.iter_mut().find(|wd| wd.dir == dir) {
                Some(wd) => wd.entries.push(entry),
                None => dirs.push(WatchedDir {
                    dir,
                    entries: vec![entry],
                }),
            }
        }

        Ok(Self { dirs })
    }

    /// Match a full path against the registry: the parent directory selects
    /// the watched dir, the basename is tried against its entries in
    /// registration order.
    pub fn match_path(&self, path: &Path) -> Option<&PatternEntry> {
        let parent = path.parent()?;
        let name = path.file_name()?.to_str()?;
        self.dirs
            .iter()
            .find(|wd| wd.dir == parent)?
            .entries
            .iter()
            .find(|e| e.matches(name))
    }

    /// Look an entry back up from the identity a position record carries.
    pub fn entry_for(&self, dir: &Path, topic: &str, time_pattern: &str) -> Option<&PatternEntry> {
        self.dirs
            .iter()
            .find(|wd| wd.dir == dir)?
            .entries
            .iter()
            .find(|e| e.topic == topic && e.time_pattern == time_pattern)
    }
}

/// Split a configured prefix like `/var/log/app-` into the directory to
/// watch and the basename prefix. A prefix without a slash watches the
/// current directory.
fn split_prefix(prefix: &str) -> (&str, &str) {
    match prefix.rsplit_once('/') {
        Some(("", base)) => ("/", base),
        Some((dir, base)) => (dir, base),
        None => (".", prefix),
    }
}

/// Translate a strftime-style time pattern into a regular-expression
/// fragment. Only `%Y %m %d %H %M` are meaningful; any other `%X` escape
/// stands for the literal character `X`.
fn translate_time_pattern(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str("[0-9]{4}"),
            Some('m') | Some('d') | Some('H') | Some('M') => out.push_str("[0-9]{2}"),
            Some(other) => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            None => out.push_str(&regex::escape("%")),
        }
    }

    out
}

/// Instantiate a time pattern at a concrete local time, over the same escape
/// set as `translate_time_pattern`.
fn materialize_time_pattern(pattern: &str, now: &DateTime<Local>) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", now.year())),
            Some('m') => out.push_str(&format!("{:02}", now.month())),
            Some('d') => out.push_str(&format!("{:02}", now.day())),
            Some('H') => out.push_str(&format!("{:02}", now.hour())),
            Some('M') => out.push_str(&format!("{:02}", now.minute())),
            Some(other) => out.push(other),
            None => out.push('%'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(prefix: &str, pattern: &str, suffix: &str) -> PatternEntry {
        PatternEntry::new(prefix, pattern, suffix, "test-topic").unwrap()
    }

    #[test]
    fn matches_date_bucketed_names() {
        let e = entry("app-", "%Y-%m-%d", ".log");
        assert!(e.matches("app-2024-01-01.log"));
        assert!(e.matches("app-1999-12-31.log"));
        assert!(!e.matches("app-2024-01-01.log.1"));
        assert!(!e.matches("xapp-2024-01-01.log"));
        assert!(!e.matches("app-20x4-01-01.log"));
    }

    #[test]
    fn suffix_dot_is_literal() {
        let e = entry("app-", "%Y%m%d", ".log");
        assert!(e.matches("app-20240101.log"));
        assert!(!e.matches("app-20240101xlog"));
    }

    #[test]
    fn unknown_escape_is_literal() {
        let e = entry("app-", "%Q%H", "");
        assert!(e.matches("app-Q13"));
        assert!(!e.matches("app-X13"));
    }

    #[test]
    fn trailing_percent_is_literal() {
        let e = entry("app-", "%d%", "");
        assert!(e.matches("app-01%"));
    }

    #[test]
    fn hour_minute_buckets() {
        let e = entry("metrics.", "%Y-%m-%d_%H:%M", "");
        assert!(e.matches("metrics.2024-06-30_23:55"));
        assert!(!e.matches("metrics.2024-06-30_23:5"));
    }

    #[test]
    fn materializes_local_time() {
        let now = Local.with_ymd_and_hms(2024, 1, 31, 9, 5, 0).unwrap();
        assert_eq!(materialize_time_pattern("%Y-%m-%d", &now), "2024-01-31");
        assert_eq!(materialize_time_pattern("%H:%M", &now), "09:05");
        assert_eq!(materialize_time_pattern("%q%", &now), "q%");
    }

    #[test]
    fn expected_name_round_trips_through_matcher() {
        let e = entry("app-", "%Y-%m-%d", ".log");
        let now = Local.with_ymd_and_hms(2024, 1, 31, 9, 5, 0).unwrap();
        let name = e.expected_name(&now);
        assert_eq!(name, "app-2024-01-31.log");
        assert!(e.matches(&name));
    }

    #[test]
    fn splits_prefix_into_dir_and_base() {
        assert_eq!(split_prefix("/var/log/app-"), ("/var/log", "app-"));
        assert_eq!(split_prefix("/app-"), ("/", "app-"));
        assert_eq!(split_prefix("app-"), (".", "app-"));
        assert_eq!(split_prefix("/var/log/"), ("/var/log", ""));
    }

    #[test]
    fn registry_groups_specs_by_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix_a = format!("{}/app-", tmp.path().display());
        let prefix_b = format!("{}/db-", tmp.path().display());
        let specs = vec![
            FileSpecConfig {
                topic: "app".into(),
                prefix: prefix_a,
                suffix: ".log".into(),
                time_pattern: "%Y-%m-%d".into(),
            },
            FileSpecConfig {
                topic: "db".into(),
                prefix: prefix_b,
                suffix: ".log".into(),
                time_pattern: "%Y-%m-%d".into(),
            },
        ];

        let registry = PatternRegistry::from_config(&specs).unwrap();
        assert_eq!(registry.dirs.len(), 1);
        assert_eq!(registry.dirs[0].entries.len(), 2);

        let dir = registry.dirs[0].dir.clone();
        let matched = registry.match_path(&dir.join("db-2024-05-05.log")).unwrap();
        assert_eq!(matched.topic, "db");
        assert!(registry.match_path(&dir.join("other.txt")).is_none());
        assert!(
            registry
                .entry_for(&dir, "app", "%Y-%m-%d")
                .is_some_and(|e| e.file_prefix == "app-")
        );
    }
}
