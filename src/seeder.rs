//! Feed list loading and feed-id normalization
//!
//! Accepts NDJSON rows (`youtube_channel_url`, `channel_url`, `url` or
//! `feed_id` keys) and plain one-id-per-line files, mixed freely. Channel
//! URLs are reduced to their `UC…` id; other http(s) URLs are kept as feed
//! URLs; bare tokens are taken as opaque feed ids.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use url::Url;

use crate::storage::ChannelRegistry;

/// NDJSON keys checked in order
const URL_KEYS: &[&str] = &["youtube_channel_url", "channel_url", "url", "feed_id"];

fn channel_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|/)(UC[0-9A-Za-z_-]{10,})(?:[/?#]|$)").unwrap())
}

/// Reduce one raw entry to a feed id
///
/// Returns `None` for entries that cannot be watched, such as YouTube
/// handle URLs with no channel id.
pub fn normalize_feed_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }

    if let Some(caps) = channel_id_regex().captures(raw) {
        return Some(caps[1].to_string());
    }

    if raw.starts_with("http://") || raw.starts_with("https://") {
        let url = Url::parse(raw).ok()?;
        let is_youtube = url
            .host_str()
            .is_some_and(|h| h == "youtube.com" || h.ends_with(".youtube.com"));
        return (!is_youtube).then(|| url.to_string());
    }

    (!raw.chars().any(char::is_whitespace)).then(|| raw.to_string())
}

/// Extract the raw entry from one line of the feed list
fn raw_entry(line: &str) -> Option<String> {
    let line = line.trim();
    if !line.starts_with('{') {
        return Some(line.to_string());
    }

    let row: serde_json::Value = match serde_json::from_str(line) {
        Ok(row) => row,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed NDJSON row");
            return None;
        }
    };

    URL_KEYS
        .iter()
        .filter_map(|key| row.get(*key).and_then(|v| v.as_str()))
        .find(|v| !v.trim().is_empty())
        .map(str::to_string)
}

/// Parse a feed list, returning unique feed ids in first-seen order
pub fn parse_feed_ids(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .filter_map(raw_entry)
        .filter_map(|raw| normalize_feed_id(&raw))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Read and parse a feed list file
pub fn load_feed_ids(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read channels file: {}", path.display()))?;
    let ids = parse_feed_ids(&content);
    tracing::info!(path = %path.display(), feeds = ids.len(), "Loaded feed list");
    Ok(ids)
}

/// Register every feed of a list file, returning how many were new
pub fn seed_from_file(registry: &ChannelRegistry, path: &Path) -> Result<usize> {
    let ids = load_feed_ids(path)?;
    let inserted = registry
        .register_many(&ids)
        .context("Failed to register feeds")?;
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const UCID: &str = "UCabcdefghijklmnopqrstuv";

    #[test]
    fn test_channel_id_regex_captures() {
        let re = channel_id_regex();
        let path = format!("/channel/{UCID}?view=0");
        let caps = re.captures(&path).unwrap();
        assert_eq!(&caps[1], UCID);
        assert!(re.captures("/channel/UCshort").is_none());
    }

    #[test]
    fn test_normalize_channel_urls() {
        let expected = Some(UCID.to_string());
        assert_eq!(
            normalize_feed_id(&format!("https://www.youtube.com/channel/{UCID}")),
            expected
        );
        assert_eq!(
            normalize_feed_id(&format!("https://youtube.com/channel/{UCID}/videos")),
            expected
        );
        assert_eq!(normalize_feed_id(&format!("  {UCID}  ")), expected);
    }

    #[test]
    fn test_normalize_other_entries() {
        assert_eq!(normalize_feed_id("https://www.youtube.com/@somehandle"), None);
        assert_eq!(
            normalize_feed_id("https://blog.example.com/feed.xml").as_deref(),
            Some("https://blog.example.com/feed.xml")
        );
        assert_eq!(normalize_feed_id("opaque-id-42").as_deref(), Some("opaque-id-42"));
        assert_eq!(normalize_feed_id("two words"), None);
        assert_eq!(normalize_feed_id("# comment"), None);
        assert_eq!(normalize_feed_id(""), None);
    }

    #[test]
    fn test_parse_mixed_list_dedups() {
        let content = format!(
            "{{\"youtube_channel_url\": \"https://www.youtube.com/channel/{UCID}\"}}\n\
             {{\"channel_url\": \"\", \"url\": \"https://www.youtube.com/channel/{UCID}\"}}\n\
             {{not json\n\
             {{\"name\": \"no url\"}}\n\
             \n\
             https://blog.example.com/feed.xml\n\
             {UCID}\n"
        );
        let ids = parse_feed_ids(&content);
        assert_eq!(ids, vec![UCID.to_string(), "https://blog.example.com/feed.xml".to_string()]);
    }

    #[test]
    fn test_seed_from_file_is_idempotent() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{UCID}").unwrap();
        writeln!(file, "https://blog.example.com/feed.xml").unwrap();

        let registry = ChannelRegistry::new(Arc::new(Database::in_memory().unwrap()));
        assert_eq!(seed_from_file(&registry, file.path()).unwrap(), 2);
        assert_eq!(seed_from_file(&registry, file.path()).unwrap(), 0);
        assert_eq!(registry.total_count().unwrap(), 2);
    }
}
