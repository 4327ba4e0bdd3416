//! Feed payload parsing
//!
//! Turns a raw feed document into entries ordered oldest to newest. The
//! worker only ever calls [`FeedParser::parse`], which never fails: a payload
//! that cannot be understood is treated as a feed with no entries.

pub mod syndication;

pub use syndication::SyndicationParser;

use crate::error::WatchErrorTrait;
use crate::models::FeedEntry;
use crate::utils::error::ParseError;

/// Feed document parser
pub trait FeedParser: Send + Sync {
    /// Parse a payload, reporting why it could not be understood
    fn try_parse(&self, payload: &str) -> Result<Vec<FeedEntry>, ParseError>;

    /// Parse a payload, degrading to an empty list
    fn parse(&self, payload: &str) -> Vec<FeedEntry> {
        match self.try_parse(payload) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    category = e.category().as_str(),
                    "Unparseable feed payload treated as empty");
                Vec::new()
            }
        }
    }
}
