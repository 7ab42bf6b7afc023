use super::Event;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Filters for [`super::EventBus::query`]. All present filters are ANDed.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub terminal_id: Option<String>,
    /// Type names to keep. Empty means every type; unknown names match nothing.
    pub types: Vec<String>,
    /// Keep events with `ts` strictly after this timestamp (string comparison).
    pub since_ts: Option<String>,
    /// Keep events with `seq` strictly greater than this cursor.
    pub after: Option<i64>,
    pub contains: Option<String>,
    pub regex: Option<String>,
    pub limit: Option<i64>,
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<Event>,
    pub count: usize,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
    pub truncated: bool,
    pub oldest_seq: Option<u64>,
    pub newest_seq: Option<u64>,
}

impl EventsPage {
    pub(crate) fn empty(after: Option<u64>, oldest_seq: Option<u64>, newest_seq: Option<u64>) -> Self {
        Self {
            events: Vec::new(),
            count: 0,
            next_cursor: after,
            has_more: false,
            truncated: false,
            oldest_seq,
            newest_seq,
        }
    }
}

/// A query with its text filters prepared once, ready to test events against.
pub(crate) struct CompiledQuery<'a> {
    query: &'a EventQuery,
    after: Option<u64>,
    contains: Option<String>,
    /// Outer `None`: no regex filter. Inner `None`: unusable pattern, nothing matches.
    regex: Option<Option<Regex>>,
}

impl<'a> CompiledQuery<'a> {
    pub(crate) fn new(query: &'a EventQuery) -> Self {
        let after = query.after.map(|a| a.max(0) as u64);
        let contains = query
            .contains
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(str::to_lowercase);
        let regex = query
            .regex
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(compile_search_regex);
        Self {
            query,
            after,
            contains,
            regex,
        }
    }

    /// The normalised `after` cursor (negative values count as 0).
    pub(crate) fn after(&self) -> Option<u64> {
        self.after
    }

    pub(crate) fn limit(&self) -> i64 {
        self.query.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }

    pub(crate) fn matches(&self, event: &Event) -> bool {
        if let Some(after) = self.after {
            if event.seq <= after {
                return false;
            }
        }
        if let Some(id) = &self.query.terminal_id {
            if &event.terminal_id != id {
                return false;
            }
        }
        if !self.query.types.is_empty()
            && !self.query.types.iter().any(|t| t == event.kind.as_str())
        {
            return false;
        }
        if let Some(since) = &self.query.since_ts {
            if event.ts.as_str() <= since.as_str() {
                return false;
            }
        }
        if self.contains.is_none() && self.regex.is_none() {
            return true;
        }

        let Some(haystack) = event.search_text() else {
            return false;
        };
        if let Some(needle) = &self.contains {
            if !haystack.to_lowercase().contains(needle.as_str()) {
                return false;
            }
        }
        match &self.regex {
            Some(Some(re)) if !re.is_match(haystack) => return false,
            Some(None) => return false,
            _ => {}
        }
        true
    }
}

/// Case-insensitive, multi-line. A pattern that does not compile is searched
/// for literally instead; `None` only when even the escaped form is rejected.
fn compile_search_regex(pattern: &str) -> Option<Regex> {
    let build = |p: &str| {
        RegexBuilder::new(p)
            .case_insensitive(true)
            .multi_line(true)
            .build()
    };
    match build(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid event regex, matching it literally");
            build(&regex::escape(pattern)).ok()
        }
    }
}
