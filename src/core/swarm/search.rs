use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::core::error::{SwarmError, SwarmResult};

static AGENT_PREFIX_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\[(W-\d+)\] ").ok());

pub const MAX_CONTEXT: usize = 20;
pub const MAX_RESULTS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    /// 1-indexed position in the cumulative output stream.
    pub line_number: usize,
    pub agent: Option<String>,
    pub line: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
}

fn agent_of(line: &str) -> Option<String> {
    AGENT_PREFIX_RE
        .as_ref()?
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Scans a buffer snapshot for `query`.
///
/// `first_offset` is the cumulative offset of `lines[0]`, so reported line
/// numbers stay meaningful after older lines have been evicted. When the
/// snapshot belongs to a single agent, `fixed_agent` labels every match.
pub fn search_lines(
    lines: &[String],
    first_offset: usize,
    query: &str,
    fixed_agent: Option<&str>,
    context: usize,
    limit: usize,
) -> SwarmResult<SearchResult> {
    let re = Regex::new(query).map_err(|e| SwarmError::InvalidPattern(e.to_string()))?;
    let context = context.min(MAX_CONTEXT);
    let limit = limit.clamp(1, MAX_RESULTS);

    let mut matches = Vec::new();
    let mut truncated = false;
    for (idx, line) in lines.iter().enumerate() {
        if !re.is_match(line) {
            continue;
        }
        if matches.len() >= limit {
            truncated = true;
            break;
        }
        let before_start = idx.saturating_sub(context);
        let after_end = (idx + 1 + context).min(lines.len());
        matches.push(SearchMatch {
            line_number: first_offset + idx + 1,
            agent: fixed_agent.map(str::to_string).or_else(|| agent_of(line)),
            line: line.clone(),
            context_before: lines[before_start..idx].to_vec(),
            context_after: lines[idx + 1..after_end].to_vec(),
        });
    }

    Ok(SearchResult {
        query: query.to_string(),
        matches,
        truncated,
    })
}
