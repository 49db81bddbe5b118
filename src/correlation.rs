//! # Child Result Correlation
//!
//! A flow broker hands a barrier job its children's return values as one flat
//! map keyed by the broker's raw job keys (`{prefix}:{queue}:{jobId}`). The only
//! way to tell which entries belong to a given child task is the job id naming
//! convention, so all matching goes through [`find_child_results`].
//!
//! A child job id is `{name}:{traceId}:{suffix}`, which makes every raw key of
//! that child contain `:{name}:{traceId}:`. The leading separator stops a child
//! named `embed` from matching `re-embed`, and the trailing one stops trace
//! `t1` from matching `t10`.

use std::collections::HashMap;

use serde_json::Value;

use crate::constants::JOB_ID_SEPARATOR;
use crate::trace::TraceId;

/// The substring every raw key of `child_name`'s jobs in `trace_id` contains.
pub fn child_key_pattern(child_name: &str, trace_id: &TraceId) -> String {
    format!(
        "{sep}{child_name}{sep}{trace_id}{sep}",
        sep = JOB_ID_SEPARATOR
    )
}

/// All child results produced by `child_name` within `trace_id`, sorted by raw key.
pub fn find_child_results<'a>(
    children_values: &'a HashMap<String, Value>,
    child_name: &str,
    trace_id: &TraceId,
) -> Vec<(&'a str, &'a Value)> {
    let pattern = child_key_pattern(child_name, trace_id);
    let mut matches: Vec<(&str, &Value)> = children_values
        .iter()
        .filter(|(key, _)| key.contains(&pattern))
        .map(|(key, value)| (key.as_str(), value))
        .collect();
    matches.sort_by(|a, b| a.0.cmp(b.0));
    matches
}

/// Parsed form of a raw child key, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildJobKey {
    pub prefix: String,
    pub queue_name: String,
    pub job_id: String,
}

impl ChildJobKey {
    /// Split `{prefix}:{queue}:{jobId}`. The job id keeps its own separators.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, JOB_ID_SEPARATOR);
        let prefix = parts.next()?;
        let queue_name = parts.next()?;
        let job_id = parts.next()?;
        if prefix.is_empty() || queue_name.is_empty() || job_id.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            queue_name: queue_name.to_string(),
            job_id: job_id.to_string(),
        })
    }

    pub fn format(prefix: &str, queue_name: &str, job_id: &str) -> String {
        format!(
            "{prefix}{sep}{queue_name}{sep}{job_id}",
            sep = JOB_ID_SEPARATOR
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_matches_every_invocation_of_child() {
        let trace = TraceId::from("t1");
        let map = values(&[
            ("jobflow:embed:embed:t1:aaaa0000", json!(1)),
            ("jobflow:embed:embed:t1:bbbb1111", json!(2)),
            ("jobflow:parse:parse:t1:cccc2222", json!(3)),
        ]);

        let found = find_child_results(&map, "embed", &trace);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, &json!(1));
        assert_eq!(found[1].1, &json!(2));
    }

    #[test]
    fn test_similar_names_do_not_collide() {
        let trace = TraceId::from("t1");
        let map = values(&[
            ("jobflow:re-embed:re-embed:t1:aaaa0000", json!("re")),
            ("jobflow:embed-all:embed-all:t1:bbbb1111", json!("all")),
        ]);

        assert!(find_child_results(&map, "embed", &trace).is_empty());
    }

    #[test]
    fn test_other_traces_do_not_match() {
        let map = values(&[
            ("jobflow:embed:embed:t10:aaaa0000", json!(1)),
            ("jobflow:embed:embed:t1:bbbb1111", json!(2)),
        ]);

        let found = find_child_results(&map, "embed", &TraceId::from("t1"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "jobflow:embed:embed:t1:bbbb1111");
    }

    #[test]
    fn test_workflow_children_match_by_child_id() {
        // A sub-workflow embedded as a child gets a child-style id, not a root id.
        let map = values(&[("jobflow:index:index:t1:0123abcd", json!({"ok": true}))]);
        assert_eq!(find_child_results(&map, "index", &TraceId::from("t1")).len(), 1);
    }

    #[test]
    fn test_parse_child_key() {
        let key = ChildJobKey::parse("jobflow:embed:embed:t1:aaaa0000").unwrap();
        assert_eq!(key.prefix, "jobflow");
        assert_eq!(key.queue_name, "embed");
        assert_eq!(key.job_id, "embed:t1:aaaa0000");
        assert_eq!(
            ChildJobKey::format("jobflow", "embed", "embed:t1:aaaa0000"),
            "jobflow:embed:embed:t1:aaaa0000"
        );
        assert!(ChildJobKey::parse("no-separators").is_none());
        assert!(ChildJobKey::parse("a::b").is_none());
    }
}
