use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;

static TOOL_CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a tool-call id unique across every concurrent stream in this
/// process: `<name>-<unixNanos>-<counter>`.
pub fn next_tool_call_id(name: &str) -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let counter = TOOL_CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{name}-{nanos}-{counter}")
}

/// Recover the function name from a minted tool-call id by stripping the
/// trailing `-<ts>-<counter>` pair. Ids that do not match the minted shape
/// (including names that themselves contain dashes) pass through untouched.
pub fn strip_tool_call_suffix(id: &str) -> &str {
    let Some(counter_sep) = id.rfind('-') else {
        return id;
    };
    let (head, counter) = (&id[..counter_sep], &id[counter_sep + 1..]);
    if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
        return id;
    }
    let Some(ts_sep) = head.rfind('-') else {
        return id;
    };
    let (name, ts) = (&head[..ts_sep], &head[ts_sep + 1..]);
    if name.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return id;
    }
    name
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{next_tool_call_id, strip_tool_call_suffix};

    #[test]
    fn minted_ids_are_unique() {
        let ids: HashSet<String> = (0..256).map(|_| next_tool_call_id("tool")).collect();
        assert_eq!(ids.len(), 256);
    }

    #[test]
    fn suffix_strip_recovers_name() {
        let id = next_tool_call_id("get_weather");
        assert_eq!(strip_tool_call_suffix(&id), "get_weather");
    }

    #[test]
    fn dashed_names_survive_round_trip() {
        let id = next_tool_call_id("my-tool-v2");
        assert_eq!(strip_tool_call_suffix(&id), "my-tool-v2");
    }

    #[test]
    fn foreign_ids_pass_through() {
        for id in ["toolu_01abc", "read_file", "a-b", "x-12-y", "-1-2"] {
            assert_eq!(strip_tool_call_suffix(id), id);
        }
    }
}
