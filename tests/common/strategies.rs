use proptest::prelude::*;

/// Valid task, workflow and queue names.
pub fn job_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,31}"
}

/// Trace ids as callers supply them: UUID-like or free-form without separators.
pub fn trace_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
        "[a-zA-Z0-9_-]{1,24}",
    ]
}

/// Broker key prefixes.
pub fn key_prefix_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}
