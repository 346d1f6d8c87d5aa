// macros only; no direct imports needed

/// Replay-aware logging. A workflow body re-runs from the top on every turn,
/// so unconditional logging would repeat every line once per replay. These
/// macros emit only while the execution is past previously recorded history.
#[macro_export]
macro_rules! wf_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(instance = %$ctx.instance(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! wf_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(instance = %$ctx.instance(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! wf_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(instance = %$ctx.instance(), $($arg)+);
        }
    }};
}
