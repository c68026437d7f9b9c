pub(crate) const METRIC_OPERATIONS: &str = "supervisor_operations_total";
pub(crate) const METRIC_START_DURATION: &str = "supervisor_start_duration_seconds";
pub(crate) const METRIC_UNEXPECTED_EXITS: &str = "supervisor_unexpected_exits_total";
pub(crate) const METRIC_RELOADS: &str = "supervisor_reloads_total";
pub(crate) const METRIC_RELOAD_CHANGES: &str = "supervisor_reload_changes_total";

pub(crate) fn emit_operation(operation: &str, result: &str) {
    metrics::counter!(
        METRIC_OPERATIONS,
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_start_duration(service: &str, ready: bool, duration_secs: f64) {
    metrics::histogram!(
        METRIC_START_DURATION,
        "service" => service.to_string(),
        "ready" => ready.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_unexpected_exit(service: &str) {
    metrics::counter!(
        METRIC_UNEXPECTED_EXITS,
        "service" => service.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_reload(added: usize, removed: usize) {
    metrics::counter!(METRIC_RELOADS).increment(1);
    metrics::counter!(METRIC_RELOAD_CHANGES, "change" => "added").increment(added as u64);
    metrics::counter!(METRIC_RELOAD_CHANGES, "change" => "removed").increment(removed as u64);
}
