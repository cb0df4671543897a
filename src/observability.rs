//! Logging and metrics.
//!
//! Structured logging via `tracing` with human-readable and JSON output,
//! verbosity mapping, and environment override through `COMMUX_LOG`.
//! Counters are recorded through the `metrics` facade; installing a
//! recorder is left to the embedding process.

use std::io::IsTerminal;

use metrics::{counter, describe_counter};
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable format with optional ANSI colors.
    #[default]
    Human,
    /// Newline-delimited JSON for machine consumption.
    Json,
}

/// Initializes the global tracing subscriber.
///
/// Verbosity mapping (when `COMMUX_LOG` is not set):
/// - 0 → warn
/// - 1 → info
/// - 2 → debug
/// - 3+ → trace
///
/// Uses `try_init()` so calling this more than once (e.g. in tests) is
/// safe.
pub fn init_logging(format: LogFormat, verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter =
        EnvFilter::try_from_env("COMMUX_LOG").unwrap_or_else(|_| EnvFilter::new(default_directive));

    let show_target = verbosity >= 2;

    match format {
        LogFormat::Human => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

/// Registers metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!("commux_frames_total", "Frames extracted from byte streams");
    describe_counter!("commux_commands_total", "Commands dispatched by the core");
    describe_counter!("commux_messages_routed_total", "Messages routed to endpoints");
    describe_counter!(
        "commux_messages_filtered_total",
        "Inbound messages dropped by endpoint filters"
    );
    describe_counter!(
        "commux_access_denied_total",
        "Inbound messages dropped by access policy"
    );
    describe_counter!("commux_stream_bytes_total", "Bytes written to stream pipes");
}

pub fn record_frame() {
    counter!("commux_frames_total").increment(1);
}

pub fn record_command(function_id: &str) {
    counter!("commux_commands_total", "function" => function_id.to_string()).increment(1);
}

pub fn record_routed(status: &str) {
    counter!("commux_messages_routed_total", "status" => status.to_string()).increment(1);
}

pub fn record_filtered() {
    counter!("commux_messages_filtered_total").increment(1);
}

pub fn record_access_denied() {
    counter!("commux_access_denied_total").increment(1);
}

pub fn record_stream_bytes(n: u64) {
    counter!("commux_stream_bytes_total").increment(n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_default_is_human() {
        assert_eq!(LogFormat::default(), LogFormat::Human);
    }

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Human, 0);
        init_logging(LogFormat::Json, 3);
    }

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        describe_metrics();
        record_frame();
        record_command("map");
        record_routed("MSG");
        record_filtered();
        record_access_denied();
        record_stream_bytes(500);
    }
}
