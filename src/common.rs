//! Small helpers shared by the server, the client and the relay core.

use std::time::Duration;
use tokio::sync::broadcast;

/// Buffer size for reading data from QUIC streams.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Resolves once a shutdown is broadcast or the sender is gone.
///
/// With no receiver it never resolves, so tasks started without a shutdown
/// signal run until their channels end.
pub async fn wait_for_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Formats a duration in a human-readable format similar to Go's duration format.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if secs_remainder > 0 || (hours == 0 && mins == 0 && nanos == 0) {
        result.push_str(&format!("{}s", secs_remainder));
    } else if nanos > 0 && hours == 0 && mins == 0 && secs_remainder == 0 {
        let ms = nanos / 1_000_000;
        if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}
