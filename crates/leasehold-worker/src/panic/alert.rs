//! Operator alert text.

use std::fmt::Write;

use chrono::SecondsFormat;

use leasehold_models::PanicEvent;

/// Run ids are shown by their trailing characters only.
const RUN_ID_SUFFIX_CHARS: usize = 8;

/// Plain-text alert for `event`, at most `max_chars` characters.
pub fn format_alert(event: &PanicEvent, max_chars: usize) -> String {
    let reason = event.reason_key;
    let mut text = String::new();

    let _ = writeln!(text, "[{}] worker panic", reason.severity().as_str());
    let _ = writeln!(text, "run: …{}", event.run_id.suffix(RUN_ID_SUFFIX_CHARS));
    let _ = writeln!(text, "worker: {}", event.worker_id);
    let _ = writeln!(text, "reason: {}", reason.key());
    let _ = writeln!(
        text,
        "at: {}",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    if let Some(latency) = event.latency_ms {
        let _ = writeln!(text, "latency_ms: {}", latency);
    }
    if event.retry_count > 0 {
        let _ = writeln!(text, "retries: {}", event.retry_count);
    }
    let _ = writeln!(text, "action: {}", reason.recommended_action());
    let _ = write!(text, "detail: {}", event.message);

    truncate_chars(&text, max_chars)
}

/// Cut at a char boundary, marking the cut with a trailing ellipsis.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut cut: String = text.chars().take(max_chars - 1).collect();
    cut.push('…');
    cut
}
