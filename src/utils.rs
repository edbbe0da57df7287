use std::fmt::Write;

use tracing_subscriber::EnvFilter;

use crate::capture::SequenceId;

/// Installs the fmt subscriber with an uptime timer. `RUST_LOG` wins over
/// `default_filter` when set.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A subscriber may already be installed (tests, embedding hosts).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_thread_names(true)
        .try_init();
}

/// Renders ids as `[1, 2, 3]`.
pub fn format_sequence_list(ids: &[SequenceId]) -> String {
    let mut out = String::with_capacity(2 + ids.len() * 4);
    out.push('[');
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{id}");
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_lists() {
        assert_eq!(format_sequence_list(&[]), "[]");
        assert_eq!(format_sequence_list(&[SequenceId(1), SequenceId(12)]), "[1, 12]");
    }
}
