//! Plain text output

use crate::client::ClientStats;
use crate::stats::{bytes_to_human, mbps_to_human};

pub fn output_plain(stats: &ClientStats) -> String {
    let mut output = String::new();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str("  benchwire Results\n");
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    output.push_str(&format!(
        "  Duration:    {:.2}s\n",
        stats.total_duration.as_secs_f64()
    ));
    output.push_str(&format!(
        "  Received:    {} @ {}\n",
        bytes_to_human(stats.read_bytes),
        mbps_to_human(stats.read_mbps)
    ));
    output.push_str(&format!(
        "  Sent:        {} @ {}\n",
        bytes_to_human(stats.write_bytes),
        mbps_to_human(stats.write_mbps)
    ));
    if stats.failed_attempts > 0 {
        output.push_str(&format!("  Failed:      {} connection(s)\n", stats.failed_attempts));
    }
    output.push('\n');

    if stats.sessions.len() > 1 {
        output.push_str("  Per-Connection Results:\n");
        for session in &stats.sessions {
            output.push_str(&format!(
                "    [{}] {} {}",
                session.index,
                session.remote,
                if session.is_tls { "TLS" } else { "" }
            ));
            if let Some(read) = &session.read {
                output.push_str(&format!("  in: {}", mbps_to_human(read.mbps)));
            }
            if let Some(write) = &session.write {
                output.push_str(&format!("  out: {}", mbps_to_human(write.mbps)));
            }
            output.push('\n');
        }
        output.push('\n');
    }

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SessionResult;
    use crate::stats::{Rate, SessionReport};
    use std::time::Duration;

    fn session(index: usize) -> SessionResult {
        SessionResult {
            target: "localhost:8080".to_string(),
            index,
            remote: "127.0.0.1:8080".parse().unwrap(),
            is_tls: index == 0,
            read: Some(Rate::over(587_500_000, 100, Duration::from_secs(10))),
            write: None,
            report: SessionReport::default(),
        }
    }

    #[test]
    fn test_summary_lines() {
        let stats = ClientStats {
            total_duration: Duration::from_secs(10),
            read_mbps: 940.0,
            write_mbps: 0.0,
            read_bytes: 1_175_000_000,
            write_bytes: 0,
            sessions: vec![session(0), session(1)],
            failed_attempts: 1,
        };

        let text = output_plain(&stats);
        assert!(text.contains("Duration:    10.00s"));
        assert!(text.contains("940.0 Mbps"));
        assert!(text.contains("Failed:      1 connection(s)"));
        assert!(text.contains("[0] 127.0.0.1:8080 TLS  in: 470.0 Mbps"));
        assert!(text.contains("[1] 127.0.0.1:8080"));
        assert!(!text.contains("out:"));
    }
}
