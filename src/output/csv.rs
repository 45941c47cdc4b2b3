//! CSV output format

use std::fs;
use std::path::Path;

use crate::stats::{RateSeries, SessionReport};

/// One row per sample, inbound rows first.
pub fn output_csv(report: &SessionReport) -> String {
    let mut output = String::new();

    output.push_str("DIRECTION,TIME,RATE\n");
    push_rows(&mut output, "input", &report.input);
    push_rows(&mut output, "output", &report.output);

    output
}

fn push_rows(output: &mut String, direction: &str, series: &RateSeries) {
    for sample in series.samples() {
        output.push_str(&format!(
            "{},{},{}\n",
            direction,
            sample.timestamp.to_rfc3339(),
            sample.mbps
        ));
    }
}

pub fn save_csv(report: &SessionReport, path: &Path) -> anyhow::Result<()> {
    fs::write(path, output_csv(report))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_rows_in_direction_order() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut report = SessionReport::default();
        report.output.push(t, 250.5);
        report.input.push(t, 100.0);

        let csv = output_csv(&report);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "DIRECTION,TIME,RATE");
        assert_eq!(lines[1], "input,2024-05-01T12:00:00+00:00,100");
        assert_eq!(lines[2], "output,2024-05-01T12:00:00+00:00,250.5");
        assert_eq!(lines.len(), 3);
    }
}
