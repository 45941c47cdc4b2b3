//! JSON output

use std::fs;
use std::path::Path;

use crate::stats::SessionReport;

pub fn output_json(report: &SessionReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(report: &SessionReport, path: &Path) -> anyhow::Result<()> {
    let json = output_json(report);
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_json_shape() {
        let mut report = SessionReport::default();
        report.input.push(Utc::now(), 12.0);

        let value: serde_json::Value = serde_json::from_str(&output_json(&report)).unwrap();
        assert_eq!(value["input"][0]["mbps"], 12.0);
        assert!(value["output"].as_array().unwrap().is_empty());

        let back: SessionReport = serde_json::from_value(value).unwrap();
        assert_eq!(back.input.len(), 1);
    }
}
