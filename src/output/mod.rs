//! Result export and summaries
//!
//! Each client session can be written to CSV and JSON files whose names come
//! from templates: `%d` becomes the connection index and `%s` the remote
//! address.

pub mod csv;
pub mod json;
pub mod plain;

use std::path::PathBuf;

use tracing::{info, warn};

use crate::stats::SessionReport;

pub use csv::{output_csv, save_csv};
pub use json::{output_json, save_json};
pub use plain::output_plain;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportConfig {
    pub csv: Option<String>,
    pub json: Option<String>,
}

impl ExportConfig {
    /// Both templates must name the index and the remote address.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (flag, template) in [("--csv", &self.csv), ("--export", &self.json)] {
            if let Some(template) = template
                && !(template.contains("%d") && template.contains("%s"))
            {
                anyhow::bail!(
                    "{} filename requires '%d' and '%s': {}",
                    flag,
                    template
                );
            }
        }
        Ok(())
    }

    /// Write every configured export for one session. Failures are logged.
    pub fn export(&self, index: usize, remote: &str, report: &SessionReport) {
        if let Some(template) = &self.csv {
            let path = filename(template, index, remote);
            info!("Exporting CSV results to {}", path.display());
            if let Err(e) = save_csv(report, &path) {
                warn!("CSV export to {} failed: {:#}", path.display(), e);
            }
        }
        if let Some(template) = &self.json {
            let path = filename(template, index, remote);
            info!("Exporting JSON results to {}", path.display());
            if let Err(e) = save_json(report, &path) {
                warn!("JSON export to {} failed: {:#}", path.display(), e);
            }
        }
    }
}

/// Expand a filename template.
pub fn filename(template: &str, index: usize, remote: &str) -> PathBuf {
    // ':' is not allowed in Windows filenames
    let remote = if cfg!(windows) {
        remote.replacen(':', "-", 1)
    } else {
        remote.to_string()
    };
    PathBuf::from(
        template
            .replacen("%d", &index.to_string(), 1)
            .replacen("%s", &remote, 1),
    )
}
