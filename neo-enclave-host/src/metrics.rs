//! Prometheus textfile export.
//!
//! The enclave has no listening socket, so the host pulls the text
//! exposition over the boundary and leaves it where a node exporter's
//! textfile collector picks it up.

use anyhow::{Context, Result};
use neo_enclave::{EnclaveClient, EnclaveTransport, InProcessTransport};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Replace `path` with `text`. Readers never see a partial file.
pub fn write_textfile(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().map(OsString::from).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Fetch the current metrics and write them to `path`. Returns the bytes written.
pub fn export_once<T: EnclaveTransport>(client: &EnclaveClient<T>, path: &Path) -> Result<usize> {
    let text = client.get_metrics().context("fetching enclave metrics")?;
    write_textfile(path, &text)?;
    Ok(text.len())
}

pub async fn run_exporter(client: EnclaveClient<InProcessTransport>, path: PathBuf, period: Duration) {
    let client = Arc::new(client);
    let path = Arc::new(path);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let client = client.clone();
        let target = path.clone();
        match tokio::task::spawn_blocking(move || export_once(&client, &target)).await {
            Ok(Ok(bytes)) => debug!(bytes, path = %path.display(), "metrics exported"),
            Ok(Err(e)) => warn!(error = %e, "metrics export failed"),
            Err(e) => error!(error = %e, "metrics export task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo_enclave::{Enclave, EnclaveConfig};
    use tempfile::TempDir;

    #[test]
    fn test_write_textfile_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("collector").join("enclave.prom");

        write_textfile(&path, "a 1\n").unwrap();
        write_textfile(&path, "a 2\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a 2\n");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![OsString::from("enclave.prom")]);
    }

    #[test]
    fn test_export_once_writes_enclave_metrics() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enclave.prom");
        let enclave = Enclave::from_config(EnclaveConfig::in_memory()).unwrap();
        let client = EnclaveClient::new(InProcessTransport::new(Arc::new(enclave)));
        client.list_triggers().unwrap();

        let bytes = export_once(&client, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.len(), bytes);
        assert!(text.contains("neo_enclave_boundary_calls_total{op=\"list_triggers\",status=\"ok\"} 1"));
    }
}
