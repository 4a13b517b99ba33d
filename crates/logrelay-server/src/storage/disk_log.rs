//! Per-token, per-day plaintext logs of relayed device lines.
//!
//! Lines go through a single writer task so that each file keeps the order
//! in which the relay saw them. Writing is best-effort: failures are logged
//! and the relay carries on.

use chrono::{NaiveDate, Utc};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Debug)]
enum DiskCommand {
    Append { suffix: String, line: String },
    #[cfg(test)]
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Handle to the disk log writer task.
#[derive(Debug, Clone)]
pub struct DiskLog {
    tx: mpsc::UnboundedSender<DiskCommand>,
}

impl DiskLog {
    /// Start the writer task for files under `dir`.
    pub fn spawn(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dir, rx));
        Self { tx }
    }

    /// Queue one line for the file of `suffix`.
    pub fn append(&self, suffix: &str, line: &str) {
        let cmd = DiskCommand::Append {
            suffix: suffix.to_string(),
            line: line.to_string(),
        };
        if self.tx.send(cmd).is_err() {
            warn!("disk log writer is gone, dropping line");
        }
    }

    /// Wait until every line queued so far has been written.
    #[cfg(test)]
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(DiskCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// `logs-<YYYY-MM-DD>-<suffix>.txt`
pub fn log_file_name(day: NaiveDate, suffix: &str) -> String {
    format!("logs-{}-{suffix}.txt", day.format("%Y-%m-%d"))
}

/// File-name suffix for a device address, with its last segment cut off.
///
/// `192.168.1.42` becomes `192.168.1`; colons are replaced so the result is a
/// safe file name.
pub fn address_suffix(addr: &IpAddr) -> String {
    let text = addr.to_string();
    let truncated = match text.rfind(['.', ':']) {
        Some(cut) => &text[..cut],
        None => text.as_str(),
    };
    truncated.replace(':', "_")
}

async fn run_writer(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<DiskCommand>) {
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        error!(path = %dir.display(), error = %e, "could not create log directory");
    }

    while let Some(cmd) = rx.recv().await {
        match cmd {
            DiskCommand::Append { suffix, line } => {
                let path = dir.join(log_file_name(Utc::now().date_naive(), &suffix));
                if let Err(e) = append_line(&path, &line).await {
                    error!(path = %path.display(), error = %e, "failed to write log line");
                }
            }
            #[cfg(test)]
            DiskCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(path = %dir.display(), "disk log writer finished");
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
