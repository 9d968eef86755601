//! Local folder destination.
//!
//! Value batches become one JSON file each; cached files are copied under
//! their original name with the configured prefix and suffix.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use connector_core::{Connectable, ConnectorError};
use north_cache::CachedValue;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::north::sink::{Batch, Rejection, SendOutcome, Sink};

pub struct FileWriterSink {
    output_folder: PathBuf,
    prefix: String,
    suffix: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WrittenValue<'a> {
    point_id: &'a str,
    source_id: &'a str,
    timestamp: String,
    data: &'a serde_json::Value,
}

impl FileWriterSink {
    pub fn new(output_folder: impl Into<PathBuf>, prefix: &str, suffix: &str) -> Self {
        Self {
            output_folder: output_folder.into(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    /// Output name of a delivered file: `{prefix}{stem}{suffix}{ext}`.
    pub fn output_file_name(&self, original_name: &str) -> String {
        let path = Path::new(original_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| original_name.to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        format!("{}{}{}{}", self.prefix, stem, self.suffix, ext)
    }

    async fn write_values(&self, values: &[CachedValue]) -> SendOutcome {
        let (empty, accepted): (Vec<&CachedValue>, Vec<&CachedValue>) =
            values.iter().partition(|v| v.payload.is_null());

        if !accepted.is_empty() {
            let rows: Vec<_> = accepted
                .iter()
                .map(|v| WrittenValue {
                    point_id: &v.point_id,
                    source_id: &v.source_id,
                    timestamp: v.timestamp.to_rfc3339(),
                    data: &v.payload,
                })
                .collect();
            let body = match serde_json::to_vec_pretty(&rows) {
                Ok(body) => body,
                Err(e) => return SendOutcome::Rejected(format!("cannot serialize values: {e}")),
            };

            let first_seq = accepted[0].seq;
            let name = format!(
                "{}{}-{}{}.json",
                self.prefix,
                Utc::now().timestamp_millis(),
                first_seq,
                self.suffix
            );
            if let Err(e) = self.write_output(&name, &body).await {
                return self.write_failed(e).await;
            }
            debug!(file = %name, count = rows.len(), "Values written");
        }

        if empty.is_empty() {
            SendOutcome::Delivered
        } else {
            SendOutcome::PartiallyRejected(
                empty
                    .iter()
                    .map(|v| Rejection::new(v.seq, "empty payload"))
                    .collect(),
            )
        }
    }

    /// Write through a temporary name so readers of the output folder never
    /// see a partial file.
    async fn write_output(&self, name: &str, body: &[u8]) -> Result<(), String> {
        let target = self.output_folder.join(name);
        let staged = self.output_folder.join(format!(".{name}.tmp"));
        tokio::fs::write(&staged, body)
            .await
            .map_err(|e| format!("cannot write {}: {e}", staged.display()))?;
        if let Err(e) = tokio::fs::rename(&staged, &target).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staged).await {
                debug!(file = %staged.display(), error = %cleanup, "Staged output left behind");
            }
            return Err(format!("cannot move {} into place: {e}", target.display()));
        }
        Ok(())
    }

    /// A failed write is a transport failure only while the output folder
    /// itself is unavailable; otherwise the batch is refused.
    async fn write_failed(&self, reason: String) -> SendOutcome {
        match self.test_connection().await {
            Err(e) => SendOutcome::TransportFailed(e.to_string()),
            Ok(()) => SendOutcome::Rejected(reason),
        }
    }
}

#[async_trait]
impl Connectable for FileWriterSink {
    async fn connect(&self) -> connector_core::Result<()> {
        self.test_connection().await
    }

    async fn disconnect(&self) -> connector_core::Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> connector_core::Result<()> {
        match tokio::fs::metadata(&self.output_folder).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ConnectorError::transport(format!(
                "{} is not a folder",
                self.output_folder.display()
            ))),
            Err(e) => Err(ConnectorError::transport(format!(
                "output folder {} unavailable: {e}",
                self.output_folder.display()
            ))),
        }
    }
}

#[async_trait]
impl Sink for FileWriterSink {
    fn driver_name(&self) -> &'static str {
        "file-writer"
    }

    async fn send(&self, batch: &Batch, _deadline: Instant) -> SendOutcome {
        match batch {
            Batch::Values(values) => self.write_values(values).await,
            Batch::File(file) => {
                let body = match tokio::fs::read(&file.stored_path).await {
                    Ok(body) => body,
                    Err(e) => {
                        return SendOutcome::Rejected(format!(
                            "cannot read cached file {}: {e}",
                            file.stored_path.display()
                        ));
                    }
                };
                let name = self.output_file_name(&file.original_name);
                match self.write_output(&name, &body).await {
                    Ok(()) => {
                        debug!(file = %name, "File written");
                        SendOutcome::Delivered
                    }
                    Err(e) => self.write_failed(e).await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use north_cache::CachedFile;
    use serde_json::json;
    use tempfile::TempDir;

    fn value(seq: u64, payload: serde_json::Value) -> CachedValue {
        CachedValue {
            seq,
            source_id: "south".to_string(),
            point_id: format!("p{seq}"),
            timestamp: Utc::now(),
            payload,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + std::time::Duration::from_secs(5)
    }

    #[test]
    fn test_output_file_name() {
        let sink = FileWriterSink::new("/out", "pre-", "-suf");
        assert_eq!(sink.output_file_name("report.csv"), "pre-report-suf.csv");
        assert_eq!(sink.output_file_name("noext"), "pre-noext-suf");
    }

    #[tokio::test]
    async fn test_connect_requires_output_folder() {
        let dir = TempDir::new().unwrap();
        let sink = FileWriterSink::new(dir.path().join("missing"), "", "");
        let err = sink.connect().await.unwrap_err();
        assert!(err.is_transport());

        let sink = FileWriterSink::new(dir.path(), "", "");
        sink.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_values_written_as_one_file() {
        let dir = TempDir::new().unwrap();
        let sink = FileWriterSink::new(dir.path(), "", "");

        let batch = Batch::Values(vec![value(1, json!(1.5)), value(2, json!(2.5))]);
        assert_eq!(sink.send(&batch, deadline()).await, SendOutcome::Delivered);

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(name.ends_with("-1.json"), "{name}");

        let rows: Vec<serde_json::Value> =
            serde_json::from_slice(&tokio::fs::read(entry.path()).await.unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["pointId"], "p2");
    }

    #[tokio::test]
    async fn test_null_payload_partially_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = FileWriterSink::new(dir.path(), "", "");

        let batch = Batch::Values(vec![
            value(1, json!(1)),
            value(2, serde_json::Value::Null),
            value(3, json!(3)),
        ]);
        assert_eq!(
            sink.send(&batch, deadline()).await,
            SendOutcome::PartiallyRejected(vec![Rejection::new(2, "empty payload")])
        );
    }

    #[tokio::test]
    async fn test_missing_folder_is_transport_failure() {
        let dir = TempDir::new().unwrap();
        let sink = FileWriterSink::new(dir.path().join("gone"), "", "");
        let batch = Batch::Values(vec![value(1, json!(1))]);
        assert!(sink.send(&batch, deadline()).await.is_transport_failure());
    }

    #[tokio::test]
    async fn test_file_copied_with_prefix() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let stored = input.path().join("data-1700000000000-000001.csv");
        tokio::fs::write(&stored, b"a,b\n").await.unwrap();

        let sink = FileWriterSink::new(output.path(), "plant1-", "");
        let batch = Batch::File(CachedFile {
            stored_path: stored,
            original_name: "data.csv".to_string(),
            created_at: Utc::now(),
        });
        assert_eq!(sink.send(&batch, deadline()).await, SendOutcome::Delivered);
        let copied = tokio::fs::read(output.path().join("plant1-data.csv")).await.unwrap();
        assert_eq!(copied, b"a,b\n");
    }

    #[tokio::test]
    async fn test_unwritable_output_is_rejected() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let stored = input.path().join("data-1700000000000-000001.csv");
        tokio::fs::write(&stored, b"1").await.unwrap();
        tokio::fs::create_dir(output.path().join("data.csv")).await.unwrap();

        let sink = FileWriterSink::new(output.path(), "", "");
        let batch = Batch::File(CachedFile {
            stored_path: stored,
            original_name: "data.csv".to_string(),
            created_at: Utc::now(),
        });
        let outcome = sink.send(&batch, deadline()).await;
        assert!(matches!(outcome, SendOutcome::Rejected(_)), "{outcome:?}");
        assert!(!output.path().join(".data.csv.tmp").exists());
    }

    #[tokio::test]
    async fn test_unreadable_cached_file_is_rejected() {
        let output = TempDir::new().unwrap();
        let sink = FileWriterSink::new(output.path(), "", "");
        let batch = Batch::File(CachedFile {
            stored_path: output.path().join("vanished.csv"),
            original_name: "vanished.csv".to_string(),
            created_at: Utc::now(),
        });
        let outcome = sink.send(&batch, deadline()).await;
        assert!(matches!(outcome, SendOutcome::Rejected(_)), "{outcome:?}");
    }
}
