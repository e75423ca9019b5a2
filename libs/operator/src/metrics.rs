use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;

/// One line of the metrics output stream. Serializes to a single JSON object; the sink writes
/// one such record per line so the file is append-only and trivially tailable.
#[derive(Serialize)]
#[serde(tag = "action")]
#[serde(rename_all = "lowercase")]
enum Record<'a> {
    Add {
        name: &'a str,
        value: f64,
        labels: BTreeMap<&'static str, String>,
    },
    Set {
        name: &'a str,
        value: f64,
        labels: BTreeMap<&'static str, String>,
        group: &'a str,
    },
    Expire {
        group: &'a str,
    },
}

/// The process-wide metrics output: an append-only, line-delimited JSON file. All writers share
/// one handle behind a mutex so lines never interleave.
pub struct MetricsSink {
    prefix: String,
    file: Mutex<tokio::fs::File>,
}

impl MetricsSink {
    pub async fn open(path: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Arc<Self>> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Arc::new(Self {
            prefix: prefix.into(),
            file: Mutex::new(file),
        }))
    }

    async fn write_line(&self, record: &Record<'_>) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Increments a prefixed counter by `value`, recording the given labels.
    pub async fn counter_add(
        &self,
        name: &str,
        value: f64,
        labels: BTreeMap<&'static str, String>,
    ) -> Result<()> {
        let name = format!("{}{name}", self.prefix);
        self.write_line(&Record::Add {
            name: &name,
            value,
            labels,
        })
        .await
    }

    /// Sets a prefixed gauge to `value` within `group`, so a later `expire_group` call can drop
    /// stale series for resources that no longer exist.
    pub async fn gauge_set(
        &self,
        name: &str,
        value: f64,
        labels: BTreeMap<&'static str, String>,
        group: &str,
    ) -> Result<()> {
        let name = format!("{}{name}", self.prefix);
        self.write_line(&Record::Set {
            name: &name,
            value,
            labels,
            group,
        })
        .await
    }

    /// Emitted once at the start of a sweep so the reader can drop stale gauge series before
    /// the sweep starts producing fresh ones for the resources that still exist.
    pub async fn expire_group(&self, group: &str) -> Result<()> {
        self.write_line(&Record::Expire { group }).await
    }
}

pub const DRIFT_CHECKS_TOTAL: &str = "drift_checks_total";
pub const DRIFTS_DETECTED_TOTAL: &str = "drifts_detected_total";
pub const GIT_CHANGES_DETECTED_TOTAL: &str = "git_changes_detected_total";
pub const DRIFT_STATUS: &str = "drift_status";
pub const GIT_SYNC_PENDING: &str = "git_sync_pending";

pub const DRIFT_STATUS_GROUP: &str = "drift-status";
pub const GIT_SYNC_STATUS_GROUP: &str = "git-sync-status";

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::MetricLabels;

    #[tokio::test]
    async fn writes_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let sink = MetricsSink::open(&path, "cdktsstack_").await.unwrap();

        let labels = MetricLabels {
            namespace: "default".to_owned(),
            resource_name: "my-stack".to_owned(),
            aws_region: "us-east-1".to_owned(),
            stack_name: "MyStack".to_owned(),
        }
        .as_map();

        sink.counter_add(DRIFT_CHECKS_TOTAL, 1.0, labels.clone())
            .await
            .unwrap();
        sink.gauge_set(DRIFT_STATUS, 1.0, labels, DRIFT_STATUS_GROUP)
            .await
            .unwrap();
        sink.expire_group(DRIFT_STATUS_GROUP).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "add");
        assert_eq!(first["name"], "cdktsstack_drift_checks_total");

        let third: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(third["action"], "expire");
        assert_eq!(third["group"], DRIFT_STATUS_GROUP);
    }
}
