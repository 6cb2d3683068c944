//! Status reporting for the `status` subcommand.

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use serde::Serialize;

use common::{MetadataStore, StateCounts};

/// Snapshot of the local sync state.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub counts: StateCounts,
    pub failed: Vec<FailedEntry>,
    pub conflicts: Vec<ConflictLine>,
}

#[derive(Debug, Serialize)]
pub struct FailedEntry {
    pub path: String,
    pub state: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictLine {
    pub path: String,
    pub winner: String,
    pub policy: String,
    pub resolved_at: i64,
}

impl StatusReport {
    pub async fn collect(meta: &MetadataStore, max_attempts: u32) -> Result<Self> {
        let counts = meta.counts().await?;
        let failed = meta
            .failed(max_attempts)
            .await?
            .into_iter()
            .map(|e| FailedEntry {
                path: e.path,
                state: e.sync_state.to_string(),
                attempts: e.attempts,
                error: e.last_error.unwrap_or_default(),
            })
            .collect();
        let conflicts = meta
            .conflicts()
            .await?
            .into_iter()
            .map(|c| ConflictLine {
                path: c.path,
                winner: c.winner,
                policy: c.policy,
                resolved_at: c.resolved_at,
            })
            .collect();
        Ok(Self {
            counts,
            failed,
            conflicts,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["State", "Files"]);
        table.add_row(vec![Cell::new("clean"), Cell::new(self.counts.clean)]);
        table.add_row(vec![
            Cell::new("locally modified"),
            Cell::new(self.counts.locally_modified),
        ]);
        table.add_row(vec![
            Cell::new("remotely modified"),
            Cell::new(self.counts.remotely_modified),
        ]);
        table.add_row(vec![
            Cell::new("in flight"),
            Cell::new(self.counts.uploading + self.counts.downloading + self.counts.tombstoned),
        ]);
        table.add_row(vec![
            Cell::new("pending delete"),
            Cell::new(self.counts.deleted),
        ]);
        table.add_row(vec![
            Cell::new("conflicted"),
            Cell::new(self.counts.conflicted),
        ]);
        table.add_row(vec![Cell::new("total"), Cell::new(self.counts.total())]);
        out.push_str(&table.to_string());
        out.push('\n');

        if !self.failed.is_empty() {
            let mut failures = Table::new();
            failures
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["Path", "State", "Attempts", "Last error"]);
            for f in &self.failed {
                failures.add_row(vec![
                    Cell::new(&f.path),
                    Cell::new(&f.state),
                    Cell::new(f.attempts),
                    Cell::new(&f.error),
                ]);
            }
            out.push_str("\nFailing paths:\n");
            out.push_str(&failures.to_string());
            out.push('\n');
        }

        if !self.conflicts.is_empty() {
            let mut conflicts = Table::new();
            conflicts
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["Path", "Winner", "Policy", "Resolved at"]);
            for c in &self.conflicts {
                conflicts.add_row(vec![
                    Cell::new(&c.path),
                    Cell::new(&c.winner),
                    Cell::new(&c.policy),
                    Cell::new(c.resolved_at),
                ]);
            }
            out.push_str("\nResolved conflicts:\n");
            out.push_str(&conflicts.to_string());
            out.push('\n');
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::metadata::SyncState;
    use common::FileEntry;

    #[tokio::test]
    async fn test_collect_and_render() {
        let meta = MetadataStore::in_memory().await.unwrap();
        let mut entry = FileEntry::local_create("/a.txt", "abc", 3, 1000, "laptop", false);
        meta.upsert(&entry).await.unwrap();
        entry.path = "/b.txt".to_string();
        entry.sync_state = SyncState::Clean;
        meta.upsert(&entry).await.unwrap();
        for _ in 0..5 {
            meta.mark_error("/a.txt", "bucket unreachable").await.unwrap();
        }

        let report = StatusReport::collect(&meta, 5).await.unwrap();
        assert_eq!(report.counts.clean, 1);
        assert_eq!(report.counts.locally_modified, 1);
        assert_eq!(report.failed.len(), 1);

        let rendered = report.render();
        assert!(rendered.contains("locally modified"));
        assert!(rendered.contains("bucket unreachable"));

        let json = report.to_json().unwrap();
        assert!(json.contains("\"attempts\": 5"));
    }
}
