//! JSON-Lines operation journal backend. One JSON object per line, strictly
//! appended; `fs2` advisory locks serialize writers across processes. Reads
//! are lock-free snapshot reads of the whole file.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;

use super::{OperationKind, OperationQuery, OperationRecord, OperationStore};
use crate::log_warn;
use crate::types::OperationId;

pub struct JsonFileOperationStore {
    path: PathBuf,
    /// Serializes appends within this process; `fs2` handles cross-process
    /// serialization on top of this.
    write_lock: Mutex<()>,
}

impl JsonFileOperationStore {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::File::create(&path)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> Vec<OperationRecord> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OperationRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => log_warn!("skipping malformed journal line: {e}"),
            }
        }
        records
    }

    fn rewrite_all(&self, records: &[OperationRecord]) -> std::io::Result<()> {
        // The only caller of this is `mark_rolled_back`, which mutates a
        // single field on a single record; every other path only ever
        // appends. This still uses a temp+rename swap, never an in-place
        // partial write, so a crash mid-write cannot corrupt the journal.
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.lock_exclusive()?;
        for record in records {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        file.unlock()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)
    }
}

#[async_trait]
impl OperationStore for JsonFileOperationStore {
    async fn append(&self, record: OperationRecord) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let line = serde_json::to_string(&record)?;
        let result = writeln!(file, "{line}");
        file.unlock()?;
        result
    }

    async fn get(&self, operation_id: OperationId) -> Option<OperationRecord> {
        self.read_all().into_iter().find(|r| r.operation_id == operation_id)
    }

    async fn query(&self, query: &OperationQuery) -> Vec<OperationRecord> {
        super::filter_and_sort(self.read_all(), query)
    }

    async fn mark_rolled_back(&self, operation_id: OperationId, rollback_id: OperationId) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        let mut records = self.read_all();
        let Some(record) = records.iter_mut().find(|r| r.operation_id == operation_id) else {
            return false;
        };
        if record.rolled_back {
            return false;
        }
        record.rolled_back = true;
        record.rollback_operation_id = Some(rollback_id);
        self.rewrite_all(&records).is_ok()
    }

    async fn sweep(&self, retention_days: u32) -> usize {
        let _guard = self.write_lock.lock().unwrap();
        let records = self.read_all();
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
        let before = records.len();
        let kept: Vec<OperationRecord> = records.into_iter().filter(|r| r.timestamp >= cutoff).collect();
        let removed = before - kept.len();
        if removed > 0 && self.rewrite_all(&kept).is_err() {
            log_warn!("sweep failed to rewrite journal after filtering {removed} records");
            return 0;
        }
        removed
    }
}

impl OperationKind {
    pub fn inverse_action_kind(self) -> crate::types::Direction {
        match self {
            OperationKind::Assign | OperationKind::BulkAssign => crate::types::Direction::Revoke,
            _ => crate::types::Direction::Assign,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AssignmentOutcome, AssignmentRecord};
    use crate::types::{
        AccountId, AccountName, PermissionSetArn, PermissionSetName, PrincipalId, PrincipalName, PrincipalType,
    };
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_record(kind: OperationKind) -> OperationRecord {
        OperationRecord::new(
            kind,
            PrincipalId("p-1".to_string()),
            PrincipalType::User,
            PrincipalName("alice".to_string()),
            PermissionSetArn("arn:ps:ReadOnly".to_string()),
            PermissionSetName("ReadOnly".to_string()),
            vec![AccountId("111".to_string())],
            vec![AccountName("prod".to_string())],
            vec![AssignmentRecord {
                principal_id: PrincipalId("p-1".to_string()),
                principal_type: PrincipalType::User,
                permission_set_arn: PermissionSetArn("arn:ps:ReadOnly".to_string()),
                account_id: AccountId("111".to_string()),
                outcome: AssignmentOutcome::Succeeded,
                error: None,
                retries: 0,
                duration_ms: 10,
            }],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn append_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let record = sample_record(OperationKind::Assign);
        let id = record.operation_id;
        store.append(record).await.unwrap();
        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.operation_id, id);
    }

    #[tokio::test]
    async fn mark_rolled_back_is_single_shot() {
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let record = sample_record(OperationKind::Assign);
        let id = record.operation_id;
        store.append(record).await.unwrap();
        let rollback_id = OperationId::new();
        assert!(store.mark_rolled_back(id, rollback_id).await);
        assert!(!store.mark_rolled_back(id, OperationId::new()).await);
        let fetched = store.get(id).await.unwrap();
        assert!(fetched.rolled_back);
        assert_eq!(fetched.rollback_operation_id, Some(rollback_id));
    }

    #[tokio::test]
    async fn append_is_truly_append_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops.jsonl");
        let store = JsonFileOperationStore::open(&path).unwrap();
        store.append(sample_record(OperationKind::Assign)).await.unwrap();
        store.append(sample_record(OperationKind::Revoke)).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn sweep_removes_only_records_past_retention() {
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let mut old_record = sample_record(OperationKind::Assign);
        old_record.timestamp = chrono::Utc::now() - chrono::Duration::days(100);
        store.append(old_record).await.unwrap();
        store.append(sample_record(OperationKind::Revoke)).await.unwrap();
        let removed = store.sweep(90).await;
        assert_eq!(removed, 1);
        assert_eq!(store.query(&OperationQuery::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let mut old_record = sample_record(OperationKind::Assign);
        old_record.timestamp = chrono::Utc::now() - chrono::Duration::days(100);
        store.append(old_record).await.unwrap();
        assert_eq!(store.sweep(90).await, 1);
        assert_eq!(store.sweep(90).await, 0);
    }
}
