//! Durable outbound sync layer.
//!
//! Pushes pattern statistics, execution telemetry, and evidence bundles to
//! the control plane, attempting online delivery first and falling back to a
//! SQLite-backed queue with exponential backoff. Items that exhaust their
//! retries are parked as permanently failed for operator re-injection. Also
//! pulls server-approved promoted rules and deploys them into the L1 rules
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::{ApplianceError, Result};
use crate::healer::ExecutionReporter;
use crate::rules::DeterministicEngine;

/// Maximum retry attempts before an item is parked as permanently failed.
pub const MAX_RETRIES: u32 = 10;

/// Number of items replayed per drain pass.
pub const DRAIN_BATCH_SIZE: usize = 10;

/// Transport to the control plane, injected so the sync layer can be driven
/// against a test double.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn post_pattern_stats(&self, payload: &Value) -> Result<Value>;
    async fn post_execution(&self, payload: &Value) -> Result<()>;
    async fn submit_evidence(&self, payload: &Value) -> Result<String>;
    /// Server-approved promoted rules changed since `since` (RFC 3339).
    async fn fetch_promoted_rules(&self, since: &str) -> Result<Vec<Value>>;
}

/// A pending queue item.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub operation: String,
    pub data: Value,
    pub created_at: String,
    pub retry_count: u32,
}

/// SQLite-backed offline queue for outbound operations.
pub struct SyncQueue {
    conn: Mutex<Connection>,
}

impl SyncQueue {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS learning_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER DEFAULT 0,
                last_error TEXT,
                completed_at TEXT,
                next_retry_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_learning_queue_pending
            ON learning_queue(completed_at) WHERE completed_at IS NULL;
            "#,
        )?;
        debug!(path = %db_path.display(), "initialized sync queue");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Add an operation for later replay.
    pub fn enqueue(&self, operation: &str, data: &Value) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO learning_queue (operation, data, created_at, next_retry_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![operation, serde_json::to_string(data)?, now],
        )?;
        let id = conn.last_insert_rowid();
        info!(operation, id, "queued sync operation");
        Ok(id)
    }

    /// Oldest pending operations that are ready to retry.
    pub fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, operation, data, created_at, retry_count
             FROM learning_queue
             WHERE completed_at IS NULL
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC
             LIMIT ?2",
        )?;
        let items: Vec<QueueItem> = stmt
            .query_map(params![now, limit as i64], |row| {
                let data: String = row.get(2)?;
                Ok(QueueItem {
                    id: row.get(0)?,
                    operation: row.get(1)?,
                    data: serde_json::from_str(&data).unwrap_or(Value::Null),
                    created_at: row.get(3)?,
                    retry_count: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(items)
    }

    pub fn mark_completed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE learning_queue SET completed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        debug!(id, "queue item completed");
        Ok(())
    }

    /// Record a failure: exponential backoff up to an hour, permanent failure
    /// once `MAX_RETRIES` is reached.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        let retry_count: Option<u32> = conn
            .query_row(
                "SELECT retry_count FROM learning_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(retry_count) = retry_count else {
            return Ok(());
        };
        let retry_count = retry_count + 1;

        if retry_count >= MAX_RETRIES {
            conn.execute(
                "UPDATE learning_queue
                 SET retry_count = ?1, last_error = ?2, completed_at = ?3, next_retry_at = NULL
                 WHERE id = ?4",
                params![
                    retry_count,
                    format!("PERMANENTLY_FAILED: {}", error),
                    Utc::now().to_rfc3339(),
                    id
                ],
            )?;
            error!(id, retry_count, "queue item permanently failed");
            return Ok(());
        }

        let backoff_minutes = 2i64.pow(retry_count).min(60);
        let next_retry = Utc::now() + Duration::minutes(backoff_minutes);
        conn.execute(
            "UPDATE learning_queue
             SET retry_count = ?1, last_error = ?2, next_retry_at = ?3
             WHERE id = ?4",
            params![retry_count, error, next_retry.to_rfc3339(), id],
        )?;
        warn!(id, retry_count, max = MAX_RETRIES, error, "queue item failed, backing off");
        Ok(())
    }

    /// (pending, completed) counts.
    pub fn stats(&self) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN completed_at IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN completed_at IS NOT NULL THEN 1 ELSE 0 END), 0)
             FROM learning_queue",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(row)
    }

    /// Permanently failed items awaiting operator re-injection.
    pub fn permanently_failed(&self) -> Result<Vec<(i64, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, operation, last_error FROM learning_queue
             WHERE completed_at IS NOT NULL AND last_error LIKE 'PERMANENTLY_FAILED:%'
             ORDER BY created_at ASC",
        )?;
        let rows: Vec<(i64, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

/// Bidirectional sync service between appliance and control plane.
pub struct LearningSyncService {
    transport: Arc<dyn SyncTransport>,
    store: Arc<crate::incident_store::IncidentStore>,
    queue: SyncQueue,
    site_id: String,
    appliance_id: String,
    promoted_rules_dir: PathBuf,
    level1: Mutex<Option<Arc<DeterministicEngine>>>,
    pattern_sync_interval_secs: i64,
    last_pattern_sync: Mutex<Option<DateTime<Utc>>>,
    last_rule_fetch: Mutex<Option<DateTime<Utc>>>,
}

impl LearningSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        store: Arc<crate::incident_store::IncidentStore>,
        queue_path: &Path,
        site_id: &str,
        appliance_id: &str,
        promoted_rules_dir: PathBuf,
        pattern_sync_interval_secs: i64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&promoted_rules_dir)?;
        Ok(Self {
            transport,
            store,
            queue: SyncQueue::open(queue_path)?,
            site_id: site_id.to_string(),
            appliance_id: appliance_id.to_string(),
            promoted_rules_dir,
            level1: Mutex::new(None),
            pattern_sync_interval_secs,
            last_pattern_sync: Mutex::new(None),
            last_rule_fetch: Mutex::new(None),
        })
    }

    /// Attach the L1 engine so deployed rules trigger a reload.
    pub fn set_level1(&self, level1: Arc<DeterministicEngine>) {
        *self.level1.lock() = Some(level1);
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Main sync entry point, called periodically from the orchestrator.
    pub async fn sync(&self) -> Value {
        let mut report = json!({
            "synced_at": Utc::now().to_rfc3339(),
            "patterns_synced": false,
            "patterns_count": 0,
            "rules_fetched": false,
            "rules_count": 0,
            "offline_queue_processed": false,
            "offline_queue_items": 0,
            "errors": [],
        });
        let mut errors: Vec<String> = Vec::new();

        // Replay failed operations first
        match self.process_offline_queue().await {
            Ok(processed) => {
                report["offline_queue_processed"] = json!(true);
                report["offline_queue_items"] = json!(processed);
            }
            Err(e) => {
                warn!(error = %e, "offline queue processing failed");
                errors.push(format!("offline_queue: {}", e));
            }
        }

        if self.pattern_sync_due() {
            match self.sync_pattern_stats().await {
                Ok(count) => {
                    report["patterns_synced"] = json!(true);
                    report["patterns_count"] = json!(count);
                    *self.last_pattern_sync.lock() = Some(Utc::now());
                }
                Err(e) => {
                    warn!(error = %e, "pattern sync failed, queueing");
                    if let Err(qe) = self.queue_pattern_sync() {
                        error!(error = %qe, "failed to queue pattern sync");
                    }
                    errors.push(format!("pattern_sync: {}", e));
                }
            }
        }

        match self.fetch_and_deploy_rules().await {
            Ok(count) => {
                report["rules_fetched"] = json!(true);
                report["rules_count"] = json!(count);
                *self.last_rule_fetch.lock() = Some(Utc::now());
            }
            Err(e) => {
                warn!(error = %e, "rule fetch failed");
                errors.push(format!("rule_fetch: {}", e));
            }
        }

        report["errors"] = json!(errors);
        report
    }

    fn pattern_sync_due(&self) -> bool {
        match *self.last_pattern_sync.lock() {
            None => true,
            Some(last) => (Utc::now() - last).num_seconds() >= self.pattern_sync_interval_secs,
        }
    }

    fn pattern_sync_payload(&self) -> Result<Value> {
        let stats = self.store.all_pattern_stats()?;
        Ok(json!({
            "site_id": self.site_id,
            "appliance_id": self.appliance_id,
            "synced_at": Utc::now().to_rfc3339(),
            "pattern_stats": stats,
        }))
    }

    async fn sync_pattern_stats(&self) -> Result<usize> {
        let payload = self.pattern_sync_payload()?;
        let count = payload["pattern_stats"].as_array().map(|a| a.len()).unwrap_or(0);
        if count == 0 {
            debug!("no pattern stats to sync");
            return Ok(0);
        }
        let response = self.transport.post_pattern_stats(&payload).await?;
        let accepted = response.get("accepted").and_then(|v| v.as_u64()).unwrap_or(0);
        let merged = response.get("merged").and_then(|v| v.as_u64()).unwrap_or(0);
        info!(accepted, merged, "pattern sync complete");
        Ok((accepted + merged) as usize)
    }

    fn queue_pattern_sync(&self) -> Result<()> {
        let payload = self.pattern_sync_payload()?;
        self.queue.enqueue("pattern_sync", &payload)?;
        Ok(())
    }

    /// Fetch server-approved promoted rules since the last successful fetch
    /// and deploy them, reloading L1 when anything landed.
    async fn fetch_and_deploy_rules(&self) -> Result<usize> {
        let since = self
            .last_rule_fetch
            .lock()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());

        let rules = self.transport.fetch_promoted_rules(&since).await?;
        let mut deployed = 0usize;
        for rule in &rules {
            match self.deploy_promoted_rule(rule) {
                Ok(true) => deployed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        rule_id = rule.get("rule_id").and_then(|v| v.as_str()).unwrap_or("?"),
                        error = %e,
                        "failed to deploy promoted rule"
                    );
                }
            }
        }

        if deployed > 0 {
            info!(deployed, "deployed promoted rules from server");
            if let Some(level1) = self.level1.lock().clone() {
                level1.reload_rules();
            }
        }
        Ok(deployed)
    }

    /// Write a server-approved rule into the promoted rules directory.
    /// Returns false when the rule is already deployed.
    pub fn deploy_promoted_rule(&self, rule: &Value) -> Result<bool> {
        let rule_id = rule
            .get("rule_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApplianceError::InvalidOrder("missing rule_id".into()))?;
        let rule_yaml = rule
            .get("rule_yaml")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApplianceError::InvalidOrder("missing rule_yaml".into()))?;

        let rule_file = self.promoted_rules_dir.join(format!("{}.yaml", rule_id));
        if rule_file.exists() {
            debug!(rule_id, "rule already deployed, skipping");
            return Ok(false);
        }
        std::fs::write(&rule_file, rule_yaml)?;
        info!(rule_id, file = %rule_file.display(), "deployed promoted rule");
        Ok(true)
    }

    /// Replay queued operations; per item, success clears it and failure
    /// updates retry state.
    pub async fn process_offline_queue(&self) -> Result<usize> {
        let items = self.queue.dequeue_batch(DRAIN_BATCH_SIZE)?;
        let mut processed = 0usize;

        for item in items {
            let result = match item.operation.as_str() {
                "pattern_sync" => self
                    .transport
                    .post_pattern_stats(&item.data)
                    .await
                    .map(|_| ()),
                "execution_report" => self.transport.post_execution(&item.data).await,
                "evidence_submit" => self.transport.submit_evidence(&item.data).await.map(|_| ()),
                other => {
                    warn!(operation = other, "unknown queue operation, discarding");
                    self.queue.mark_completed(item.id)?;
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    self.queue.mark_completed(item.id)?;
                    processed += 1;
                }
                Err(e) => {
                    self.queue.mark_failed(item.id, &e.to_string())?;
                }
            }
        }

        if processed > 0 {
            info!(processed, "processed offline queue items");
        }
        Ok(processed)
    }

    /// Submit an evidence payload, queueing on failure.
    pub async fn submit_evidence(&self, payload: &Value) -> Option<String> {
        match self.transport.submit_evidence(payload).await {
            Ok(bundle_id) => Some(bundle_id),
            Err(e) => {
                warn!(error = %e, "evidence submission failed, queueing");
                if let Err(qe) = self.queue.enqueue("evidence_submit", payload) {
                    error!(error = %qe, "failed to queue evidence");
                }
                None
            }
        }
    }
}

#[async_trait]
impl ExecutionReporter for LearningSyncService {
    /// Report execution telemetry, queueing when offline. Returns true when
    /// delivered online.
    async fn report_execution(&self, execution: Value) -> bool {
        let payload = json!({
            "site_id": self.site_id,
            "execution": execution,
            "reported_at": Utc::now().to_rfc3339(),
        });
        match self.transport.post_execution(&payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "execution report failed, queueing");
                if let Err(qe) = self.queue.enqueue("execution_report", &payload) {
                    error!(error = %qe, "failed to queue execution report");
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident_store::{IncidentOutcome, IncidentStore, ResolutionLevel, Severity};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FakeTransport {
        online: AtomicBool,
        pattern_posts: AtomicUsize,
        execution_posts: AtomicUsize,
        evidence_posts: AtomicUsize,
        rules: Mutex<Vec<Value>>,
    }

    impl FakeTransport {
        fn new(online: bool) -> Self {
            Self {
                online: AtomicBool::new(online),
                pattern_posts: AtomicUsize::new(0),
                execution_posts: AtomicUsize::new(0),
                evidence_posts: AtomicUsize::new(0),
                rules: Mutex::new(Vec::new()),
            }
        }

        fn check_online(&self) -> Result<()> {
            if self.online.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ApplianceError::TransientRemote("connection refused".into()))
            }
        }
    }

    #[async_trait]
    impl SyncTransport for FakeTransport {
        async fn post_pattern_stats(&self, payload: &Value) -> Result<Value> {
            self.check_online()?;
            self.pattern_posts.fetch_add(1, Ordering::SeqCst);
            let count = payload["pattern_stats"].as_array().map(|a| a.len()).unwrap_or(0);
            Ok(json!({"accepted": count, "merged": 0}))
        }

        async fn post_execution(&self, _payload: &Value) -> Result<()> {
            self.check_online()?;
            self.execution_posts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn submit_evidence(&self, _payload: &Value) -> Result<String> {
            self.check_online()?;
            self.evidence_posts.fetch_add(1, Ordering::SeqCst);
            Ok("EB-123".to_string())
        }

        async fn fetch_promoted_rules(&self, _since: &str) -> Result<Vec<Value>> {
            self.check_online()?;
            Ok(self.rules.lock().clone())
        }
    }

    fn service(
        dir: &tempfile::TempDir,
        transport: Arc<FakeTransport>,
    ) -> (LearningSyncService, Arc<IncidentStore>) {
        let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
        let service = LearningSyncService::new(
            transport,
            store.clone(),
            &dir.path().join("learning_sync_queue.db"),
            "site-1",
            "appliance-1",
            dir.path().join("rules/promoted"),
            14_400,
        )
        .unwrap();
        (service, store)
    }

    fn seed_pattern(store: &IncidentStore) {
        let inc = store
            .create_incident("site-1", "h1", "backup", Severity::Medium, json!({"check_type": "backup"}))
            .unwrap();
        store
            .resolve_incident(&inc.id, ResolutionLevel::Level1Deterministic, "run_backup_job", IncidentOutcome::Success, 100)
            .unwrap();
    }

    #[test]
    fn queue_backoff_and_permanent_failure() {
        let dir = tempdir().unwrap();
        let queue = SyncQueue::open(&dir.path().join("q.db")).unwrap();
        let id = queue.enqueue("pattern_sync", &json!({"x": 1})).unwrap();

        // first failure: backoff scheduled, item not ready
        queue.mark_failed(id, "boom").unwrap();
        assert!(queue.dequeue_batch(10).unwrap().is_empty());
        let (pending, completed) = queue.stats().unwrap();
        assert_eq!((pending, completed), (1, 0));

        // drive to permanent failure
        for _ in 0..9 {
            queue.mark_failed(id, "boom").unwrap();
        }
        let (pending, completed) = queue.stats().unwrap();
        assert_eq!((pending, completed), (0, 1));

        let failed = queue.permanently_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].2.starts_with("PERMANENTLY_FAILED:"));
    }

    #[test]
    fn dequeue_is_oldest_first_and_batched() {
        let dir = tempdir().unwrap();
        let queue = SyncQueue::open(&dir.path().join("q.db")).unwrap();
        for i in 0..15 {
            queue.enqueue("execution_report", &json!({"i": i})).unwrap();
        }
        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].data["i"], 0);
        assert_eq!(batch[9].data["i"], 9);
    }

    #[tokio::test]
    async fn report_execution_online_and_offline() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(true));
        let (service, _store) = service(&dir, transport.clone());

        assert!(service.report_execution(json!({"execution_id": "e1"})).await);
        assert_eq!(transport.execution_posts.load(Ordering::SeqCst), 1);

        // offline: queued instead
        transport.online.store(false, Ordering::SeqCst);
        assert!(!service.report_execution(json!({"execution_id": "e2"})).await);
        let (pending, _) = service.queue().stats().unwrap();
        assert_eq!(pending, 1);

        // back online: drain replays it
        transport.online.store(true, Ordering::SeqCst);
        let processed = service.process_offline_queue().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(transport.execution_posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_pushes_pattern_stats_when_due() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(true));
        let (service, store) = service(&dir, transport.clone());
        seed_pattern(&store);

        let report = service.sync().await;
        assert_eq!(report["patterns_synced"], true);
        assert_eq!(report["patterns_count"], 1);
        assert_eq!(transport.pattern_posts.load(Ordering::SeqCst), 1);

        // interval not elapsed: no second push
        let report = service.sync().await;
        assert_eq!(report["patterns_synced"], false);
        assert_eq!(transport.pattern_posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_pattern_sync_is_queued() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(false));
        let (service, store) = service(&dir, transport.clone());
        seed_pattern(&store);

        let report = service.sync().await;
        assert_eq!(report["patterns_synced"], false);
        assert!(report["errors"].as_array().unwrap().len() >= 1);
        let (pending, _) = service.queue().stats().unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn promoted_rules_deploy_once(){
        let dir = tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(true));
        transport.rules.lock().push(json!({
            "rule_id": "L1-PROMOTED-AB12CD34",
            "rule_yaml": "id: L1-PROMOTED-AB12CD34\nname: promoted\nconditions: []\naction: restart_service\n",
        }));
        let (service, _store) = service(&dir, transport.clone());

        let report = service.sync().await;
        assert_eq!(report["rules_count"], 1);
        assert!(dir
            .path()
            .join("rules/promoted/L1-PROMOTED-AB12CD34.yaml")
            .exists());

        // second fetch skips the already-deployed file
        let report = service.sync().await;
        assert_eq!(report["rules_count"], 0);
    }

    #[tokio::test]
    async fn evidence_submission_falls_back_to_queue() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(false));
        let (service, _store) = service(&dir, transport.clone());

        let bundle_id = service.submit_evidence(&json!({"site_id": "site-1"})).await;
        assert!(bundle_id.is_none());
        let (pending, _) = service.queue().stats().unwrap();
        assert_eq!(pending, 1);

        transport.online.store(true, Ordering::SeqCst);
        let processed = service.process_offline_queue().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(transport.evidence_posts.load(Ordering::SeqCst), 1);
    }
}
