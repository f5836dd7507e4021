use std::{collections::HashSet, sync::Arc, time::Duration};

use futures_util::future::join_all;
use nanoid::nanoid;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    error::PoolError,
    now_millis, preview_key,
    store::{ApiKeyRecord, KeyStore},
    validator::{KeyValidator, Validation},
};

/// 单个 key 刷新后的结果。
#[derive(Debug, Clone, Serialize)]
pub struct KeyRefreshOutcome {
    pub id: String,
    pub key: String,
    pub valid: bool,
    pub balance: f64,
    pub error: Option<String>,
}

/// 一次刷新的汇总。
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub total: usize,
    pub batches: usize,
    pub valid: usize,
    pub invalid: usize,
    pub started_at: i64,
    pub finished_at: i64,
    pub results: Vec<KeyRefreshOutcome>,
}

/// 批量导入统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub total: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

/// Runs the validator over key sets in fixed-size batches: keys inside a batch
/// are validated concurrently, batches are separated by `delay`.
pub struct BatchRefresher {
    store: Arc<KeyStore>,
    validator: Arc<dyn KeyValidator>,
    batch_size: usize,
    import_batch_size: usize,
    delay: Duration,
}

impl BatchRefresher {
    pub fn new(
        store: Arc<KeyStore>,
        validator: Arc<dyn KeyValidator>,
        batch_size: usize,
        import_batch_size: usize,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            validator,
            batch_size: batch_size.max(1),
            import_batch_size: import_batch_size.max(1),
            delay,
        }
    }

    /// 同步刷新全部 key。
    pub async fn refresh_all(&self) -> Result<RefreshReport, PoolError> {
        let keys = self.store.fetch_all_keys().await?;
        Ok(self.refresh_keys(keys).await)
    }

    /// 只刷新给定 ID 的 key；不存在的 ID 被忽略。
    pub async fn refresh_scoped(&self, ids: &[String]) -> Result<RefreshReport, PoolError> {
        let keys = self.store.fetch_keys_by_ids(ids).await?;
        Ok(self.refresh_keys(keys).await)
    }

    pub async fn refresh_keys(&self, keys: Vec<ApiKeyRecord>) -> RefreshReport {
        let started_at = now_millis();
        let mut results = Vec::with_capacity(keys.len());
        let mut batches = 0;

        for (index, batch) in keys.chunks(self.batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.delay).await;
            }
            batches += 1;
            let outcomes = join_all(batch.iter().map(|key| self.refresh_one(key))).await;
            results.extend(outcomes);
        }

        let valid = results.iter().filter(|r| r.valid).count();
        tracing::info!(total = keys.len(), batches, valid, "key refresh finished");

        RefreshReport {
            total: keys.len(),
            batches,
            valid,
            invalid: results.len() - valid,
            started_at,
            finished_at: now_millis(),
            results,
        }
    }

    async fn refresh_one(&self, key: &ApiKeyRecord) -> KeyRefreshOutcome {
        let validation = self.validator.validate(&key.key).await;
        let models = (validation.valid && !validation.model_access.is_empty())
            .then_some(validation.model_access.as_slice());

        let mut error = validation.message.clone();
        if let Err(err) = self
            .store
            .apply_validation(
                &key.id,
                validation.valid,
                validation.balance,
                models,
                now_millis(),
            )
            .await
        {
            tracing::error!(key_id = %key.id, error = %err, "failed to store refresh result");
            error = Some(format!("store update failed: {err}"));
        }

        KeyRefreshOutcome {
            id: key.id.clone(),
            key: key.key.clone(),
            valid: validation.valid,
            balance: validation.balance,
            error,
        }
    }

    /// Imports secrets: already-stored or repeated secrets count as duplicates, the
    /// rest are validated in import-sized batches and only valid ones are stored.
    pub async fn import(&self, secrets: &[String]) -> Result<ImportStats, PoolError> {
        let mut stats = ImportStats {
            total: secrets.len(),
            ..Default::default()
        };

        let trimmed: Vec<String> = secrets.iter().map(|s| s.trim().to_owned()).collect();
        let existing = self.store.existing_secrets(&trimmed).await?;

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for secret in trimmed {
            if secret.is_empty() {
                stats.invalid += 1;
            } else if existing.contains(&secret) || !seen.insert(secret.clone()) {
                stats.duplicates += 1;
            } else {
                fresh.push(secret);
            }
        }

        for (index, batch) in fresh.chunks(self.import_batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.delay).await;
            }
            let validations = join_all(batch.iter().map(|s| self.validator.validate(s))).await;
            for (secret, validation) in batch.iter().zip(validations) {
                match self.store_imported(secret, &validation).await {
                    ImportOutcome::Imported => stats.imported += 1,
                    ImportOutcome::Duplicate => stats.duplicates += 1,
                    ImportOutcome::Invalid => stats.invalid += 1,
                }
            }
        }

        tracing::info!(
            total = stats.total,
            imported = stats.imported,
            duplicates = stats.duplicates,
            invalid = stats.invalid,
            "key import finished"
        );
        Ok(stats)
    }

    async fn store_imported(&self, secret: &str, validation: &Validation) -> ImportOutcome {
        if !validation.valid {
            return ImportOutcome::Invalid;
        }
        match self
            .store
            .insert_key(
                secret,
                validation.balance,
                &validation.model_access,
                now_millis(),
            )
            .await
        {
            Ok(Some(_)) => ImportOutcome::Imported,
            Ok(None) => ImportOutcome::Duplicate,
            Err(err) => {
                tracing::error!(key = %preview_key(secret), error = %err, "failed to insert imported key");
                ImportOutcome::Invalid
            }
        }
    }
}

enum ImportOutcome {
    Imported,
    Duplicate,
    Invalid,
}

/// 后台全量刷新任务。
#[derive(Debug)]
struct RefreshJob {
    run_id: String,
    keys: Vec<ApiKeyRecord>,
}

/// Detached refresh worker. Jobs are queued and run one at a time after the
/// enqueuing request has returned; each report lands in the refresh-run store.
#[derive(Debug, Clone)]
pub struct RefreshQueue {
    sender: mpsc::UnboundedSender<RefreshJob>,
}

impl RefreshQueue {
    pub fn spawn(refresher: Arc<BatchRefresher>, store: Arc<KeyStore>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_refresh_worker(receiver, refresher, store));
        Self { sender }
    }

    /// Enqueues the keys and returns the run id the report will be stored under.
    pub fn enqueue(&self, keys: Vec<ApiKeyRecord>) -> Option<String> {
        let run_id = format!("refresh:{}-{}", now_millis(), nanoid!(8));
        match self.sender.send(RefreshJob {
            run_id: run_id.clone(),
            keys,
        }) {
            Ok(()) => Some(run_id),
            Err(_) => {
                tracing::error!("refresh worker has stopped; background refresh dropped");
                None
            }
        }
    }
}

async fn run_refresh_worker(
    mut receiver: mpsc::UnboundedReceiver<RefreshJob>,
    refresher: Arc<BatchRefresher>,
    store: Arc<KeyStore>,
) {
    while let Some(job) = receiver.recv().await {
        tracing::info!(run_id = %job.run_id, keys = job.keys.len(), "background refresh started");
        let report = refresher.refresh_keys(job.keys).await;

        let payload = match serde_json::to_string(&report) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(run_id = %job.run_id, error = %err, "failed to encode refresh report");
                continue;
            }
        };
        if let Err(err) = store
            .save_refresh_run(&job.run_id, report.finished_at, &payload)
            .await
        {
            tracing::error!(run_id = %job.run_id, error = %err, "failed to persist refresh report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;
    use async_trait::async_trait;
    use std::{sync::Mutex, time::Instant};

    /// `sk-good*` keys are valid with balance 5; every call is timestamped.
    #[derive(Default)]
    struct ScriptedValidator {
        calls: Mutex<Vec<(Instant, String)>>,
        latency: Duration,
    }

    #[async_trait]
    impl KeyValidator for ScriptedValidator {
        async fn validate(&self, secret: &str) -> Validation {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), secret.to_owned()));
            tokio::time::sleep(self.latency).await;
            if secret.starts_with("sk-good") {
                Validation::valid(5.0, vec!["model-a".to_owned()])
            } else {
                Validation::invalid("Invalid API key (Status: 401)")
            }
        }
    }

    fn refresher(
        store: Arc<KeyStore>,
        validator: Arc<ScriptedValidator>,
        batch_size: usize,
        delay: Duration,
    ) -> BatchRefresher {
        BatchRefresher::new(store, validator, batch_size, batch_size, delay)
    }

    #[tokio::test]
    async fn refresh_runs_ceil_batches_and_sleeps_between_them() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        for i in 0..7 {
            store
                .insert_key(&format!("sk-good-{i}"), 1.0, &[], i)
                .await
                .unwrap();
        }

        let delay = Duration::from_millis(300);
        let validator = Arc::new(ScriptedValidator {
            latency: Duration::from_millis(10),
            ..Default::default()
        });
        let refresher = refresher(store.clone(), validator.clone(), 3, delay);

        let started = Instant::now();
        let report = refresher.refresh_all().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.total, 7);
        assert_eq!(report.batches, 3);
        assert_eq!(report.valid, 7);

        let calls = validator.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 7);
        // siblings start together, batches are spaced by the delay
        assert!(calls[2].0 - calls[0].0 < delay);
        assert!(calls[3].0 - calls[2].0 >= delay);
        assert!(calls[6].0 - calls[5].0 >= delay);
        // two gaps, none after the final batch
        assert!(elapsed >= delay * 2);
        assert!(elapsed < delay * 3);
    }

    #[tokio::test]
    async fn invalid_key_does_not_abort_its_batch() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let good = store.insert_key("sk-good-a", 0.0, &[], 1).await.unwrap().unwrap();
        let bad = store.insert_key("sk-bad", 9.0, &[], 1).await.unwrap().unwrap();

        let validator = Arc::new(ScriptedValidator::default());
        let refresher = refresher(store.clone(), validator, 5, Duration::ZERO);
        let report = refresher.refresh_all().await.unwrap();

        assert_eq!(report.valid, 1);
        assert_eq!(report.invalid, 1);

        let good = store.fetch_key(&good).await.unwrap().unwrap();
        assert!(good.is_active);
        assert_eq!(good.balance, 5.0);
        assert_eq!(good.model_access, vec!["model-a"]);
        assert!(good.last_check_time.is_some());

        let bad = store.fetch_key(&bad).await.unwrap().unwrap();
        assert!(!bad.is_active);
        assert_eq!(bad.balance, 0.0);
    }

    #[tokio::test]
    async fn scoped_refresh_only_touches_requested_ids() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let a = store.insert_key("sk-good-a", 1.0, &[], 1).await.unwrap().unwrap();
        let b = store.insert_key("sk-good-b", 1.0, &[], 1).await.unwrap().unwrap();

        let validator = Arc::new(ScriptedValidator::default());
        let refresher = refresher(store.clone(), validator.clone(), 5, Duration::ZERO);
        let report = refresher
            .refresh_scoped(&[a.clone(), "missing".to_owned()])
            .await
            .unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.results[0].id, a);
        assert_eq!(store.fetch_key(&a).await.unwrap().unwrap().balance, 5.0);
        assert_eq!(store.fetch_key(&b).await.unwrap().unwrap().balance, 1.0);
        let calls = validator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "sk-good-a");
    }

    #[tokio::test]
    async fn import_counts_duplicates_and_invalid() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        store.insert_key("sk-good-stored", 1.0, &[], 1).await.unwrap();

        let validator = Arc::new(ScriptedValidator::default());
        let refresher = refresher(store.clone(), validator, 20, Duration::ZERO);

        let stats = refresher
            .import(&["sk-good-stored".to_owned(), "sk-bad".to_owned()])
            .await
            .unwrap();
        assert_eq!(
            stats,
            ImportStats {
                total: 2,
                imported: 0,
                duplicates: 1,
                invalid: 1,
            }
        );
    }

    #[tokio::test]
    async fn import_stores_valid_keys_once() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let validator = Arc::new(ScriptedValidator::default());
        let refresher = refresher(store.clone(), validator, 2, Duration::ZERO);

        let stats = refresher
            .import(&[
                "sk-good-1".to_owned(),
                " sk-good-1 ".to_owned(),
                "sk-good-2".to_owned(),
                "sk-good-3".to_owned(),
                "".to_owned(),
            ])
            .await
            .unwrap();

        assert_eq!(stats.imported, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(store.fetch_all_keys().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn queued_refresh_persists_its_report() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        store.insert_key("sk-good-q", 1.0, &[], 1).await.unwrap();

        let validator = Arc::new(ScriptedValidator::default());
        let refresher = Arc::new(refresher(store.clone(), validator, 5, Duration::ZERO));
        let queue = RefreshQueue::spawn(refresher, store.clone());

        let keys = store.fetch_all_keys().await.unwrap();
        let run_id = queue.enqueue(keys).unwrap();

        let mut stored = None;
        for _ in 0..100 {
            if let Some(run) = store.latest_refresh_run().await.unwrap() {
                stored = Some(run);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let run = stored.expect("background refresh report");
        assert_eq!(run.id, run_id);
        let report: serde_json::Value = serde_json::from_str(&run.payload).unwrap();
        assert_eq!(report["total"], 1);
        assert_eq!(report["valid"], 1);
    }

    #[tokio::test]
    async fn back_to_back_runs_get_distinct_ids() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        store.insert_key("sk-good-q", 1.0, &[], 1).await.unwrap();

        let validator = Arc::new(ScriptedValidator::default());
        let refresher = Arc::new(refresher(store.clone(), validator, 5, Duration::ZERO));
        let queue = RefreshQueue::spawn(refresher, store.clone());

        let keys = store.fetch_all_keys().await.unwrap();
        let first = queue.enqueue(keys.clone()).unwrap();
        let second = queue.enqueue(keys).unwrap();
        assert_ne!(first, second);

        for _ in 0..100 {
            if let Some(run) = store.latest_refresh_run().await.unwrap()
                && run.id == second
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("second refresh report never became latest");
    }
}
