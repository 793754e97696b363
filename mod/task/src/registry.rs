use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use docpipe_core::{ServiceError, new_id, now_rfc3339};
use docpipe_kv::{KeyValueStore, KvError};

use crate::model::{Task, TaskStatus};

/// Attempts for store calls on the critical dispatch path.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for task record retention and index bounds.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Retention window for task records, refreshed on every save.
    pub record_ttl_secs: u64,
    /// Maximum length of the per-user and per-project id lists.
    pub max_index_len: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 24 * 3600,
            max_index_len: 50,
        }
    }
}

/// Attributes of a task to be created.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_type: String,
    pub project_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Durable task-record store layered on the shared key/value service.
///
/// Records live under `task:{id}` with a bounded retention TTL. Two
/// secondary indexes — `user:{id}:tasks` and `project:{id}:tasks` — hold
/// the most recent task ids, trimmed to a bounded length. Records are
/// never deleted; they age out of the store.
pub struct TaskRegistry {
    kv: Arc<dyn KeyValueStore>,
    config: RegistryConfig,
}

fn task_key(id: &str) -> String {
    format!("task:{id}")
}

fn user_index(user_id: &str) -> String {
    format!("user:{user_id}:tasks")
}

fn project_index(project_id: &str) -> String {
    format!("project:{project_id}:tasks")
}

fn store_err(e: KvError) -> ServiceError {
    match e {
        KvError::Unavailable(msg) => ServiceError::Unavailable(msg),
        other => ServiceError::Storage(other.to_string()),
    }
}

impl TaskRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(kv, RegistryConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KeyValueStore>, config: RegistryConfig) -> Self {
        Self { kv, config }
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Create a new PENDING task, write its record, and index it under
    /// the owning user and project.
    pub async fn create(&self, new: NewTask) -> Result<Task, ServiceError> {
        if new.task_type.is_empty() {
            return Err(ServiceError::Validation("task type must not be empty".into()));
        }

        let task = Task {
            id: new_id(),
            task_type: new.task_type,
            status: TaskStatus::Pending,
            project_id: new.project_id,
            tenant_id: new.tenant_id,
            user_id: new.user_id,
            title: new.title,
            description: new.description,
            progress: 0,
            result: None,
            error: None,
            metadata: new.metadata,
            created_at: now_rfc3339(),
            started_at: None,
            completed_at: None,
        };

        self.save(&task).await?;
        self.index(&user_index(&task.user_id), &task.id).await?;
        self.index(&project_index(&task.project_id), &task.id).await?;
        debug!("created task {} ({})", task.id, task.task_type);
        Ok(task)
    }

    /// Get a task by id. Returns None once the record has expired.
    pub async fn get(&self, id: &str) -> Result<Option<Task>, ServiceError> {
        let key = task_key(id);
        let Some(raw) = self.get_with_retry(&key).await? else {
            return Ok(None);
        };
        let task = serde_json::from_slice(&raw)
            .map_err(|e| ServiceError::Storage(format!("bad task record {id}: {e}")))?;
        Ok(Some(task))
    }

    /// Full overwrite of the record, refreshing its retention TTL.
    /// Partial field updates are deliberately not offered: every mutation
    /// is a read-modify-write of the whole record.
    pub async fn save(&self, task: &Task) -> Result<(), ServiceError> {
        let raw = serde_json::to_vec(task).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.set_with_retry(&task_key(&task.id), &raw).await
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    /// The most recent tasks created by a user, newest first.
    pub async fn list_for_user(&self, user_id: &str, limit: u64) -> Result<Vec<Task>, ServiceError> {
        self.hydrate(&user_index(user_id), limit).await
    }

    /// The most recent tasks in a project, newest first.
    pub async fn list_for_project(
        &self,
        project_id: &str,
        limit: u64,
    ) -> Result<Vec<Task>, ServiceError> {
        self.hydrate(&project_index(project_id), limit).await
    }

    /// Prepend the task id, trim to the bound, refresh the list TTL.
    async fn index(&self, key: &str, task_id: &str) -> Result<(), ServiceError> {
        self.kv
            .list_push_left(key, task_id.as_bytes())
            .await
            .map_err(store_err)?;
        self.kv
            .list_trim(key, 0, self.config.max_index_len as i64 - 1)
            .await
            .map_err(store_err)?;
        self.kv
            .expire(key, self.config.record_ttl_secs)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn hydrate(&self, key: &str, limit: u64) -> Result<Vec<Task>, ServiceError> {
        if limit == 0 {
            // `0, -1` would select the whole list.
            return Ok(Vec::new());
        }
        let limit = limit.min(self.config.max_index_len);
        let ids = self
            .kv
            .list_range(key, 0, limit as i64 - 1)
            .await
            .map_err(store_err)?;

        let mut tasks = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = String::from_utf8(raw) else {
                warn!("non-utf8 task id in index {key}, skipping");
                continue;
            };
            // Expired records are silently skipped; the index entry
            // outlives the record by design.
            if let Some(task) = self.get(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Bounded retry for the critical dispatch path
    // -----------------------------------------------------------------------

    async fn get_with_retry(&self, key: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        let mut attempt = 1;
        loop {
            match self.kv.get(key).await {
                Ok(value) => return Ok(value),
                Err(KvError::Unavailable(msg)) if attempt < RETRY_ATTEMPTS => {
                    warn!("store read of {key} failed (attempt {attempt}): {msg}, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    async fn set_with_retry(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let mut attempt = 1;
        loop {
            match self.kv.set_ex(key, value, self.config.record_ttl_secs).await {
                Ok(()) => return Ok(()),
                Err(KvError::Unavailable(msg)) if attempt < RETRY_ATTEMPTS => {
                    warn!("store write of {key} failed (attempt {attempt}): {msg}, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_kv::MemoryStore;

    fn test_registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn new_task(user: &str, project: &str) -> NewTask {
        NewTask {
            task_type: "doc.parse".into(),
            project_id: project.into(),
            tenant_id: "tn1".into(),
            user_id: user.into(),
            title: "Parse tender.pdf".into(),
            description: String::new(),
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let registry = test_registry();
        let task = registry.create(new_task("u1", "p1")).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.started_at.is_none());

        let got = registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.id, task.id);
        assert_eq!(got.task_type, "doc.parse");
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let registry = test_registry();
        assert!(registry.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_type_rejected() {
        let registry = test_registry();
        let result = registry
            .create(NewTask {
                task_type: String::new(),
                ..new_task("u1", "p1")
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn save_overwrites_whole_record() {
        let registry = test_registry();
        let mut task = registry.create(new_task("u1", "p1")).await.unwrap();

        task.status = TaskStatus::Running;
        task.progress = 30;
        task.started_at = Some(now_rfc3339());
        registry.save(&task).await.unwrap();

        let got = registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Running);
        assert_eq!(got.progress, 30);
        assert!(got.started_at.is_some());
    }

    #[tokio::test]
    async fn lists_are_newest_first() {
        let registry = test_registry();
        let first = registry.create(new_task("u1", "p1")).await.unwrap();
        let second = registry.create(new_task("u1", "p1")).await.unwrap();

        let for_user = registry.list_for_user("u1", 10).await.unwrap();
        assert_eq!(for_user.len(), 2);
        assert_eq!(for_user[0].id, second.id);
        assert_eq!(for_user[1].id, first.id);

        let for_project = registry.list_for_project("p1", 10).await.unwrap();
        assert_eq!(for_project.len(), 2);
    }

    #[tokio::test]
    async fn list_respects_limit_and_owner() {
        let registry = test_registry();
        registry.create(new_task("u1", "p1")).await.unwrap();
        registry.create(new_task("u1", "p1")).await.unwrap();
        registry.create(new_task("u2", "p2")).await.unwrap();

        assert_eq!(registry.list_for_user("u1", 1).await.unwrap().len(), 1);
        assert_eq!(registry.list_for_user("u2", 10).await.unwrap().len(), 1);
        assert_eq!(registry.list_for_project("p2", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_limit_lists_nothing() {
        let registry = test_registry();
        registry.create(new_task("u1", "p1")).await.unwrap();
        registry.create(new_task("u1", "p1")).await.unwrap();

        assert!(registry.list_for_user("u1", 0).await.unwrap().is_empty());
        assert!(registry.list_for_project("p1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_is_trimmed_to_bound() {
        let kv = Arc::new(MemoryStore::new());
        let registry = TaskRegistry::with_config(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            RegistryConfig {
                max_index_len: 3,
                ..Default::default()
            },
        );

        for _ in 0..5 {
            registry.create(new_task("u1", "p1")).await.unwrap();
        }
        let ids = kv.list_range("user:u1:tasks", 0, -1).await.unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn hydrate_skips_expired_records() {
        let kv = Arc::new(MemoryStore::new());
        let registry = TaskRegistry::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>);
        let task = registry.create(new_task("u1", "p1")).await.unwrap();

        // An index entry whose record never existed (or has expired).
        kv.list_push_left("user:u1:tasks", b"ghost").await.unwrap();

        let tasks = registry.list_for_user("u1", 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task.id);
    }
}
