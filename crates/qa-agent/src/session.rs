use async_trait::async_trait;
use qa_core::{ContextMetadata, Language, SessionState, StoredMessage};
use qa_error::{QaError, Result};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, instrument};
use uuid::Uuid;

/// 会话持久化后端；会话记录对后端不透明
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>>;
    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<()>;
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;
    async fn delete(&self, thread_id: &str) -> Result<()>;
}

/// 进程内后端（单实例部署与测试）
#[derive(Default)]
pub struct MemoryCheckpoint {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpoint {
    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>> {
        Ok(self.sessions.read().await.get(thread_id).cloned())
    }

    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .keys()
            .filter(|k| prefix.map(|p| k.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.sessions.write().await.remove(thread_id);
        Ok(())
    }
}

/// Redis 后端，记录按 TTL 过期
pub struct RedisCheckpoint {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisCheckpoint {
    pub fn new(url: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| QaError::SessionStore {
            operation: "connect".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { client, ttl_secs })
    }

    fn key(thread_id: &str) -> String {
        format!("session:{}", thread_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QaError::SessionStore {
                operation: "connect".to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl CheckpointBackend for RedisCheckpoint {
    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> =
            conn.get(Self::key(thread_id))
                .await
                .map_err(|e| QaError::SessionStore {
                    operation: "load".to_string(),
                    message: e.to_string(),
                })?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(state)?;
        conn.set_ex::<_, _, ()>(Self::key(thread_id), json, self.ttl_secs)
            .await
            .map_err(|e| QaError::SessionStore {
                operation: "save".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("session:{}*", prefix.unwrap_or(""));
        let keys: Vec<String> = conn.keys(pattern).await.map_err(|e| QaError::SessionStore {
            operation: "list".to_string(),
            message: e.to_string(),
        })?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("session:").map(|s| s.to_string()))
            .collect())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(Self::key(thread_id))
            .await
            .map_err(|e| QaError::SessionStore {
                operation: "delete".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// 锁表收缩阈值
const LOCK_TABLE_PRUNE_SIZE: usize = 1024;

/// 按 thread_id 串行化的会话存储
///
/// 同一线程的并发 ask 在此排队；历史突变全序。
pub struct SessionStore {
    backend: Arc<dyn CheckpointBackend>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 规范化线程标识；缺省时生成新线程
    pub fn canonical_thread_id(thread_id: Option<&str>) -> (String, bool) {
        match thread_id {
            Some(id) if !id.trim().is_empty() => (id.trim().to_string(), false),
            _ => (Uuid::new_v4().to_string(), true),
        }
    }

    /// 获取线程级互斥锁；空闲条目在表增大时回收
    pub async fn lock_thread(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > LOCK_TABLE_PRUNE_SIZE {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn load_or_create(&self, thread_id: &str) -> Result<SessionState> {
        match self.backend.load(thread_id).await? {
            Some(state) => Ok(state),
            None => Ok(SessionState::new(thread_id)),
        }
    }

    /// 成功应答后提交一轮 user/assistant 交换；revision 严格递增
    #[instrument(skip(self, state, user_text, assistant_text, metadata))]
    pub async fn commit_exchange(
        &self,
        state: &mut SessionState,
        user_text: &str,
        assistant_text: &str,
        retries: u32,
        language: Language,
        metadata: Option<ContextMetadata>,
    ) -> Result<()> {
        state.messages.push(StoredMessage::user(user_text));
        state.messages.push(StoredMessage::assistant(assistant_text));
        state.retries = retries;
        state.last_query_language = Some(language);
        state.last_context_metadata = metadata;
        state.revision += 1;
        self.backend.save(&state.thread_id, state).await?;
        debug!(
            thread_id = %state.thread_id,
            revision = state.revision,
            messages = state.messages.len(),
            "session committed"
        );
        Ok(())
    }

    pub async fn reset(&self, thread_id: &str) -> Result<()> {
        self.backend.delete(thread_id).await
    }

    pub fn backend(&self) -> Arc<dyn CheckpointBackend> {
        self.backend.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryCheckpoint::new()))
    }

    #[test]
    fn test_canonical_thread_id() {
        let (id, created) = SessionStore::canonical_thread_id(Some("t-1"));
        assert_eq!(id, "t-1");
        assert!(!created);
        let (id, created) = SessionStore::canonical_thread_id(None);
        assert!(!id.is_empty());
        assert!(created);
        let (_, created) = SessionStore::canonical_thread_id(Some("  "));
        assert!(created);
    }

    #[tokio::test]
    async fn test_history_alternation_and_revision() {
        let store = store();
        let mut state = store.load_or_create("t-1").await.unwrap();
        assert_eq!(state.revision, 0);

        for i in 0..3 {
            store
                .commit_exchange(
                    &mut state,
                    &format!("question {}", i),
                    &format!("answer {}", i),
                    0,
                    Language::En,
                    None,
                )
                .await
                .unwrap();
        }

        let loaded = store.load_or_create("t-1").await.unwrap();
        // n 次成功 ask 后历史恰好 2n 条，严格 user/assistant 交替
        assert_eq!(loaded.messages.len(), 6);
        for (i, msg) in loaded.messages.iter().enumerate() {
            let expected = if i % 2 == 0 {
                qa_core::ChatRole::User
            } else {
                qa_core::ChatRole::Assistant
            };
            assert_eq!(msg.role, expected);
        }
        assert_eq!(loaded.revision, 3);
    }

    #[tokio::test]
    async fn test_revision_strictly_increases() {
        let store = store();
        let mut state = store.load_or_create("t-r").await.unwrap();
        let mut last = state.revision;
        for _ in 0..5 {
            store
                .commit_exchange(&mut state, "q", "a", 0, Language::En, None)
                .await
                .unwrap();
            assert!(state.revision > last);
            last = state.revision;
        }
    }

    #[tokio::test]
    async fn test_thread_lock_serializes() {
        let store = Arc::new(store());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = store.lock_thread("t-lock").await;

        let store2 = store.clone();
        let order2 = order.clone();
        let waiter = tokio::spawn(async move {
            let _g = store2.lock_thread("t-lock").await;
            order2.lock().await.push("second");
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().await.push("first");
        drop(guard);

        waiter.await.unwrap();
        let order = order.lock().await;
        assert_eq!(order.as_slice(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_different_threads_do_not_block() {
        let store = store();
        let _a = store.lock_thread("t-a").await;
        // 不同线程的锁立即可得
        let acquired =
            tokio::time::timeout(Duration::from_millis(50), store.lock_thread("t-b")).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let store = store();
        let mut state = store.load_or_create("t-x").await.unwrap();
        store
            .commit_exchange(&mut state, "q", "a", 0, Language::En, None)
            .await
            .unwrap();
        store.reset("t-x").await.unwrap();
        let fresh = store.load_or_create("t-x").await.unwrap();
        assert!(fresh.messages.is_empty());
        assert_eq!(fresh.revision, 0);
    }

    #[tokio::test]
    async fn test_memory_backend_list_with_prefix() {
        let backend = MemoryCheckpoint::new();
        backend
            .save("alpha-1", &SessionState::new("alpha-1"))
            .await
            .unwrap();
        backend
            .save("beta-1", &SessionState::new("beta-1"))
            .await
            .unwrap();
        let all = backend.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let alphas = backend.list(Some("alpha")).await.unwrap();
        assert_eq!(alphas, vec!["alpha-1".to_string()]);
    }
}
