//! Conversation bookkeeping: thread resolution, per-thread settings, and
//! last-active timestamps.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, ThreadlineError};
use crate::types::{ThreadId, ThreadSettings};

const TITLE_MAX_CHARS: usize = 50;

/// Persistent conversation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub thread_id: ThreadId,
    pub title: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub settings: ThreadSettings,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        thread_id: ThreadId,
        first_message: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            title: first_message.chars().take(TITLE_MAX_CHARS).collect(),
            metadata,
            settings: ThreadSettings::default(),
            created_at: now,
            last_active_at: now,
        }
    }
}

/// Trait for conversation bookkeeping backends.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Resolve an existing thread, or create a new conversation when no id is given.
    ///
    /// An id that does not exist is `NotFound`.
    async fn get_or_create(
        &self,
        thread_id: Option<&ThreadId>,
        first_message: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Conversation>;

    async fn get(&self, thread_id: &ThreadId) -> Result<Option<Conversation>>;

    /// Per-thread model overrides.
    async fn settings(&self, thread_id: &ThreadId) -> Result<ThreadSettings>;

    /// Replace the per-thread model overrides.
    async fn update_settings(&self, thread_id: &ThreadId, settings: ThreadSettings) -> Result<()>;

    /// Refresh the conversation's last-active timestamp.
    async fn touch(&self, thread_id: &ThreadId) -> Result<()>;

    async fn list(&self) -> Result<Vec<Conversation>>;
}

fn not_found(thread_id: &ThreadId) -> ThreadlineError {
    ThreadlineError::NotFound(format!("Conversation {thread_id}"))
}

/// File-based store keeping every conversation in a single JSON index.
///
/// Layout: `<base>/conversations.json`, an array of [`Conversation`].
pub struct JsonConversationStore {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonConversationStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            write_lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.base.join("conversations.json")
    }

    async fn load_index(&self) -> Result<Vec<Conversation>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let conversations: Vec<Conversation> = serde_json::from_str(&data)
            .map_err(|e| ThreadlineError::Store(format!("corrupt conversation index: {e}")))?;
        Ok(conversations)
    }

    async fn save_index(&self, conversations: &[Conversation]) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        let data = serde_json::to_string_pretty(conversations)?;
        let path = self.index_path();
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Load the index, apply `f` to the matching conversation, and save.
    async fn modify<F>(&self, thread_id: &ThreadId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Conversation) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut conversations = self.load_index().await?;
        let conv = conversations
            .iter_mut()
            .find(|c| &c.thread_id == thread_id)
            .ok_or_else(|| not_found(thread_id))?;
        f(conv);
        self.save_index(&conversations).await
    }
}

#[async_trait]
impl ConversationStore for JsonConversationStore {
    async fn get_or_create(
        &self,
        thread_id: Option<&ThreadId>,
        first_message: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Conversation> {
        if let Some(id) = thread_id {
            return self.get(id).await?.ok_or_else(|| not_found(id));
        }

        let _guard = self.write_lock.lock().await;
        let mut conversations = self.load_index().await?;
        let conv = Conversation::new(ThreadId::generate(), first_message, metadata);
        conversations.push(conv.clone());
        self.save_index(&conversations).await?;

        debug!(thread_id = %conv.thread_id, "Created conversation");
        Ok(conv)
    }

    async fn get(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        let conversations = self.load_index().await?;
        Ok(conversations.into_iter().find(|c| &c.thread_id == thread_id))
    }

    async fn settings(&self, thread_id: &ThreadId) -> Result<ThreadSettings> {
        self.get(thread_id)
            .await?
            .map(|c| c.settings)
            .ok_or_else(|| not_found(thread_id))
    }

    async fn update_settings(&self, thread_id: &ThreadId, settings: ThreadSettings) -> Result<()> {
        self.modify(thread_id, |c| c.settings = settings).await
    }

    async fn touch(&self, thread_id: &ThreadId) -> Result<()> {
        self.modify(thread_id, |c| c.last_active_at = Utc::now()).await?;
        debug!(%thread_id, "Refreshed last-active timestamp");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Conversation>> {
        self.load_index().await
    }
}

/// In-process store for tests and ephemeral servers.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<ThreadId, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_or_create(
        &self,
        thread_id: Option<&ThreadId>,
        first_message: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Conversation> {
        if let Some(id) = thread_id {
            return self.get(id).await?.ok_or_else(|| not_found(id));
        }
        let conv = Conversation::new(ThreadId::generate(), first_message, metadata);
        self.conversations
            .write()
            .await
            .insert(conv.thread_id.clone(), conv.clone());
        Ok(conv)
    }

    async fn get(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(thread_id).cloned())
    }

    async fn settings(&self, thread_id: &ThreadId) -> Result<ThreadSettings> {
        self.get(thread_id)
            .await?
            .map(|c| c.settings)
            .ok_or_else(|| not_found(thread_id))
    }

    async fn update_settings(&self, thread_id: &ThreadId, settings: ThreadSettings) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conv = conversations
            .get_mut(thread_id)
            .ok_or_else(|| not_found(thread_id))?;
        conv.settings = settings;
        Ok(())
    }

    async fn touch(&self, thread_id: &ThreadId) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conv = conversations
            .get_mut(thread_id)
            .ok_or_else(|| not_found(thread_id))?;
        conv.last_active_at = Utc::now();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Conversation>> {
        let mut all: Vec<Conversation> =
            self.conversations.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }
}
