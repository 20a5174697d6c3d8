use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::core::budget::{Tokenizer, WordPieceTokenizer};
use crate::core::cache::{Cache, MemoryCache};
use crate::core::cipher::FieldCipher;
use crate::core::config::AppConfig;
use crate::core::documents::{DocumentService, VersionChain};
use crate::core::events::{BroadcastSink, EventSink};
use crate::core::llm::LlmManager;
use crate::core::queue::{SqliteTaskQueue, TaskQueue};
use crate::core::store::DocumentStore;
use crate::core::tasks::TaskService;
use crate::core::templates::{PromptRenderer, seed_default_templates};
use crate::core::worker::{Worker, WorkerSettings};

const EVENT_CAPACITY: usize = 256;

/// Every service wired over one store.
#[derive(Clone)]
pub struct StoryApp {
    pub store: Arc<DocumentStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub cache: Arc<dyn Cache>,
    pub events: Arc<BroadcastSink>,
    pub tasks: TaskService,
    pub documents: DocumentService,
    pub renderer: PromptRenderer,
}

impl StoryApp {
    /// Open the configured database, create the queue table and seed the
    /// default prompt templates.
    pub async fn open(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        let cipher = FieldCipher::from_config(config.field_key.as_deref())?;
        let store = DocumentStore::open(config.database_path(data_dir), cipher).await?;
        Ok(Self::assemble(store, &config.queue.name).await?)
    }

    /// Everything in memory, for tests and local experiments.
    pub async fn in_memory(cipher: FieldCipher) -> Result<Self> {
        let store = DocumentStore::in_memory(cipher)?;
        Ok(Self::assemble(store, &AppConfig::default().queue.name).await?)
    }

    async fn assemble(
        store: DocumentStore,
        queue_name: &str,
    ) -> crate::core::error::StoryResult<Self> {
        let store = Arc::new(store);
        seed_default_templates(&store).await?;
        let queue: Arc<dyn TaskQueue> =
            Arc::new(SqliteTaskQueue::new(store.get_db(), queue_name).await?);
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let events = Arc::new(BroadcastSink::new(EVENT_CAPACITY));
        let sink: Arc<dyn EventSink> = events.clone();

        let tasks = TaskService::new(store.clone(), queue.clone(), cache.clone(), sink.clone());
        let chain = VersionChain::new(store.clone(), cache.clone(), sink);
        let renderer = PromptRenderer::new(store.clone());
        let documents =
            DocumentService::new(store.clone(), chain, tasks.clone(), renderer.clone());

        Ok(Self {
            store,
            queue,
            cache,
            events,
            tasks,
            documents,
            renderer,
        })
    }

    pub fn worker(&self, llm: Arc<LlmManager>, settings: WorkerSettings) -> Worker {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WordPieceTokenizer);
        Worker::new(
            self.documents.clone(),
            llm,
            self.queue.clone(),
            tokenizer,
            settings,
        )
    }
}
