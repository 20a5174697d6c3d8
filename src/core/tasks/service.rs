use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::{
    AgentTask, DocumentType, PromptData, STATUS_COMPLETED, STATUS_FAILED, STATUS_PROCESSING,
    TaskFilter, TaskStatus, TaskUsage, can_transition,
};
use crate::core::cache::{self, Cache};
use crate::core::error::{StoryError, StoryResult};
use crate::core::events::{DomainEvent, EventSink};
use crate::core::queue::TaskQueue;
use crate::core::store::DocumentStore;

/// Owns every status change of an [`AgentTask`].
#[derive(Clone)]
pub struct TaskService {
    store: Arc<DocumentStore>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn Cache>,
    events: Arc<dyn EventSink>,
}

fn cache_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

impl TaskService {
    pub fn new(
        store: Arc<DocumentStore>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn Cache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            events,
        }
    }

    fn changed(&self, task: &AgentTask) {
        self.cache.invalidate_tags(&[
            cache::task_tag(&task.id),
            cache::project_tag(&task.project_id),
        ]);
        self.events.emit(DomainEvent::TaskChanged {
            project_id: task.project_id.clone(),
            task_id: task.id.clone(),
            status: task.status,
        });
    }

    async fn publish(&self, task_id: &str) -> StoryResult<()> {
        self.queue.publish(task_id).await.map_err(|e| {
            warn!("Task {} left pending, publish failed: {}", task_id, e);
            StoryError::QueueUnavailable(format!("task {} is pending but not queued: {}", task_id, e))
        })
    }

    /// Persist a pending task, then queue its id. When the publish fails the
    /// task stays pending and can be re-queued with [`TaskService::reset`].
    pub async fn create(
        &self,
        project_id: &str,
        document_type: DocumentType,
        document_id: &str,
        prompt: &PromptData,
        metadata: BTreeMap<String, String>,
    ) -> StoryResult<AgentTask> {
        let task = self
            .store
            .insert_task(project_id, document_type, document_id, prompt, &metadata)
            .await?;
        info!(
            "Created task {} ({} for {})",
            task.id,
            document_type.as_str(),
            document_id
        );
        self.changed(&task);
        self.publish(&task.id).await?;
        Ok(task)
    }

    /// Cached read. The entry is checked against the row's status stamp, so
    /// a transition made by a worker in another process is seen at once.
    pub async fn find(&self, task_id: &str) -> StoryResult<Option<AgentTask>> {
        let Some(stamp) = self.store.task_stamp(task_id).await? else {
            return Ok(None);
        };
        let key = cache_key(task_id);
        if let Some(task) = cache::get_stamped::<AgentTask>(self.cache.as_ref(), &key, &stamp) {
            return Ok(Some(task));
        }
        let task = self.store.get_task(task_id).await?;
        if let Some(task) = &task {
            cache::set_stamped(
                self.cache.as_ref(),
                &key,
                &stamp,
                task,
                &[cache::task_tag(task_id), cache::project_tag(&task.project_id)],
            );
        }
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> StoryResult<AgentTask> {
        self.find(task_id)
            .await?
            .ok_or_else(|| StoryError::not_found("task", task_id))
    }

    pub async fn list(&self, filter: &TaskFilter) -> StoryResult<Vec<AgentTask>> {
        self.store.list_tasks(filter).await
    }

    async fn reload(&self, task_id: &str) -> StoryResult<AgentTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoryError::not_found("task", task_id))
    }

    fn check(&self, task: &AgentTask, to: TaskStatus) -> StoryResult<()> {
        if can_transition(task.status, to) {
            Ok(())
        } else {
            Err(StoryError::InvalidTransition {
                from: task.status.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Move a task into `processing`. A missing task is logged and yields
    /// `None`; queue redelivery is the only retry.
    pub async fn begin_processing(&self, task_id: &str) -> StoryResult<Option<AgentTask>> {
        let Some(task) = self.store.get_task(task_id).await? else {
            warn!("Task {} not found, nothing to process", task_id);
            return Ok(None);
        };
        self.check(&task, TaskStatus::Processing)?;
        if task.status == TaskStatus::Processing {
            warn!("Task {} was already processing; taking it over", task_id);
        }
        let moved = self
            .store
            .transition_task(
                task_id,
                task.status,
                TaskStatus::Processing,
                Some(STATUS_PROCESSING),
            )
            .await?;
        let current = self.reload(task_id).await?;
        if !moved {
            return Err(StoryError::InvalidTransition {
                from: current.status.to_string(),
                to: TaskStatus::Processing.to_string(),
            });
        }
        self.changed(&current);
        Ok(Some(current))
    }

    /// Success path: record usage and move `processing` -> `completed`.
    pub async fn complete(&self, task_id: &str, usage: &TaskUsage) -> StoryResult<AgentTask> {
        let task = self.reload(task_id).await?;
        self.check(&task, TaskStatus::Completed)?;
        if !self
            .store
            .complete_task(task_id, task.status, STATUS_COMPLETED, usage)
            .await?
        {
            let current = self.reload(task_id).await?;
            return Err(StoryError::InvalidTransition {
                from: current.status.to_string(),
                to: TaskStatus::Completed.to_string(),
            });
        }
        let done = self.reload(task_id).await?;
        info!(
            "Task {} completed: {} in / {} out tokens, {} ms",
            task_id, usage.input_tokens_used, usage.output_tokens_used, usage.process_time_ms
        );
        self.changed(&done);
        Ok(done)
    }

    /// Failure path: keep `processing_at`, capture the error text.
    pub async fn fail(&self, task_id: &str, error: &str) -> StoryResult<AgentTask> {
        let task = self.reload(task_id).await?;
        self.check(&task, TaskStatus::Failed)?;
        if !self
            .store
            .fail_task(task_id, task.status, STATUS_FAILED, error)
            .await?
        {
            let current = self.reload(task_id).await?;
            return Err(StoryError::InvalidTransition {
                from: current.status.to_string(),
                to: TaskStatus::Failed.to_string(),
            });
        }
        let failed = self.reload(task_id).await?;
        warn!("Task {} failed: {}", task_id, error);
        self.changed(&failed);
        Ok(failed)
    }

    /// Return a task to `pending` from any state, clear its results and
    /// queue it again.
    pub async fn reset(&self, task_id: &str) -> StoryResult<AgentTask> {
        if !self.store.reset_task(task_id).await? {
            return Err(StoryError::not_found("task", task_id));
        }
        let task = self.reload(task_id).await?;
        info!("Task {} reset to pending", task_id);
        self.changed(&task);
        self.publish(task_id).await?;
        Ok(task)
    }

    /// Remove a task in any state. Returns false when it did not exist.
    pub async fn delete(&self, task_id: &str) -> StoryResult<bool> {
        let Some(task) = self.store.get_task(task_id).await? else {
            warn!("Task {} not found, nothing to delete", task_id);
            return Ok(false);
        };
        let removed = self.store.delete_task(task_id).await?;
        self.cache.invalidate_tags(&[
            cache::task_tag(task_id),
            cache::project_tag(&task.project_id),
        ]);
        if removed {
            info!("Task {} deleted", task_id);
            self.events.emit(DomainEvent::TaskDeleted {
                project_id: task.project_id,
                task_id: task_id.to_string(),
            });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryCache;
    use crate::core::events::{BroadcastSink, NullSink};
    use crate::core::queue::{Delivery, SqliteTaskQueue};
    use crate::core::store::test_store;
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownQueue;

    #[async_trait]
    impl TaskQueue for DownQueue {
        async fn publish(&self, _task_id: &str) -> StoryResult<()> {
            Err(StoryError::QueueUnavailable("broker offline".to_string()))
        }
        async fn receive(&self, _lease: Duration) -> StoryResult<Option<Delivery>> {
            Ok(None)
        }
        async fn ack(&self, _delivery: &Delivery) -> StoryResult<()> {
            Ok(())
        }
        async fn nack(&self, _delivery: &Delivery) -> StoryResult<()> {
            Ok(())
        }
    }

    fn prompt() -> PromptData {
        PromptData {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_input_tokens: 1000,
            max_output_tokens: 200,
            system_role: "You are a novelist.".to_string(),
            prompt_text: "Continue the story.".to_string(),
        }
    }

    async fn setup() -> (TaskService, Arc<SqliteTaskQueue>, Arc<MemoryCache>) {
        let store = Arc::new(test_store());
        let queue = Arc::new(SqliteTaskQueue::new(store.get_db(), "agent_tasks").await.unwrap());
        let cache = Arc::new(MemoryCache::new());
        let service = TaskService::new(store, queue.clone(), cache.clone(), Arc::new(NullSink));
        (service, queue, cache)
    }

    async fn create(service: &TaskService) -> AgentTask {
        service
            .create("p1", DocumentType::StoryText, "doc-1", &prompt(), BTreeMap::new())
            .await
            .unwrap()
    }

    fn usage() -> TaskUsage {
        TaskUsage {
            input_tokens_used: 10,
            output_tokens_used: 20,
            process_time_ms: 30,
            agent_results: "The end.".to_string(),
            agent_id: "host:1:abcd".to_string(),
        }
    }

    #[tokio::test]
    async fn create_queues_the_task_id() {
        let (service, queue, _) = setup().await;
        let task = create(&service).await;
        assert_eq!(task.status, TaskStatus::Pending);
        let delivery = queue.receive(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(delivery.task_message().unwrap().task_id, task.id);
    }

    #[tokio::test]
    async fn publish_failure_leaves_a_recoverable_pending_task() {
        let store = Arc::new(test_store());
        let service = TaskService::new(
            store.clone(),
            Arc::new(DownQueue),
            Arc::new(MemoryCache::new()),
            Arc::new(NullSink),
        );
        let err = service
            .create("p1", DocumentType::StoryText, "doc-1", &prompt(), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::QueueUnavailable(_)));

        let pending = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn happy_path_records_accounting() {
        let (service, _, _) = setup().await;
        let task = create(&service).await;
        let processing = service.begin_processing(&task.id).await.unwrap().unwrap();
        assert_eq!(processing.status, TaskStatus::Processing);
        assert_eq!(processing.status_message.as_deref(), Some(STATUS_PROCESSING));
        assert!(processing.processing_at.is_some());

        let done = service.complete(&task.id, &usage()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.status_message.as_deref(), Some("Completed request"));
        assert_eq!(done.input_tokens_used, Some(10));
        assert_eq!(done.agent_results.as_deref(), Some("The end."));
        assert_eq!(done.agent_id.as_deref(), Some("host:1:abcd"));
    }

    #[tokio::test]
    async fn pending_task_cannot_complete_directly() {
        let (service, _, _) = setup().await;
        let task = create(&service).await;
        let err = service.complete(&task.id, &usage()).await.unwrap_err();
        assert!(matches!(err, StoryError::InvalidTransition { .. }));
        let still = service.get(&task.id).await.unwrap();
        assert!(still.input_tokens_used.is_none());
    }

    #[tokio::test]
    async fn failure_keeps_processing_timestamp() {
        let (service, _, _) = setup().await;
        let task = create(&service).await;
        service.begin_processing(&task.id).await.unwrap();
        let failed = service.fail(&task.id, "storage exploded").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.errors.as_deref(), Some("storage exploded"));
        assert!(failed.processing_at.is_some());
        assert!(failed.agent_results.is_none());

        let err = service.begin_processing(&task.id).await.unwrap_err();
        assert!(matches!(err, StoryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn missing_task_begin_is_a_logged_noop() {
        let (service, _, _) = setup().await;
        assert!(service.begin_processing("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_clears_everything_from_any_state() {
        let (service, queue, _) = setup().await;
        let completed = create(&service).await;
        service.begin_processing(&completed.id).await.unwrap();
        service.complete(&completed.id, &usage()).await.unwrap();

        let failed = create(&service).await;
        service.begin_processing(&failed.id).await.unwrap();
        service.fail(&failed.id, "boom").await.unwrap();

        let processing = create(&service).await;
        service.begin_processing(&processing.id).await.unwrap();

        let pending = create(&service).await;

        while let Some(d) = queue.receive(Duration::from_secs(60)).await.unwrap() {
            queue.ack(&d).await.unwrap();
        }

        for id in [&completed.id, &failed.id, &processing.id, &pending.id] {
            let reset = service.reset(id).await.unwrap();
            assert_eq!(reset.status, TaskStatus::Pending);
            assert!(reset.status_message.is_none());
            assert!(reset.input_tokens_used.is_none());
            assert!(reset.output_tokens_used.is_none());
            assert!(reset.agent_results.is_none());
            assert!(reset.agent_id.is_none());
            assert!(reset.errors.is_none());
            assert!(reset.processing_at.is_none());
        }
        assert_eq!(queue.depth().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn reset_unknown_task_is_not_found() {
        let (service, _, _) = setup().await;
        assert!(service.reset("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cached_reads_see_transitions() {
        let (service, _, cache) = setup().await;
        let task = create(&service).await;
        assert_eq!(service.get(&task.id).await.unwrap().status, TaskStatus::Pending);
        assert!(!cache.is_empty());
        service.begin_processing(&task.id).await.unwrap();
        assert_eq!(
            service.get(&task.id).await.unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn cached_reads_see_writes_made_through_another_cache() {
        let store = Arc::new(test_store());
        let queue = Arc::new(SqliteTaskQueue::new(store.get_db(), "agent_tasks").await.unwrap());
        let reader = TaskService::new(
            store.clone(),
            queue.clone(),
            Arc::new(MemoryCache::new()),
            Arc::new(NullSink),
        );
        let writer = TaskService::new(store, queue, Arc::new(MemoryCache::new()), Arc::new(NullSink));

        let task = create(&reader).await;
        assert_eq!(reader.get(&task.id).await.unwrap().status, TaskStatus::Pending);
        writer.begin_processing(&task.id).await.unwrap();
        writer.complete(&task.id, &usage()).await.unwrap();
        let polled = reader.get(&task.id).await.unwrap();
        assert_eq!(polled.status, TaskStatus::Completed);
        assert_eq!(polled.output_tokens_used, Some(20));

        writer.reset(&task.id).await.unwrap();
        assert_eq!(reader.get(&task.id).await.unwrap().status, TaskStatus::Pending);
        writer.delete(&task.id).await.unwrap();
        assert!(reader.find(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_emits_and_removes() {
        let store = Arc::new(test_store());
        let queue = Arc::new(SqliteTaskQueue::new(store.get_db(), "agent_tasks").await.unwrap());
        let sink = Arc::new(BroadcastSink::new(16));
        let mut rx = sink.subscribe();
        let service = TaskService::new(store, queue, Arc::new(MemoryCache::new()), sink);
        let task = create(&service).await;

        assert!(service.delete(&task.id).await.unwrap());
        assert!(!service.delete(&task.id).await.unwrap());
        assert!(service.get(&task.id).await.unwrap_err().is_not_found());

        let mut saw_delete = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DomainEvent::TaskDeleted { .. }) {
                saw_delete = true;
            }
        }
        assert!(saw_delete);
    }
}
