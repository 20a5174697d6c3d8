use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::core::budget::{Tokenizer, fit_prompt};
use crate::core::config::AppConfig;
use crate::core::documents::DocumentService;
use crate::core::error::{StoryError, StoryResult};
use crate::core::llm::{LlmManager, PromptRequest};
use crate::core::queue::{Delivery, TaskQueue};
use crate::core::tasks::{AgentTask, TaskService, TaskUsage};

/// Deliveries beyond this count are given up on and the task is failed.
pub const MAX_DELIVERY_ATTEMPTS: i64 = 5;

/// What happened to one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { task_id: String, output_tokens: i64 },
    Failed { task_id: String, error: String },
    /// Task missing, already finished, or claimed elsewhere.
    Skipped { task_id: String },
    /// Body was not a task message.
    Discarded,
}

/// `<hostname>:<pid>:<short uuid>`
pub fn worker_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", host, std::process::id(), &nonce[..8])
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub lease: Duration,
    pub poll_interval: Duration,
    pub restart_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            lease: Duration::from_secs(config.queue.lease_secs),
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
            restart_backoff: Duration::from_millis(config.worker.restart_backoff_ms),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Single-flight queue consumer: one task at a time per instance.
pub struct Worker {
    tasks: TaskService,
    documents: DocumentService,
    llm: Arc<LlmManager>,
    queue: Arc<dyn TaskQueue>,
    tokenizer: Arc<dyn Tokenizer>,
    identity: String,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        documents: DocumentService,
        llm: Arc<LlmManager>,
        queue: Arc<dyn TaskQueue>,
        tokenizer: Arc<dyn Tokenizer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            tasks: documents.tasks().clone(),
            documents,
            llm,
            queue,
            tokenizer,
            identity: worker_identity(),
            settings,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Consume forever. A failing consume loop is logged and restarted after
    /// the configured backoff; the process never exits on a handler error.
    pub async fn run(&self) -> Result<()> {
        info!("Worker {} started", self.identity);
        loop {
            if let Err(e) = self.consume().await {
                error!(
                    "Consume loop failed: {}. Restarting in {} ms",
                    e,
                    self.settings.restart_backoff.as_millis()
                );
                tokio::time::sleep(self.settings.restart_backoff).await;
            }
        }
    }

    async fn consume(&self) -> StoryResult<()> {
        loop {
            if self.process_next().await?.is_none() {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
    }

    /// Take one message, handle it and acknowledge it. `None` when the queue
    /// had nothing visible. A handler error returns the message to the queue
    /// before propagating.
    pub async fn process_next(&self) -> StoryResult<Option<Outcome>> {
        let Some(delivery) = self.queue.receive(self.settings.lease).await? else {
            return Ok(None);
        };
        match self.handle(&delivery).await {
            Ok(outcome) => {
                self.queue.ack(&delivery).await?;
                Ok(Some(outcome))
            }
            Err(e) => {
                if let Err(nack_err) = self.queue.nack(&delivery).await {
                    warn!("Could not return message {} to queue: {}", delivery.id, nack_err);
                }
                Err(e)
            }
        }
    }

    async fn handle(&self, delivery: &Delivery) -> StoryResult<Outcome> {
        let message = match delivery.task_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed message {}: {}", delivery.id, e);
                return Ok(Outcome::Discarded);
            }
        };
        let task_id = message.task_id;

        if delivery.attempts > MAX_DELIVERY_ATTEMPTS {
            let error = format!("gave up after {} deliveries", delivery.attempts - 1);
            return match self.tasks.fail(&task_id, &error).await {
                Ok(_) => Ok(Outcome::Failed { task_id, error }),
                Err(e) if e.is_not_found() || matches!(e, StoryError::InvalidTransition { .. }) => {
                    Ok(Outcome::Skipped { task_id })
                }
                Err(e) => Err(e),
            };
        }
        if delivery.attempts > 1 {
            warn!("Redelivery {} of task {}", delivery.attempts, task_id);
        }

        let task = match self.tasks.begin_processing(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(Outcome::Skipped { task_id }),
            Err(StoryError::InvalidTransition { from, .. }) => {
                info!("Task {} is already {}, skipping", task_id, from);
                return Ok(Outcome::Skipped { task_id });
            }
            Err(e) => return Err(e),
        };

        match self.generate(&task).await {
            Ok(usage) => {
                let output_tokens = usage.output_tokens_used;
                match self.tasks.complete(&task_id, &usage).await {
                    Ok(_) => Ok(Outcome::Completed {
                        task_id,
                        output_tokens,
                    }),
                    Err(e) if e.is_not_found() || matches!(e, StoryError::InvalidTransition { .. }) => {
                        warn!("Task {} changed while generating: {}", task_id, e);
                        Ok(Outcome::Skipped { task_id })
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.tasks.fail(&task_id, &error).await?;
                Ok(Outcome::Failed { task_id, error })
            }
        }
    }

    async fn generate(&self, task: &AgentTask) -> StoryResult<TaskUsage> {
        let spec = self.llm.resolve(&task.llm_model)?;
        let started = Instant::now();
        let (max_input, max_output) =
            spec.effective_limits(task.max_input_tokens, task.max_output_tokens);
        let fitted = fit_prompt(
            self.tokenizer.as_ref(),
            &task.system_role,
            &task.prompt_text,
            max_input,
        );
        if fitted.tokens_removed > 0 {
            info!(
                "Task {} prompt truncated by {} tokens to fit {}",
                task.id, fitted.tokens_removed, max_input
            );
        }

        let text = self
            .llm
            .send_prompt(&PromptRequest {
                model: &task.llm_model,
                system_role: &fitted.system_role,
                user_prompt: &fitted.prompt_text,
                max_output_tokens: max_output,
                temperature: task.temperature,
            })
            .await?;
        let output_tokens = self.tokenizer.count_tokens(&text) as i64;
        // Token counting and the provider call; writing the result is excluded.
        let process_time_ms = started.elapsed().as_millis() as i64;

        self.documents.apply_result(task, &text).await?;

        Ok(TaskUsage {
            input_tokens_used: fitted.input_tokens_used,
            output_tokens_used: output_tokens,
            process_time_ms,
            agent_results: text,
            agent_id: self.identity.clone(),
        })
    }
}
