mod service;
pub mod types;

pub use service::TaskService;
pub use types::{AgentTask, DocumentType, PromptData, TaskMessage, TaskStatus, TaskUsage};

pub use crate::core::store::TaskFilter;

pub const STATUS_PROCESSING: &str = "Processing request";
pub const STATUS_COMPLETED: &str = "Completed request";
pub const STATUS_FAILED: &str = "Request failed";

/// Forward transitions only. `reset` bypasses this table and returns any
/// state to `pending`.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match from {
        TaskStatus::Pending => matches!(to, TaskStatus::Processing),
        // Redelivery after a worker crash re-enters processing.
        TaskStatus::Processing => matches!(
            to,
            TaskStatus::Processing | TaskStatus::Completed | TaskStatus::Failed
        ),
        TaskStatus::Completed | TaskStatus::Failed => false,
    }
}
