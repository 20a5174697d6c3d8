pub mod cli;
pub mod core;
pub mod logging;

pub use crate::core::app::StoryApp;
pub use crate::core::error::{StoryError, StoryResult};
