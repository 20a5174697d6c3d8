mod chain;
mod service;
pub mod types;

pub use chain::VersionChain;
pub use service::{
    DocumentService, GenerationOptions, MIN_SEGMENT_LENGTH, MIN_TITLE_SOURCE_LENGTH,
    SUGGESTED_TITLE_KEY,
};
pub use types::{ChainScope, DocumentKind, DocumentVersion, VersionDraft, VersionType};
