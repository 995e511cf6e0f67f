pub mod assets;
pub mod background;
pub mod cancellation;
pub mod capability;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod eta;
pub mod index;
pub mod ingestion;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transcript;
pub mod types;
pub mod worker;

pub use capability::IndexCapability;
pub use index::SemanticIndex;
pub use protocol::{Command, Event};
pub use session::{Session, SessionState};
pub use worker::{Worker, WorkerConfig, WorkerParts, WorkerState};

pub fn init_tracing() {
    // Only log WARN and above in release builds to avoid leaking document content
    #[cfg(debug_assertions)]
    tracing_subscriber::fmt::init();
    #[cfg(not(debug_assertions))]
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();
}
