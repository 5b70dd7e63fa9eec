pub mod channel;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod index;
pub mod models;
pub mod resolver;
pub mod session;
pub mod store;
pub mod sync;
pub mod tracing_setup;

// Re-export the session surface at crate root for convenience
pub use config::CoreConfig;
pub use error::SyncError;
pub use events::CoreEvent;
pub use session::{ChatSession, DispatchedSend, PendingSend, SendOutcome};
