pub mod synchronizer;

pub use synchronizer::{LoadState, MessageSynchronizer, ReceiveOutcome};
