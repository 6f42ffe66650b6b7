pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

pub use config::{EngineConfig, TimeoutConfig};
pub use error::{SyncError, SyncResult};
pub use types::*;
