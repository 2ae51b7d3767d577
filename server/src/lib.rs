pub mod auth;
pub mod awareness;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod protocol;
pub mod pubsub;
pub mod realtime;
pub mod server;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::Config;
pub use error::SyncError;
pub use server::{AppState, ServerContext, SyncServer};
