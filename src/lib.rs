// Tenant Gateway - authenticated client for the platform API

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod models;
pub mod session;

pub use error::{GatewayError, RefreshError};
pub use gateway::Gateway;
pub use http_client::{RequestDescriptor, RequestExecutor, DEFAULT_REQUEST_TIMEOUT};
pub use session::{MemorySessionStore, Session, SessionEvent, SessionStore, SqliteSessionStore};
