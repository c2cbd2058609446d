// Session module
// Owns the credential pair and tenant id, and the logout signal

mod types;
mod store;
mod sqlite;
mod invalidator;

pub use invalidator::{SessionEvent, SessionInvalidator};
pub use sqlite::SqliteSessionStore;
pub use store::{MemorySessionStore, SessionStore};
pub use types::Session;
