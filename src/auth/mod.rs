// Authentication module
// Refresh exchange and single-flight refresh coordination

mod coordinator;
mod refresh;

pub use coordinator::RefreshCoordinator;
pub use refresh::RefreshClient;
