// Data models for the platform API wire format

pub mod envelope;

pub use envelope::{Envelope, RefreshRequest, RefreshedTokens};
