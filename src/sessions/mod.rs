//! Session state: the in-memory store, the per-session folder on disk, and publishing.

pub mod files;
pub mod publish;
pub mod store;

pub use files::{SessionFile, SessionFileError, TRANSCRIPT_FILE};
pub use publish::{PublishFailure, PublishOutcome, Publisher};
pub use store::{DefaultProvider, Message, SessionRecord, SessionStore, StoreError, UserId};
