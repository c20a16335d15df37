//! SQLite persistence for conversations, messages, and agents.

pub mod agents;
pub mod conversations;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod store;

pub use agents::AgentRepo;
pub use conversations::ConversationRepo;
pub use database::Database;
pub use error::StoreError;
pub use store::{ConversationStore, SqliteStore};
