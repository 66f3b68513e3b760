//! Persistence layer: durable job queue and conversation log.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::InMemoryConversations;
pub use traits::{ConversationRecord, ConversationRepository};
