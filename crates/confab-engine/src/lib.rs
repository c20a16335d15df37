//! # confab-engine
//!
//! Conversation state, mention parsing, invocation routing, and the agent pool.
//!
//! - **Conversation manager**: per-conversation critical section; persist, commit, publish
//! - **Mentions**: `@name` detection across separator styles
//! - **Router**: mode-driven selection of the agents that answer a message
//! - **Agent directory**: built-in catalog, custom agents, snapshot reads
//! - **Context**: one loader per scope, resolved concurrently
//! - **Pool**: invocation with timeout, history, and single-level delegation
//!
//! ## Crate Position
//!
//! Depends on: confab-core, confab-store.
//! Depended on by: confab-server.

#![deny(unsafe_code)]

pub mod agents;
pub mod context;
pub mod conversation;
pub mod error;
pub mod mentions;
pub mod pool;
pub mod router;

pub use agents::{AgentDirectory, NewCustomAgent, BUILT_IN_CATALOG};
pub use context::{ContextSources, JsonFileContextLoader, StaticContextLoader};
pub use conversation::{ConversationManager, InvocationPermit, SettingsUpdate};
pub use error::EngineError;
pub use mentions::parse_mentions;
pub use pool::{AgentPool, PoolConfig};
pub use router::route;
