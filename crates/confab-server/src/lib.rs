//! WebSocket front end for the conversation engine.
//!
//! Clients speak a small JSON-RPC dialect over `/ws`. Engine events flow
//! through the [`event_bridge`] into the [`hub::SyncHub`], which fans them
//! out to the clients subscribed to each conversation.

pub mod client;
pub mod dedup;
pub mod event_bridge;
pub mod handlers;
pub mod hub;
pub mod orchestrator;
pub mod rpc;
pub mod server;

pub use dedup::SeenMessages;
pub use hub::SyncHub;
pub use orchestrator::{ConversationOrchestrator, EngineOrchestrator, InvocationTarget, SendMessage, SendOutcome};
pub use server::{start, ServerConfig, ServerHandle, Services};
