pub mod agent;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod provider;
