//! Reply generators: the Anthropic Messages API and a scripted mock.

pub mod converter;
pub mod mock;
pub mod models;
pub mod provider;

pub use mock::{MockGenerator, MockReply};
pub use provider::{AnthropicConfig, AnthropicGenerator};
