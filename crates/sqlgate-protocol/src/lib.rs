pub mod auth;
pub mod backend;
pub mod error;
pub mod framer;
pub mod messages;
pub mod statement;
pub mod types;

pub use backend::BackendMessage;
pub use error::ProtocolError;
pub use framer::Framer;
pub use messages::{Message, MessageBody};
pub use statement::{Statement, StatementTracker};

#[cfg(test)]
mod tests;
