//! Driver/node wire protocol and the driver's node server.

pub mod codec;
pub mod message;
pub mod server;

pub use codec::MessageCodec;
pub use message::{Header, Message};
