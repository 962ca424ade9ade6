//! LMTP (RFC 2033) server
//!
//! Address parsing, the reply catalog, DATA framing and the protocol state
//! machine, plus the two transport bindings that drive it.

pub mod address;
pub mod blocking;
pub mod codec;
pub mod envelope;
pub mod framer;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod tls;

pub use address::Address;
pub use blocking::BlockingLmtpServer;
pub use codec::{CodecError, Frame, LmtpCodec};
pub use envelope::{BodyType, Envelope, EnvelopeError};
pub use framer::{dot_stuff, FramedMessage, FramerError, MessageFramer};
pub use protocol::{Action, Response, Session, SessionConfig, State};
pub use reply::{Reply, ReplyContext};
pub use server::LmtpServer;
