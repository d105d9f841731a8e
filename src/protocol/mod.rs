//! Wire-level types of the AMQP 0-10 session layer.
//!
//! - `sequence` - Command-id arithmetic and range sets
//! - `frame` - Frames, methods and outbound control commands
//! - `message` - Message assembly and ingress completion
//! - `error` - Session errors and AMQP 0-10 error codes

pub mod error;
pub mod frame;
pub mod message;
pub mod sequence;

pub use error::*;
pub use frame::*;
pub use message::*;
pub use sequence::*;
