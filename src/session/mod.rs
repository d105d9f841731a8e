//! Ingress pipeline, command completion and session lifecycle.
//!
//! - `core` - Ingress frame handling and completion rules
//! - `completion` - Cross-thread async command completion
//! - `outbound` - Attachment-aware outbound channel
//! - `rate` - Producer rate flow control

pub mod completion;
pub mod core;
pub mod outbound;
pub mod rate;

pub use self::core::*;
pub use completion::*;
pub use outbound::*;
pub use rate::*;
