//! commux — distributed messaging middleware.
//!
//! Components declare typed endpoints and exchange messages, requests,
//! responses, and byte streams across heterogeneous transports through a
//! long-lived broker core running beside each component. This library
//! provides both sides: the component API ([`api`]) and the broker core
//! ([`core`]) hosted by the `commux-core` binary.

pub mod api;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod message;
pub mod observability;
pub mod predicate;
pub mod transport;

pub use api::{Endpoint, EndpointBuilder, InitOptions, Middleware};
pub use error::{Error, Result};
pub use message::{Message, Status};
pub use self::core::EndpointKind;
