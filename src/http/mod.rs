//! HTTP request/response model and the network transport.

pub mod client;
pub mod error;
pub mod types;

pub use client::{HttpTransport, Transport};
pub use error::SyncError;
pub use types::{Destination, Headers, Method, Request, Response};
