//! The helper's RPC surface.
//!
//! [`HelperService`] owns the privileged operations; [`RpcServer`] exposes
//! them on a local Unix socket with length-delimited JSON frames, and
//! [`HelperClient`] is the matching unprivileged client.

pub mod client;
pub mod protocol;
pub mod service;
pub mod socket;

pub use client::HelperClient;
pub use protocol::{Request, RequestFrame, Response, ResponseFrame, StatusReply};
pub use service::{Caller, HelperService};
pub use socket::{RpcServer, shutdown_signal};
