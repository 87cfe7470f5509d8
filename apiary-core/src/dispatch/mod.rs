//! Command dispatch table shared by server routing and client calls

pub mod args;
mod command;
mod envelope;

pub use command::{Command, HttpMethod, ResolvedRoute, Route};
pub use envelope::{Envelope, Failure};
