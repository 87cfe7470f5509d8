//! Connection lifecycle

mod controller;

pub use controller::ConnectionController;
