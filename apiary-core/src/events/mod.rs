//! Session events and the bus that carries them

pub mod bus;
pub mod memory;
pub mod types;

pub use bus::{EventBus, EventSeq};
pub use memory::MemoryEventBus;
pub use types::{SessionEvent, SessionEventEnvelope};
