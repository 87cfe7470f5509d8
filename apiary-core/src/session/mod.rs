//! Session management

pub mod policy;
pub mod reaper;
pub mod registry;
pub mod state;

// Re-export key types for convenience
pub use policy::SessionPolicy;
pub use reaper::spawn_reaper;
pub use registry::{ConnectGate, Connected, REJECTIONS_BEFORE_REMOVAL, SessionRegistry, SharedSession};
pub use state::{ActiveConnection, Reservation, Session, SessionId, SessionInfo, TabId, Teardown};
