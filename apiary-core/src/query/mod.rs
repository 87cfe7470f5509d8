//! Statement execution and cancelable operations

pub mod engine;
pub mod operation;

pub use engine::{QueryEngine, TransactionStep};
pub use operation::{CancelOutcome, CancelableOperation, OperationId, OperationKind};
