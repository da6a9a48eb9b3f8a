pub mod tracker;

pub use tracker::{
    AtomicOperation, ComprehensiveStatus, CreationStatus, OperationId, OperationTracker,
    OperationType, RollbackFn, TrackerError,
};
