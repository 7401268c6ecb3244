//! Session-owned state: the data model, the guarded state machine,
//! reservation bookkeeping, per-handler mutable context, and the
//! supervisor that wires them to a live peer connection.

pub mod context;
pub mod record;
pub mod reservation;
pub mod state_machine;
pub mod supervisor;

pub use context::SessionContext;
pub use record::Session;
pub use supervisor::{SessionSupervisor, SupervisorHandle, SupervisorOp};
