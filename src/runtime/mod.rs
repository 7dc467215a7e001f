//! Runtime Module - plan application
//!
//! Contains the apply-time components:
//! - `control_plane`: the provisioning backend seam and an in-memory backend
//! - `runner`: dependency-driven concurrent application of a `Plan`
//!
//! For static structure, see the `plan` and `dag` modules.

mod control_plane;
mod runner;

pub use control_plane::{
    ControlPlane, ControlPlaneError, InMemoryControlPlane, ProvisionReceipt, ProvisionRequest,
    RecordedCall,
};
pub use runner::{ApplyReport, NodeState, Runner, RunnerSettings};
