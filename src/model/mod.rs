//! Core data model.
//!
//! A routine is a periodic status report from a device. Devices send it as a
//! protobuf [`wire::DeviceRoutine`]; the processor turns each delivery into a
//! [`RoutineEvent`] with a freshly generated id before persisting it.

pub mod routine;
pub mod wire;

pub use routine::{DeviceStatus, ReportedStatus, RoutineEvent};
pub use wire::DeviceRoutine;
