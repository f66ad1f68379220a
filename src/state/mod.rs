pub mod model;
pub mod rotation;
pub mod store;

pub use model::{Activity, DeviceState, Room, Session, StaffState, StudentState, SupervisorAssignment};
pub use rotation::RotationPhase;
pub use store::StateStore;
