pub mod entities;
pub mod enums;
pub mod models;
pub mod store;

pub use store::{AssignmentView, FleetStore};
