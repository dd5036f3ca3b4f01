pub mod control_plane;
pub mod fleet;
pub mod inventory;

pub use control_plane::ControlPlane;
pub use fleet::Fleet;
pub use inventory::{Inventory, InventoryError, InventoryReport};
