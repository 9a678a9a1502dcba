mod controller;
mod store;
mod types;

pub use controller::{ModeController, TransitionKind, sync_on_startup};
pub use store::{FileStatusStore, MemoryStatusStore, StatusStore};
pub use types::*;
