pub mod browser_slot;
pub mod manager;
pub mod task;
