pub mod coordinator;
pub mod engine;
pub mod event_bus;
pub mod goals;
pub mod guards;
pub mod loop_control;
pub mod memory;
pub mod signals;
pub mod state;
