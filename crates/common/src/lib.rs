// chronicle-common: shared types and protocol for the Chronicle workspace

pub mod event;
pub mod protocol;
pub mod types;
