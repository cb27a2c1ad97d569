//! Safe memory reclamation for the lock-free and optimistic sets.

pub mod hazard;

pub use hazard::HazardManager;
