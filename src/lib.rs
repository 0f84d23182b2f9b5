// Kickstart - curiosity-driven sensorimotor curriculum trainer
// Library exports

pub mod config;
pub mod errors;
pub mod model; // Representation/policy model boundary
pub mod sim; // Environments, agents and episode seeding
pub mod training; // Batched episodes, scheduling and checkpoints
