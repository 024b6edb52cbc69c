pub mod checkpoints;
pub mod pull;
