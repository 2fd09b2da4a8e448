//! Worker backends for Task attempts.

pub mod process;
