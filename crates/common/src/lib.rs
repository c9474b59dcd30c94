//! Common types shared by the codex proxy crates

mod clock;
mod error;
mod fs;
mod secret;
mod task;

pub use clock::Clock;
pub use error::{Error, Result};
pub use fs::write_private_atomic;
pub use secret::Secret;
pub use task::best_effort;
