//! Forge API Client (C2)
//!
//! Talks to the hosted forge's REST surface: listing queued runs and jobs,
//! minting JIT runner credentials, and checking repository admin access.

mod client;
mod errors;
mod types;

pub use client::ForgeClient;
pub use errors::{ForgeError, ForgeResult};
pub use types::{JitCredential, QueuedJob, QueuedRun};
