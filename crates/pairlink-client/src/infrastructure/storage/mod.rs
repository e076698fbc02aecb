//! Persistent settings adapters.
//!
//! - **`config`** – TOML file at the platform config directory.
//! - **`memory`** – In-process store for tests and ephemeral runs.

pub mod config;
pub mod memory;
