//! Saltpeter: distributed cron. See `README.md` for the system overview —
//! a scheduler/dispatcher (`scheduler`), a machine endpoint that ingests
//! wrapper reports (`machine_endpoint`), the wrapper agent itself
//! (`wrapper`), an operator-facing UI endpoint (`ui_endpoint`), and the
//! shared state store that knits them together (`state`).

pub mod config;
pub mod machine_endpoint;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod ui_endpoint;
pub mod wrapper;

pub use state::SharedState;
pub use types::error::{SaltpeterError, SaltpeterResult};
