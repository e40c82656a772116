//! Command Layer
//!
//! Receives decoded frames, validates arguments, executes against the
//! store, and produces the reply. Mutating commands hand a log entry
//! to the persistence engine while the store's write lock is held.
//!
//! ```text
//! Frame ──> CommandExecutor ──> Store
//!                 │
//!                 └──> LogHandle (SET/DEL only)
//! ```

pub mod executor;

// Re-export the executor
pub use executor::CommandExecutor;
