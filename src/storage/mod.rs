//! Storage engines.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  traits.rs      - EventStore contract, SaveHooks, JSON lines │
//! │  memory.rs      - DashMap engine (default L1)                │
//! │  sql.rs         - SQLite/MySQL engine via sqlx (default L2)  │
//! │  sql_filter.rs  - Filter → parameterized WHERE clause        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod sql;
pub mod sql_filter;
pub mod traits;

pub use memory::MemoryStore;
pub use sql::SqlStore;
