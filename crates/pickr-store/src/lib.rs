//! Label tables: an in-memory store and, with the `duckdb` feature, a DuckDB one.

mod error;
mod memory;
pub use error::StoreError;
pub use memory::MemoryLabelStore;

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckLabelStore;
