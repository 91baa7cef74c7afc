//! Persistent storage for synchronized documents.
//!
//! ```text
//! ┌─────────────┐  committed docs  ┌──────────────┐
//! │ Provider    │ ───────────────► │ RocksStorage │
//! │ (in-memory) │ ◄─────────────── │              │
//! └─────────────┘   first access   └──────┬───────┘
//!                                         │
//!                                         ▼
//!                     ┌──────────────────────────────────┐
//!                     │ CF "documents": LZ4 snapshots    │
//!                     │ CF "metadata":  bincode meta     │
//!                     └──────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, RocksStorage, StoreConfig, StoreError};
