//! Store backends
//!
//! Concrete persistence technologies are collaborator concerns; the crate
//! ships only the in-memory reference backend the tests and embedded
//! callers run against.

pub mod memory;

pub use memory::MemoryStore;
