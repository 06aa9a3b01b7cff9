//! Impls - port implementations.
//!
//! # Included
//! - **InMemoryItemStore**: in-process document collection for tests and demos.
//!
//! Production backends live in their own crates and implement
//! [`ItemStore`](crate::ports::ItemStore).

pub mod memory_store;

pub use self::memory_store::InMemoryItemStore;
