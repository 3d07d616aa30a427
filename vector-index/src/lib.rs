#![allow(clippy::missing_docs_in_private_items)]

//! Per-tenant inner-product vector index with a persistent blob + sidecar
//! pair, and a bounded cache of loaded indexes with cooperative locking.

pub mod cache;
pub mod codec;
pub mod index;

pub use cache::{IndexCache, IndexWriteGuard};
pub use index::{SearchHit, VectorIndex};
