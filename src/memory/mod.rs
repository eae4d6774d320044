//! Agent Memory System
//!
//! Working memory per context, retention and persistence, and episodic recall.

pub mod governor;
pub mod vector;
pub mod working;

pub use governor::{MemoryGovernor, RetentionConfig};
pub use vector::{Episode, InMemoryVectorStore, VectorStore};
pub use working::{EpisodicMemory, MemorySizes, WorkingMemory};
