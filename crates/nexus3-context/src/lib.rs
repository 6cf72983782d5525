//! Context Manager (C4): bounded conversation history with structural-
//! integrity-preserving truncation, plus the pluggable Token Counter (C3)
//! and the Compaction Engine (C5) that summarizes old history via a
//! provider call the caller supplies.

pub mod compaction;
pub mod manager;
pub mod token_counter;

pub use compaction::CompactionResult;
pub use manager::{ContextConfig, ContextManager, TruncationStrategy};
pub use token_counter::{SimpleTokenCounter, TokenCounter};
