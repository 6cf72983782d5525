//! Session Storage (C7), Markdown/Raw Writers (C8), Log Multiplexer (C9),
//! the Session agent loop (C10), and Session Persistence (C11): everything
//! that owns one agent's durable state and the loop that drives it.

pub mod compaction;
pub mod error;
pub mod fs_guard;
pub mod log_mux;
pub mod markdown;
pub mod persistence;
pub mod raw;
pub mod session;
pub mod storage;

pub use compaction::run_compaction;
pub use error::{Result, SessionError};
pub use log_mux::LogMultiplexer;
pub use markdown::MarkdownWriter;
pub use persistence::SessionPersistence;
pub use raw::{RawEntry, RawWriter};
pub use session::{
    AutoDenyConfirmation, ConfirmationProvider, NoopObserver, Session, SessionConfig, SessionObserver,
    ITERATION_LIMIT_SENTINEL, MAX_TOOL_ITERATIONS,
};
pub use storage::{EventRow, MessageRow, SessionStorage};
