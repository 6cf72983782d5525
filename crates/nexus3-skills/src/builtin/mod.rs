//! Built-in skills: local file/shell/search primitives plus the `nexus_*`
//! pool-control skills that reach another agent over HTTP/JSON-RPC.

pub mod bash;
pub mod edit;
pub mod glob_tool;
pub mod grep;
pub mod pool;
pub mod read;
pub mod sleep;
pub mod write;
