//! Skill Registry (C6): a name→factory map producing `Skill` instances
//! whose `execute` is always reached through a validated wrapper, plus the
//! built-in skills (file I/O, shell, search) and the `nexus_*` pool-control
//! skills that let one agent drive another through the HTTP/JSON-RPC
//! surface.

pub mod builtin;
pub mod cancel_wait;
pub mod registry;
pub mod services;

pub use registry::{Skill, SkillFactory, SkillRegistry};
pub use services::ServicesBag;
