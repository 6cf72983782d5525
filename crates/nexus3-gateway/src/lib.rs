//! NEXUS3 gateway: the Agent Pool (C12), RPC Dispatcher (C13) and HTTP
//! Server (C14) that sit on top of nexus3-session and expose it over the
//! network.

pub mod error;
pub mod pool;
pub mod rpc;
pub mod server;

pub use error::{GatewayError, Result};
pub use pool::{AgentHandle, AgentPool, AgentPoolConfig, AgentSummary, PromptLoader, RegistryBuilder, StaticPromptLoader};
pub use rpc::{Dispatcher, GlobalDispatcher, RpcResult};
pub use server::{ServerConfig, ServerHandle};
