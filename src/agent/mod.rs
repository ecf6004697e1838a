//! Agent subsystem: the subprocess client (C3) and the conversational
//! session wrapper on top of it (C4).

pub mod session;
pub mod subprocess;

pub use session::{AgentSession, SessionState};
pub use subprocess::{AgentEvent, AgentSubprocessClient, ExecuteOptions, ExecuteResult};
