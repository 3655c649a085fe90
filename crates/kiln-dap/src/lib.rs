//! Debug adapter for Kiln-launched JVMs.
//!
//! A [`DebugServer`](server::DebugServer) owns one debuggee for its entire
//! lifetime and speaks the Debug Adapter Protocol over TCP to at most one
//! client at a time. Reconnecting editors are supported through restart
//! handoff: a session that disconnects with restart intent leaves the
//! debuggee running, and the server keeps accepting for a grace window so
//! the next connection picks up where the old one left off.

pub mod backend;
pub mod dap;
pub mod debuggee;
pub mod error;
pub mod jdwp_port;
pub mod output;
pub mod server;
pub mod session;

pub use backend::{DebugBackend, DetachedBackend};
pub use debuggee::{Debuggee, DebuggeeHandle, DebuggeeListener, JavaDebuggee};
pub use error::{DebugError, DebugResult};
pub use output::OutputMultiplexer;
pub use server::{DebugServer, DebugServerConfig, DebugServerHandle};
