//! Debug Adapter Protocol plumbing: message shapes and the async
//! Content-Length framed codec used over the session socket.

pub mod codec;
pub mod messages;

pub use codec::{DapReader, DapWriter};
pub use messages::{Event, Request, Response};
