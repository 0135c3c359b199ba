//! Socket listeners shared by the event listener and the log server.
//!
//! Both channels bind an endpoint before any daemon starts, accept
//! connections on a background thread, and serve each connection on its own
//! thread. Connections are tracked so a daemon's channels can be detached
//! when it stops and so shutdown can drain them.

mod errors;
mod handler;
mod listener;
mod registry;
mod stream;

pub use self::errors::ListenerError;
pub(crate) use self::handler::{ConnectionHandler, FrameItem, Served, serve_frames};
pub(crate) use self::listener::{ListenerHandle, SocketListener};
pub(crate) use self::registry::{ConnectionGuard, ConnectionRegistry};
pub(crate) use self::stream::ConnectionStream;

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
