//! Shell sessions: backends, output capture and the registry that owns them.

pub mod backend;
pub mod buffer;
pub mod pipe;
pub mod pty;
pub(crate) mod reader;
pub mod registry;

pub use backend::{Backend, BackendKind};
pub use buffer::BoundedBuffer;
pub use registry::{Created, Disposed, Session, SessionInfo, SessionRegistry};
