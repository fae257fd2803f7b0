//! Stream transport: one authenticated, framed event stream per `open`.

pub mod auth;
pub mod frame;
pub mod handle;
pub mod http;
pub mod mock;

pub use auth::{AuthError, StaticTokenSupplier, TokenSupplier};
pub use frame::FrameDecoder;
pub use handle::{EventStream, OpenRequest, StreamHandle, StreamTransport};
pub use http::HttpTransport;
pub use mock::{OpenRecord, ScriptedOpen, ScriptedTransport};
