pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod session;

pub use errors::{ClientError, StreamErrorReason};
pub use events::StreamEvent;
pub use ids::{CallId, MessageId, SessionId};
pub use messages::{Message, MessagePart, Role};
pub use session::{Applied, SessionPhase, SessionState};
