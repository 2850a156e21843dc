//! Outbox and inbox rows, and the rules for moving them between states.

mod id;
mod inbox;
mod outbox;
mod status;

pub use id::MessageId;
pub use inbox::{InboxChange, InboxMessage};
pub use outbox::{OutboxChange, OutboxMessage};
pub use status::{MessageStatus, StatusCounts};
