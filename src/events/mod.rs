pub mod adapter;
pub mod guild;
pub mod message;
pub mod worker;

pub use adapter::EventAdapter;
pub use guild::handle_member_add;
pub use message::handle_message;
pub use worker::{EventSender, EventWorker};
