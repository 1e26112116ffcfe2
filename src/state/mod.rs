pub mod pending;
pub mod pending_store;
pub mod token;

pub use pending::{ChatRef, PendingVerification};
pub use pending_store::{create_shared_pending_store, SharedPendingStore};
pub use token::VerifyToken;
