//! Web server for deep-link verification
//!
//! A challenge's link button opens `/verify/{token}`, which sends the member
//! through Discord OAuth so the callback knows who is making the attempt.

mod oauth;
mod server;

pub use oauth::OAuthState;
pub use server::{start_web_server, AppState};
