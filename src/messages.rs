// src/messages.rs
use poise::serenity_prelude::UserId;

use crate::managers::verification_manager::Reply;

pub fn challenge_message(member_id: UserId, name: &str, minutes: u64) -> String {
    format!(
        "👋 Hello <@{}> (**{}**)!\n\n\
        🔐 **Verification Required**\n\
        You can't send messages until you verify.\n\
        Please verify within **{}** minute(s), or you will be removed from the server.\n\n\
        Click the button below to verify.",
        member_id, name, minutes
    )
}

pub fn challenge_button_label() -> &'static str {
    "🔐 Verify"
}

pub fn welcome_notice(member_id: UserId, name: &str) -> String {
    format!(
        "✅ New member <@{}> (**{}**) passed verification. Welcome!",
        member_id, name
    )
}

pub fn timeout_notice(member_id: UserId, name: &str) -> String {
    format!(
        "⌛ New member <@{}> (**{}**) did not verify in time and has been removed.",
        member_id, name
    )
}

/// Text sent back to whoever made a verify attempt
pub fn reply_message(reply: Reply, bot_name: &str) -> String {
    match reply {
        Reply::NotFound | Reply::Expired => "⌛️ This verification has expired.".to_string(),
        Reply::NotYours => "🚫 This verification does not belong to you.".to_string(),
        Reply::Success => "✅ Verification successful! You can now chat.".to_string(),
        Reply::Unrecognized => format!("👋 Welcome to {}", bot_name),
    }
}

pub fn internal_error_message() -> String {
    "⚠️ Verification failed, please contact an administrator.".to_string()
}
