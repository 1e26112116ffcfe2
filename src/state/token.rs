use poise::serenity_prelude::UserId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TOKEN_PREFIX: &str = "verify_";

/// Deep-link payload naming the member a verify attempt targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyToken {
    pub member_id: UserId,
}

impl VerifyToken {
    pub fn new(member_id: UserId) -> Self {
        Self { member_id }
    }

    /// Pull a token out of free text such as `/start verify_123`, `start verify_123` or `verify_123`
    pub fn find_in(text: &str) -> Option<Self> {
        text.split_whitespace().find_map(|word| word.parse().ok())
    }
}

impl fmt::Display for VerifyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TOKEN_PREFIX, self.member_id)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not a verification token")]
pub struct InvalidToken;

impl FromStr for VerifyToken {
    type Err = InvalidToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|rest| rest.parse::<u64>().ok())
            .filter(|id| *id != 0)
            .ok_or(InvalidToken)?;

        Ok(Self::new(UserId::new(id)))
    }
}
