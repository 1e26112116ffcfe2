pub mod general;
pub mod verification;

pub use general::{help, ping};
pub use verification::start;
