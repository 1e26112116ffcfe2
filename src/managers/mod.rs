pub mod expiry_sweeper;
pub mod permission_checker;
pub mod verification_manager;

pub use expiry_sweeper::ExpirySweeper;
pub use permission_checker::run_startup_permission_check;
pub use verification_manager::{create_shared_verification_manager, JoiningMember, Reply};
