pub mod settings;

pub use settings::{Settings, WebSettings, MAX_TIMEOUT_DAYS};
