pub mod api_key;
pub mod auth_cmd;
pub mod common;
pub mod completions;
pub mod records;
pub mod status;
pub mod sync;
pub mod watch;
