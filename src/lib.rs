pub mod common;
pub mod dropbox_session;
pub mod garmin_session;
pub mod pipeline;
pub mod session_store;
