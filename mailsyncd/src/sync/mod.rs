pub mod activity;
pub mod backoff;
pub mod controller;
pub mod records;
pub mod resume;
pub mod session;
pub mod session_store;
pub mod status;
pub mod terminate;
