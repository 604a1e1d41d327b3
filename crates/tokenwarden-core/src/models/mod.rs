//! Data models shared between the session store and the dashboard API.

pub mod user;

pub use user::UserSummary;
