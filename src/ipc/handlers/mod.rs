pub mod attendance;
pub mod auth;
pub mod core;
pub mod qr;
pub mod students;
