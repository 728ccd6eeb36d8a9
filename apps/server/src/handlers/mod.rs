pub mod admin;
pub mod booking;
pub mod closures;
pub mod health;
