// src/lib.rs
pub mod config;
pub mod listener;
pub mod platform;
pub mod server;
pub mod session;
