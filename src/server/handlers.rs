//! Route handlers

pub mod detector;
pub mod health;
