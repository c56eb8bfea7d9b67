#![forbid(unsafe_code)]

pub mod health;
pub mod webhook;
