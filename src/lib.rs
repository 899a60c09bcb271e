#![forbid(unsafe_code)]

pub mod classify;
pub mod cli;
pub mod discover;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod formats;
pub mod logging;
pub mod patterns;
pub mod pipeline;
pub mod store;
