pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod logging;
pub mod plugin;
pub mod registry;
pub mod state;
pub mod stream;
pub mod web;

#[cfg(test)]
pub mod test_utils;
