pub mod config;
pub mod error;
pub mod guidance;
pub mod policy;
pub mod state;
pub mod story;
