//! CLI command modules.

pub mod http;
pub mod invoke;
pub mod jobs;
pub mod status;
