//! CLI command implementations

pub mod catalog;
pub mod maintenance;
pub mod packages;
pub mod reports;
pub mod tenant;
pub mod usage;
