//! Ownership and refresh of the current [crate::ProjectConfig].

pub mod manager;
pub mod manager_builders;
pub mod requester;
pub mod requester_builders;
