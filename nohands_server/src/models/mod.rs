//! NoHands data models: repositories, branches, commits and builds.

pub mod branch;
pub mod build;
pub mod commit;
pub mod repository;
