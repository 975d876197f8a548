//! NoHands services: git cache, repositories, builds and containers.

pub mod build_service;
pub mod container_service;
pub mod docker;
pub mod executor;
pub mod git_service;
pub mod repository_service;

/// Offset/limit window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: i64,
    pub limit: i64,
}

impl Window {
    pub const ALL: Window = Window {
        offset: 0,
        limit: i64::MAX,
    };

    pub fn first(limit: i64) -> Self {
        Window { offset: 0, limit }
    }
}
