use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::commits;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = commits)]
pub struct Commit {
    pub id: i64,
    pub repository_id: i64,
    pub branch_id: Option<i64>,
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Commit {
    /// First 8 characters of the SHA, also used as the image tag.
    pub fn short_sha(&self) -> &str {
        short_sha(&self.sha)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commits)]
pub struct NewCommit {
    pub repository_id: i64,
    pub branch_id: Option<i64>,
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
