use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::branches;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = branches)]
pub struct Branch {
    pub id: i64,
    pub repository_id: i64,
    pub name: String,
    pub commit_sha: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = branches)]
pub struct NewBranch {
    pub repository_id: i64,
    pub name: String,
    pub commit_sha: String,
    pub last_updated: DateTime<Utc>,
}
