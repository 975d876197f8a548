//! A single image build of one commit, plus the container started from it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};

use crate::schema::builds;

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} value: {value:?}")]
pub struct InvalidStatus {
    kind: &'static str,
    value: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 5] = [
        BuildStatus::Pending,
        BuildStatus::Running,
        BuildStatus::Success,
        BuildStatus::Failed,
        BuildStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| InvalidStatus {
                kind: "build status",
                value: s.to_string(),
            })
    }
}

impl ToSql<Text, Pg> for BuildStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Pg> for BuildStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(value.parse()?)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    None,
    Starting,
    Running,
    Stopped,
    Error,
}

impl ContainerStatus {
    pub const ALL: [ContainerStatus; 5] = [
        ContainerStatus::None,
        ContainerStatus::Starting,
        ContainerStatus::Running,
        ContainerStatus::Stopped,
        ContainerStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::None => "none",
            ContainerStatus::Starting => "starting",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContainerStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| InvalidStatus {
                kind: "container status",
                value: s.to_string(),
            })
    }
}

impl ToSql<Text, Pg> for ContainerStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Pg> for ContainerStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(value.parse()?)
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = builds)]
pub struct Build {
    pub id: i64,
    pub repository_id: i64,
    pub commit_id: i64,
    pub status: BuildStatus,
    pub branch_name: String,
    pub image_tag: String,
    pub logs: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub push_to_registry: bool,
    pub deploy_after_build: bool,
    pub dockerfile_path: String,
    pub dockerfile_content: Option<String>,
    pub container_port: i32,
    pub host_port: Option<i32>,
    pub container_id: String,
    pub container_status: ContainerStatus,
}

impl Build {
    /// `"{m}m {s}s"` once the build has both started and completed.
    pub fn duration(&self) -> String {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                let secs = (completed - started).num_seconds().max(0);
                format!("{}m {}s", secs / 60, secs % 60)
            }
            _ => "N/A".to_string(),
        }
    }

    /// Host URL of the running container, empty when none is running.
    pub fn container_url(&self) -> String {
        match (self.container_status, self.host_port) {
            (ContainerStatus::Running, Some(port)) => format!("http://localhost:{port}"),
            _ => String::new(),
        }
    }

    pub fn container_name(&self) -> String {
        format!("nohands-build-{}", self.id)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = builds)]
pub struct NewBuild {
    pub repository_id: i64,
    pub commit_id: i64,
    pub status: BuildStatus,
    pub branch_name: String,
    pub push_to_registry: bool,
    pub deploy_after_build: bool,
    pub dockerfile_path: String,
    pub dockerfile_content: Option<String>,
    pub container_port: i32,
}
