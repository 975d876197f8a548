//! A connected Git remote (or local path) that builds are made from.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::repositories;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = repositories)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub description: String,
    pub default_branch: String,
    pub dockerfile_path: String,
    pub is_active: bool,
    pub github_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// Docker image name derived from the repository name.
    pub fn image_name(&self) -> String {
        image_name(&self.name)
    }
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = repositories)]
pub struct NewRepository {
    pub name: String,
    pub url: String,
    pub description: String,
    pub default_branch: String,
    pub dockerfile_path: String,
    pub is_active: bool,
    pub github_id: String,
}

/// Lowercased, with spaces replaced by `-`.
pub fn image_name(repository_name: &str) -> String {
    repository_name.to_lowercase().replace(' ', "-")
}

/// Names are used in cache directories and image names, so they must not
/// look like paths.
pub fn check_name(name: &str) -> Result<(), String> {
    if name.contains(['/', '\\'])
        || name.contains("..")
        || name.starts_with('.')
        || name.chars().any(char::is_control)
    {
        return Err(format!(
            "Invalid repository name '{name}': must not contain '/', '\\' or '..', or start with '.'"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_is_docker_friendly() {
        assert_eq!(image_name("My Web App"), "my-web-app");
        assert_eq!(image_name("service"), "service");
    }

    #[test]
    fn path_like_names_are_rejected() {
        for name in ["../../victim", "a/b", "a\\b", "..", ".hidden", "x..y", "tab\tname"] {
            assert!(check_name(name).is_err(), "{name:?} accepted");
        }
        for name in ["web", "My Web App", "api-v2.1", "team_service"] {
            assert!(check_name(name).is_ok(), "{name:?} rejected");
        }
    }
}
