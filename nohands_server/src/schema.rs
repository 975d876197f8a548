//! Diesel table definitions.
//!
//! Tables: repositories, branches, commits, builds.

diesel::table! {
    repositories (id) {
        id -> Int8,
        name -> Varchar,
        url -> Varchar,
        description -> Text,
        default_branch -> Varchar,
        dockerfile_path -> Varchar,
        is_active -> Bool,
        github_id -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    branches (id) {
        id -> Int8,
        repository_id -> Int8,
        name -> Varchar,
        commit_sha -> Varchar,
        last_updated -> Timestamptz,
    }
}

diesel::table! {
    commits (id) {
        id -> Int8,
        repository_id -> Int8,
        branch_id -> Nullable<Int8>,
        sha -> Varchar,
        message -> Text,
        author -> Varchar,
        author_email -> Varchar,
        committed_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    builds (id) {
        id -> Int8,
        repository_id -> Int8,
        commit_id -> Int8,
        status -> Varchar,
        branch_name -> Varchar,
        image_tag -> Varchar,
        logs -> Text,
        error_message -> Text,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        push_to_registry -> Bool,
        deploy_after_build -> Bool,
        dockerfile_path -> Varchar,
        dockerfile_content -> Nullable<Text>,
        container_port -> Int4,
        host_port -> Nullable<Int4>,
        container_id -> Varchar,
        container_status -> Varchar,
    }
}

diesel::joinable!(branches -> repositories (repository_id));
diesel::joinable!(commits -> repositories (repository_id));
diesel::joinable!(commits -> branches (branch_id));
diesel::joinable!(builds -> repositories (repository_id));
diesel::joinable!(builds -> commits (commit_id));

diesel::allow_tables_to_appear_in_same_query!(repositories, branches, commits, builds);
