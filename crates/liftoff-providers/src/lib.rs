pub mod checkmate;
pub mod github;
pub mod github_actions;
pub mod jenkins;
pub mod jira;
pub mod slack;
pub mod store;
