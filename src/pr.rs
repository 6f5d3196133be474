//! Change-request hosting contract and option resolution.
//!
//! The engine opens, merges, and annotates change requests through
//! `PrProvider`; the hosted API behind it is not our business. Option
//! resolution follows one rule: a task override wins over the config
//! default, and an explicitly-set empty list replaces the default with
//! empty.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PrConfig;
use crate::task::Task;

/// Effective options for opening a change request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrOptions {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
}

/// Merge strategies for the `merge` completion action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

/// An opened change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pr {
    pub number: u64,
    pub url: String,
}

/// One review comment on a change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// One CI check run attached to a change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

/// Hosting contract.
#[async_trait]
pub trait PrProvider: Send + Sync {
    async fn create_pr(&self, opts: &PrOptions) -> anyhow::Result<Pr>;
    async fn merge_pr(&self, number: u64, method: MergeMethod) -> anyhow::Result<()>;
    async fn update_pr(&self, number: u64, opts: &PrOptions) -> anyhow::Result<()>;
    async fn get_pr_by_url(&self, url: &str) -> anyhow::Result<Option<Pr>>;
    async fn find_pr_by_branch(&self, branch: &str) -> anyhow::Result<Option<Pr>>;
    async fn list_pr_comments(&self, number: u64) -> anyhow::Result<Vec<PrComment>>;
    async fn create_pr_comment(&self, number: u64, body: &str) -> anyhow::Result<PrComment>;
    async fn reply_to_comment(
        &self,
        number: u64,
        comment_id: u64,
        body: &str,
    ) -> anyhow::Result<PrComment>;
    async fn get_check_runs(&self, number: u64) -> anyhow::Result<Vec<CheckRun>>;
    async fn check_auth(&self) -> anyhow::Result<()>;
}

/// Resolve effective PR options from config defaults and task overrides.
pub fn resolve_pr_options(task: &Task, config: &PrConfig, base: &str) -> PrOptions {
    let overrides = &task.pr_overrides;
    PrOptions {
        title: format!("{}: {}", task.id, task.title),
        body: task.description.clone(),
        head: task.branch.clone(),
        base: base.to_string(),
        draft: overrides.draft.unwrap_or(config.draft),
        labels: if overrides.labels_set {
            overrides.labels.clone()
        } else {
            config.labels.clone()
        },
        reviewers: if overrides.reviewers_set {
            overrides.reviewers.clone()
        } else {
            config.reviewers.clone()
        },
    }
}
