//! The variable bag consumed by the template engine.
//!
//! `TemplateVars` carries everything a phase prompt can reference. Context
//! builders consume and return the bag so call sites compose contexts without
//! mutating shared state.

use std::collections::BTreeMap;

use crate::backend::{Initiative, ProjectDetection};
use crate::task::Task;

/// Default coverage threshold substituted when the detected value is zero.
pub const DEFAULT_COVERAGE_THRESHOLD: u32 = 85;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateVars {
    // Task identity
    pub task_id: String,
    pub task_title: String,
    pub task_description: String,
    pub phase: String,
    pub weight: String,
    pub iteration: u32,
    pub retry_context: String,

    // Prior-phase content
    pub research: String,
    pub spec: String,
    pub breakdown: String,
    pub tdd_tests: String,
    pub implement: String,
    pub verification: String,

    // Review stage
    pub review_round: u32,
    pub review_findings: String,

    // Worktree triple
    pub worktree_path: String,
    pub task_branch: String,
    pub target_branch: String,

    // UI-testing triple
    pub requires_ui_testing: bool,
    pub app_url: String,
    pub browser: String,

    // Initiative triple
    pub initiative_id: String,
    pub initiative_name: String,
    pub initiative_vision: String,

    // Automation triple
    pub is_automation: bool,
    pub automation_trigger: String,
    pub automation_schedule: String,

    // Detected project metadata
    pub language: String,
    pub framework: String,
    pub has_frontend: bool,
    pub test_command: String,
    pub lint_command: String,
    pub build_command: String,
    pub coverage_threshold: u32,

    pub constitution: String,
}

impl TemplateVars {
    /// Seed the bag from a task and phase.
    pub fn for_task(task: &Task, phase_id: &str, iteration: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            task_description: task.description.clone(),
            phase: phase_id.to_string(),
            weight: task.weight.to_string(),
            iteration,
            requires_ui_testing: task.requires_ui_testing,
            is_automation: task.is_automation,
            ..Default::default()
        }
    }

    pub fn with_worktree_context(
        mut self,
        worktree_path: &str,
        task_branch: &str,
        target_branch: &str,
    ) -> Self {
        self.worktree_path = worktree_path.to_string();
        self.task_branch = task_branch.to_string();
        self.target_branch = target_branch.to_string();
        self
    }

    pub fn with_initiative_context(mut self, initiative: &Initiative) -> Self {
        self.initiative_id = initiative.id.clone();
        self.initiative_name = initiative.name.clone();
        self.initiative_vision = initiative.vision.clone();
        self
    }

    pub fn with_automation_context(mut self, trigger: &str, schedule: &str) -> Self {
        self.is_automation = true;
        self.automation_trigger = trigger.to_string();
        self.automation_schedule = schedule.to_string();
        self
    }

    pub fn with_ui_testing_context(mut self, app_url: &str, browser: &str) -> Self {
        self.requires_ui_testing = true;
        self.app_url = app_url.to_string();
        self.browser = browser.to_string();
        self
    }

    pub fn with_project_detection(mut self, detection: &ProjectDetection) -> Self {
        self.language = detection.language.clone();
        self.framework = detection.framework.clone();
        self.has_frontend = detection.has_frontend;
        self.test_command = detection.test_command.clone();
        self.lint_command = detection.lint_command.clone();
        self.build_command = detection.build_command.clone();
        self
    }

    pub fn with_review_round(mut self, round: u32, findings: &str) -> Self {
        self.review_round = round;
        self.review_findings = findings.to_string();
        self
    }

    pub fn with_retry_context(mut self, context: &str) -> Self {
        self.retry_context = context.to_string();
        self
    }

    pub fn with_constitution(mut self, constitution: &str) -> Self {
        self.constitution = constitution.to_string();
        self
    }

    fn bool_str(value: bool) -> String {
        if value { "true".into() } else { String::new() }
    }

    /// Substitution map. `BTreeMap` keeps replacement order deterministic.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let coverage = if self.coverage_threshold == 0 {
            DEFAULT_COVERAGE_THRESHOLD
        } else {
            self.coverage_threshold
        };

        let mut map = BTreeMap::new();
        map.insert("TASK_ID".into(), self.task_id.clone());
        map.insert("TASK_TITLE".into(), self.task_title.clone());
        map.insert("TASK_DESCRIPTION".into(), self.task_description.clone());
        map.insert("PHASE".into(), self.phase.clone());
        map.insert("WEIGHT".into(), self.weight.clone());
        map.insert("ITERATION".into(), self.iteration.to_string());
        map.insert("RETRY_CONTEXT".into(), self.retry_context.clone());

        map.insert("RESEARCH".into(), self.research.clone());
        map.insert("SPEC".into(), self.spec.clone());
        map.insert("BREAKDOWN_CONTENT".into(), self.breakdown.clone());
        map.insert("TDD_TEST_PLAN".into(), self.tdd_tests.clone());
        map.insert("IMPLEMENT".into(), self.implement.clone());
        map.insert("VERIFICATION".into(), self.verification.clone());

        map.insert("REVIEW_ROUND".into(), self.review_round.to_string());
        map.insert("REVIEW_FINDINGS".into(), self.review_findings.clone());

        map.insert("WORKTREE_PATH".into(), self.worktree_path.clone());
        map.insert("TASK_BRANCH".into(), self.task_branch.clone());
        map.insert("TARGET_BRANCH".into(), self.target_branch.clone());

        map.insert(
            "REQUIRES_UI_TESTING".into(),
            Self::bool_str(self.requires_ui_testing),
        );
        map.insert("APP_URL".into(), self.app_url.clone());
        map.insert("BROWSER".into(), self.browser.clone());

        map.insert("INITIATIVE_ID".into(), self.initiative_id.clone());
        map.insert("INITIATIVE_NAME".into(), self.initiative_name.clone());
        map.insert("INITIATIVE_VISION".into(), self.initiative_vision.clone());

        map.insert("IS_AUTOMATION".into(), Self::bool_str(self.is_automation));
        map.insert("AUTOMATION_TRIGGER".into(), self.automation_trigger.clone());
        map.insert("AUTOMATION_SCHEDULE".into(), self.automation_schedule.clone());

        map.insert("LANGUAGE".into(), self.language.clone());
        map.insert("FRAMEWORK".into(), self.framework.clone());
        map.insert("HAS_FRONTEND".into(), Self::bool_str(self.has_frontend));
        map.insert("TEST_COMMAND".into(), self.test_command.clone());
        map.insert("LINT_COMMAND".into(), self.lint_command.clone());
        map.insert("BUILD_COMMAND".into(), self.build_command.clone());
        map.insert("COVERAGE_THRESHOLD".into(), coverage.to_string());

        map.insert("CONSTITUTION_CONTENT".into(), self.constitution.clone());
        map
    }

    /// Truthiness of a conditional block name.
    pub fn condition(&self, name: &str) -> bool {
        match name {
            "REVIEW_ROUND_1" => self.review_round == 1,
            "REVIEW_ROUND_2" => self.review_round >= 2,
            "HAS_FRONTEND" => self.has_frontend,
            "NOT_HAS_FRONTEND" => !self.has_frontend,
            "TDD_TEST_PLAN" => !self.tdd_tests.is_empty(),
            "BREAKDOWN_CONTENT" => !self.breakdown.is_empty(),
            "CONSTITUTION_CONTENT" => !self.constitution.is_empty(),
            _ => false,
        }
    }
}
