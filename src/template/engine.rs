//! Deterministic prompt template rendering.
//!
//! Two constructs only: `{{VAR}}` substitution and `{{#if COND}}…{{/if}}`
//! conditional blocks. Unknown variables stay literal so a template can carry
//! placeholder text through untouched; empty values render as the empty
//! string. Conditionals resolve before substitution so a block body can still
//! reference variables.

use regex::Regex;
use std::sync::LazyLock;

use super::vars::TemplateVars;

const IF_OPEN: &str = "{{#if ";
const IF_CLOSE: &str = "{{/if}}";

static VAR_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Z0-9_]+)\}\}").expect("valid pattern"));

/// Render a template against a variable bag.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let resolved = resolve_conditionals(template, vars);
    substitute(&resolved, vars)
}

fn resolve_conditionals(template: &str, vars: &TemplateVars) -> String {
    // Innermost-first: pair each close tag with the nearest opener before it,
    // so nesting unwinds from the inside out. A dangling close tag with no
    // opener stays literal.
    let mut out = template.to_string();
    loop {
        let Some(close) = out.find(IF_CLOSE) else {
            return out;
        };
        let Some(open) = out[..close].rfind(IF_OPEN) else {
            return out;
        };
        let after_open = &out[open + IF_OPEN.len()..close];
        let Some(name_end) = after_open.find("}}") else {
            return out;
        };
        let name = &after_open[..name_end];
        let body_start = open + IF_OPEN.len() + name_end + 2;
        let body = if vars.condition(name) {
            out[body_start..close].to_string()
        } else {
            String::new()
        };
        out = format!("{}{}{}", &out[..open], body, &out[close + IF_CLOSE.len()..]);
    }
}

fn substitute(template: &str, vars: &TemplateVars) -> String {
    let map = vars.to_map();
    VAR_TOKEN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match map.get(&caps[1]) {
                Some(value) => value.clone(),
                // Unknown variables stay literal.
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, Weight};

    fn vars() -> TemplateVars {
        let task = Task::new("t-1", "Add search", Weight::Small, "orc/t-1");
        let mut v = TemplateVars::for_task(&task, "implement", 3);
        v.spec = "the spec body".into();
        v.breakdown = "step 1".into();
        v
    }

    #[test]
    fn substitutes_known_variables() {
        let out = render("Task {{TASK_ID}}: {{TASK_TITLE}} (iteration {{ITERATION}})", &vars());
        assert_eq!(out, "Task t-1: Add search (iteration 3)");
    }

    #[test]
    fn unknown_variables_stay_literal() {
        let out = render("keep {{NOT_A_VAR}} as-is, replace {{PHASE}}", &vars());
        assert_eq!(out, "keep {{NOT_A_VAR}} as-is, replace implement");
    }

    #[test]
    fn empty_values_render_empty() {
        let out = render("retry:[{{RETRY_CONTEXT}}]", &vars());
        assert_eq!(out, "retry:[]");
    }

    #[test]
    fn conditional_renders_body_iff_truthy() {
        let template = "{{#if BREAKDOWN_CONTENT}}Plan:\n{{BREAKDOWN_CONTENT}}{{/if}}end";
        assert_eq!(render(template, &vars()), "Plan:\nstep 1end");

        let mut no_breakdown = vars();
        no_breakdown.breakdown = String::new();
        assert_eq!(render(template, &no_breakdown), "end");
    }

    #[test]
    fn review_round_conditionals_select_one_branch() {
        let template = "{{#if REVIEW_ROUND_1}}find issues{{/if}}{{#if REVIEW_ROUND_2}}decide{{/if}}";
        let round1 = vars().with_review_round(1, "");
        assert_eq!(render(template, &round1), "find issues");
        let round2 = vars().with_review_round(2, "stuff");
        assert_eq!(render(template, &round2), "decide");
    }

    #[test]
    fn multiline_conditional_bodies() {
        let template = "a\n{{#if NOT_HAS_FRONTEND}}\nno ui here\n{{/if}}\nb";
        let out = render(template, &vars());
        assert!(out.contains("no ui here"));
    }

    #[test]
    fn nested_conditionals_resolve_inner_first() {
        let template =
            "{{#if BREAKDOWN_CONTENT}}outer {{#if NOT_HAS_FRONTEND}}inner{{/if}}{{/if}}";
        assert_eq!(render(template, &vars()), "outer inner");
    }

    #[test]
    fn render_is_idempotent_once_vars_are_substituted() {
        let template = "{{TASK_ID}} {{PHASE}} {{#if BREAKDOWN_CONTENT}}{{BREAKDOWN_CONTENT}}{{/if}}";
        let v = vars();
        let once = render(template, &v);
        let twice = render(&once, &v);
        assert_eq!(once, twice);
    }
}
