//! Containerfile rendering.
//!
//! The Containerfile and its `.dockerignore` together describe the same
//! image the native builder produces: labels become a `LABEL` instruction
//! and the recipe's excludes become ignore patterns.

use crate::pipeline::Instruction;
use crate::pipeline::instruction::quote_env_value;

use super::BuildRecipe;

/// Render `recipe` as an equivalent Containerfile.
///
/// Steps that do nothing for this recipe (an empty system package list) are
/// left out. Labels are emitted right before `CMD`.
pub fn render_containerfile(recipe: &BuildRecipe) -> String {
    let mut lines = vec!["# syntax=docker/dockerfile:1".to_string()];
    for instruction in recipe.instructions() {
        if matches!(instruction, Instruction::Cmd { .. })
            && let Some(label) = label_line(recipe)
        {
            lines.push(label);
        }
        lines.extend(instruction.containerfile_line());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Render the recipe's excludes as a `.dockerignore`.
///
/// A bare name is excluded at any depth, matching the native context scan;
/// a pattern with a slash is anchored at the context root.
pub fn render_dockerignore(recipe: &BuildRecipe) -> String {
    let mut out = String::from("# Generated by dockwright from the recipe excludes\n");
    for pattern in &recipe.exclude {
        let pattern = pattern.trim_matches('/');
        if pattern.is_empty() {
            continue;
        }
        out.push_str(pattern);
        out.push('\n');
        if !pattern.contains('/') {
            out.push_str(&format!("**/{pattern}\n"));
        }
    }
    out
}

fn label_line(recipe: &BuildRecipe) -> Option<String> {
    if recipe.labels.is_empty() {
        return None;
    }
    let pairs: Vec<String> = recipe
        .labels
        .iter()
        .map(|(k, v)| format!("{}={}", quote_env_value(k), quote_env_value(v)))
        .collect();
    Some(format!("LABEL {}", pairs.join(" \\\n    ")))
}
