//! Build pipeline: the recipe as an ordered list of (instruction, cache key)
//! pairs.

pub mod cache_key;
pub mod context;
pub mod instruction;
pub mod stage;

use serde::Serialize;

pub use cache_key::CacheKey;
pub use context::{BuildContext, ContextEntry};
pub use instruction::Instruction;
pub use stage::{BuildProgress, BuildStage};

use crate::recipe::BuildRecipe;

/// One step of a planned build.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub instruction: Instruction,
    pub cache_key: CacheKey,
    /// Digest of the step's external input; empty when the instruction text
    /// alone determines the result.
    pub input_digest: String,
}

impl PlannedStep {
    pub fn stage(&self) -> BuildStage {
        self.instruction.stage()
    }
}

/// Serializable view of a planned step, used for `plan` output.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStepSummary {
    pub step: usize,
    pub stage: BuildStage,
    pub instruction: String,
    pub cache_key: CacheKey,
    pub produces_layer: bool,
}

/// The full ordered plan for one build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    steps: Vec<PlannedStep>,
}

impl BuildPlan {
    /// Chain cache keys over the recipe's instructions.
    ///
    /// `base_digest` is the resolved base manifest digest.
    pub fn new(recipe: &BuildRecipe, base_digest: &str, context: &BuildContext) -> Self {
        let mut steps: Vec<PlannedStep> = Vec::with_capacity(BuildStage::ALL.len());

        for instruction in recipe.instructions() {
            let input_digest = match instruction.stage() {
                BuildStage::BaseSelected => base_digest.to_string(),
                BuildStage::ManifestCopied => context.manifest_digest().to_string(),
                BuildStage::PayloadCopied => context.payload_digest().to_string(),
                _ => String::new(),
            };

            let parent = steps.last().map(|s| &s.cache_key);
            let cache_key = CacheKey::derive(parent, &instruction.cache_text(), &input_digest);

            steps.push(PlannedStep {
                instruction,
                cache_key,
                input_digest,
            });
        }

        Self { steps }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn step(&self, stage: BuildStage) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.stage() == stage)
    }

    /// Key of the terminal step; identifies the whole build.
    pub fn final_key(&self) -> Option<&CacheKey> {
        self.steps.last().map(|s| &s.cache_key)
    }

    pub fn summaries(&self) -> Vec<PlannedStepSummary> {
        self.steps
            .iter()
            .map(|s| PlannedStepSummary {
                step: s.stage().step_number(),
                stage: s.stage(),
                instruction: s.instruction.to_string(),
                cache_key: s.cache_key.clone(),
                produces_layer: s.instruction.produces_layer(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(root: &std::path::Path, recipe: &BuildRecipe) -> BuildContext {
        BuildContext::scan(root, recipe).unwrap()
    }

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("requirements.txt"), "pandas==2.2.2\n").unwrap();
        std::fs::write(temp.path().join("streamlit_app.py"), "import pandas\n").unwrap();
        temp
    }

    #[test]
    fn test_plan_has_nine_ordered_steps() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let plan = BuildPlan::new(&recipe, "sha256:base", &scan(temp.path(), &recipe));

        let stages: Vec<BuildStage> = plan.steps().iter().map(|s| s.stage()).collect();
        assert_eq!(stages, BuildStage::ALL.to_vec());
        assert_eq!(plan.final_key(), Some(&plan.steps()[8].cache_key));
    }

    #[test]
    fn test_identical_inputs_identical_keys() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let a = BuildPlan::new(&recipe, "sha256:base", &scan(temp.path(), &recipe));
        let b = BuildPlan::new(&recipe, "sha256:base", &scan(temp.path(), &recipe));
        for (x, y) in a.steps().iter().zip(b.steps()) {
            assert_eq!(x.cache_key, y.cache_key);
        }
    }

    #[test]
    fn test_payload_change_keeps_install_key() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let before = BuildPlan::new(&recipe, "sha256:base", &scan(temp.path(), &recipe));

        std::fs::write(temp.path().join("streamlit_app.py"), "import numpy\n").unwrap();
        let after = BuildPlan::new(&recipe, "sha256:base", &scan(temp.path(), &recipe));

        for stage in BuildStage::ALL {
            let same = before.step(stage).unwrap().cache_key == after.step(stage).unwrap().cache_key;
            assert_eq!(same, stage < BuildStage::PayloadCopied, "{stage}");
        }
    }

    #[test]
    fn test_base_change_invalidates_everything() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let context = scan(temp.path(), &recipe);
        let a = BuildPlan::new(&recipe, "sha256:one", &context);
        let b = BuildPlan::new(&recipe, "sha256:two", &context);
        for (x, y) in a.steps().iter().zip(b.steps()) {
            assert_ne!(x.cache_key, y.cache_key);
        }
    }

    #[test]
    fn test_summaries_flag_layer_steps() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let plan = BuildPlan::new(&recipe, "sha256:base", &scan(temp.path(), &recipe));
        let layered: Vec<usize> = plan
            .summaries()
            .iter()
            .filter(|s| s.produces_layer)
            .map(|s| s.step)
            .collect();
        assert_eq!(layered, vec![3, 4, 5, 6]);
    }
}
