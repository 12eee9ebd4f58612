use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::consistency::ScoringPolicy;
use crate::services::llm::LlmConfig;
use crate::services::resilience::ResilienceConfig;
use crate::services::visual::VisualStyleConfig;
use crate::services::workflow::PipelineConfig;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub scoring: ScoringPolicy,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub visual: VisualStyleConfig,

    /// Optional YAML file extending the built-in sensitive content guide.
    #[serde(default)]
    pub sensitive_guide_path: Option<String>,
}

impl Config {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path.as_ref(), content).context("Failed to write config")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scoring.pass_threshold > 100 {
            anyhow::bail!("scoring.pass_threshold must be between 0 and 100");
        }
        if self.pipeline.max_concurrency == 0 {
            anyhow::bail!("pipeline.max_concurrency must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.resilience.jitter_factor) {
            anyhow::bail!("resilience.jitter_factor must be between 0.0 and 1.0");
        }
        Ok(())
    }
}
