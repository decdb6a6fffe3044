//! Prompt Templates
//!
//! Prompts live as `*.md` files in the prompts directory and are keyed by
//! file stem. Placeholders are written `{name}`.

use anyhow::Context;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const LESSON_PROMPT: &str = "lesson_content";
pub const VISUALIZATION_PROMPT: &str = "visualization";

#[derive(Debug, Clone, Default)]
pub struct Prompts {
    templates: HashMap<String, String>,
}

impl Prompts {
    /// Loads every `*.md` file in `prompts_path`.
    pub fn load(prompts_path: &Path) -> anyhow::Result<Self> {
        let mut templates = HashMap::new();
        let entries = fs::read_dir(prompts_path)
            .with_context(|| format!("Could not read prompts directory {}", prompts_path.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
                let prompt_key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context("Could not get file stem")?
                    .to_string();
                let content = fs::read_to_string(&path)?;
                templates.insert(prompt_key, content);
            }
        }
        Ok(Self { templates })
    }

    pub fn from_templates(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    /// Fails when any of `keys` has no template.
    pub fn require(&self, keys: &[&str]) -> anyhow::Result<()> {
        for key in keys {
            if !self.templates.contains_key(*key) {
                anyhow::bail!("{key}.md not found in prompts directory");
            }
        }
        Ok(())
    }

    /// Fills `{name}` placeholders of template `key`.
    pub fn render(&self, key: &str, values: &[(&str, &str)]) -> anyhow::Result<String> {
        let template = self
            .templates
            .get(key)
            .with_context(|| format!("Prompt '{key}' is not loaded"))?;
        Ok(values
            .iter()
            .fold(template.clone(), |text, (name, value)| {
                text.replace(&format!("{{{name}}}"), value)
            }))
    }
}
