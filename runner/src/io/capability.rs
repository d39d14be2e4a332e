//! Capability definitions: named prompt templates plus tool budgets.
//!
//! On disk a capability is `<dir>/<name>.md`:
//!
//! ```text
//! +++
//! description = "Security review"
//! allowed_tools = ["Read", "Grep"]
//! max_turns = 8
//! +++
//! Review the following diff for PR #{{ key }}:
//!
//! {{ payload }}
//! ```
//!
//! The front matter is optional TOML; the body is a minijinja template
//! rendered with `key`, `capability` and `payload`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::types::{CapabilityOptions, RunRequest};

const FRONT_MATTER_FENCE: &str = "+++";

/// A resolved capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub template: String,
    pub options: CapabilityOptions,
}

impl Capability {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            options: CapabilityOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CapabilityOptions) -> Self {
        self.options = options;
        self
    }

    /// Render the prompt for `request`.
    pub fn render_prompt(&self, request: &RunRequest) -> Result<String> {
        let env = Environment::new();
        let rendered = env
            .render_str(
                &self.template,
                context! {
                    key => request.key,
                    capability => self.name.as_str(),
                    payload => request.payload.as_str(),
                },
            )
            .with_context(|| format!("render capability {}", self.name))?;
        Ok(rendered)
    }
}

/// Source of capability definitions.
pub trait CapabilityProvider: Send + Sync {
    fn load(&self, name: &str) -> Result<Capability>;

    /// Names of every capability this provider can load, sorted.
    fn discover(&self) -> Result<Vec<String>>;
}

/// Loads capabilities from markdown files in a directory.
#[derive(Debug, Clone)]
pub struct FileCapabilityProvider {
    dir: PathBuf,
}

impl FileCapabilityProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CapabilityProvider for FileCapabilityProvider {
    fn load(&self, name: &str) -> Result<Capability> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(anyhow!("invalid capability name {name:?}"));
        }
        let path = self.dir.join(format!("{name}.md"));
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let (options, template) =
            parse_definition(&contents).with_context(|| format!("parse {}", path.display()))?;
        debug!(capability = name, tools = options.allowed_tools.len(), "loaded capability");
        Ok(Capability {
            name: name.to_string(),
            template: template.to_string(),
            options,
        })
    }

    fn discover(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Err(anyhow!(
                "capabilities dir {} does not exist",
                self.dir.display()
            ));
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.dir).max_depth(1) {
            let entry = entry.with_context(|| format!("walk {}", self.dir.display()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Split optional `+++` TOML front matter from the template body.
fn parse_definition(contents: &str) -> Result<(CapabilityOptions, &str)> {
    let Some(rest) = contents.strip_prefix(FRONT_MATTER_FENCE) else {
        return Ok((CapabilityOptions::default(), contents));
    };
    let rest = rest.trim_start_matches(['\r', '\n']);
    let end = rest
        .find(&format!("\n{FRONT_MATTER_FENCE}"))
        .ok_or_else(|| anyhow!("unterminated front matter"))?;
    let options: CapabilityOptions =
        toml::from_str(&rest[..end]).context("parse front matter toml")?;
    let body = &rest[end + 1 + FRONT_MATTER_FENCE.len()..];
    Ok((options, body.trim_start_matches(['\r', '\n'])))
}
