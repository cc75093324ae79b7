//! Command templates for external platform tooling.
//!
//! The compute platform and the routing layer are driven through
//! operator-supplied argv templates such as
//! `["kubectl", "-n", "{namespace}", "scale", "deployment/{service}-{slot}", "--replicas={replicas}"]`.
//! Placeholders are substituted per argument; the process inherits the
//! caller's environment, which is where platform credentials live.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CutoverError, CutoverResult};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder regex"));

/// Values available to a template, keyed by placeholder name.
pub type TemplateVars = BTreeMap<&'static str, String>;

/// An argv template. The first element is the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    /// Substitute every `{name}` placeholder. Unknown names are a config error.
    pub fn render(&self, vars: &TemplateVars) -> CutoverResult<Vec<String>> {
        if self.0.is_empty() {
            return Err(CutoverError::Config("empty command template".to_string()));
        }
        self.0.iter().map(|arg| render_str(arg, vars)).collect()
    }

    /// Render and run the command, returning trimmed stdout.
    ///
    /// A non-zero exit status becomes a `Backend` error carrying stderr.
    pub async fn run(&self, vars: &TemplateVars) -> CutoverResult<String> {
        let argv = self.render(vars)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CutoverError::Config("empty command template".to_string()))?;

        debug!(%program, ?args, "running platform command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CutoverError::Backend(format!("failed to execute '{program}': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            return Err(CutoverError::Backend(format!(
                "'{program}' exited with code {code}: {}",
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Substitute placeholders in a single string.
pub fn render_str(template: &str, vars: &TemplateVars) -> CutoverResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = vars.get(name.as_str()).ok_or_else(|| {
            CutoverError::Config(format!(
                "unknown placeholder '{{{}}}' in '{template}'",
                name.as_str()
            ))
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}
