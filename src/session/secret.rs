//! Placeholder substitution and redaction for job secrets.
//!
//! Commands are written with `${NAME}` placeholders. The placeholder form is
//! what gets logged; the expanded form only exists in the payload sent over
//! the wire.

use std::env;
use std::fmt;

use tracing::warn;

/// Environment variable carrying the runner's just-in-time configuration.
pub const JIT_CONFIG_ENV: &str = "ACTIONS_RUNNER_INPUT_JITCONFIG";

const REDACTED: &str = "***";

/// Named secret values substituted into command templates.
#[derive(Clone, Default)]
pub struct Secrets {
    entries: Vec<(String, String)>,
}

impl Secrets {
    /// Creates an empty secret set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` under `name`, replacing any earlier value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let key = name.into();
        self.entries.retain(|(existing, _)| *existing != key);
        self.entries.push((key, value.into()));
        self
    }

    /// Reads each named variable from the environment. Unset variables
    /// expand to an empty string.
    #[must_use]
    pub fn from_env(names: &[&str]) -> Self {
        names.iter().fold(Self::new(), |secrets, name| {
            let value = env::var(name).unwrap_or_else(|_| {
                warn!(variable = name, "secret variable is not set");
                String::new()
            });
            secrets.with(*name, value)
        })
    }

    /// Replaces every `${NAME}` placeholder with its secret value.
    #[must_use]
    pub fn expand(&self, template: &str) -> String {
        self.entries
            .iter()
            .fold(template.to_owned(), |text, (name, value)| {
                text.replace(&placeholder(name), value)
            })
    }

    /// Masks every non-empty secret value occurring in `text`.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.entries
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .fold(text.to_owned(), |masked, (_, value)| {
                masked.replace(value.as_str(), REDACTED)
            })
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Renders the placeholder used for `name` inside command templates.
#[must_use]
pub fn placeholder(name: &str) -> String {
    format!("${{{name}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> Secrets {
        Secrets::new().with(JIT_CONFIG_ENV, "s3cr3t-token")
    }

    #[test]
    fn expand_substitutes_placeholders() {
        let template = "run.sh --jitconfig \"${ACTIONS_RUNNER_INPUT_JITCONFIG}\"";
        assert_eq!(
            secrets().expand(template),
            "run.sh --jitconfig \"s3cr3t-token\""
        );
    }

    #[test]
    fn expand_leaves_unknown_placeholders() {
        assert_eq!(secrets().expand("echo ${OTHER}"), "echo ${OTHER}");
    }

    #[test]
    fn redact_masks_values() {
        assert_eq!(
            secrets().redact("registered with s3cr3t-token ok"),
            "registered with *** ok"
        );
    }

    #[test]
    fn empty_values_are_not_redacted() {
        let empty = Secrets::new().with("EMPTY", "");
        assert_eq!(empty.redact("unchanged"), "unchanged");
    }

    #[test]
    fn later_values_replace_earlier_ones() {
        let replaced = secrets().with(JIT_CONFIG_ENV, "fresh");
        assert_eq!(replaced.expand("${ACTIONS_RUNNER_INPUT_JITCONFIG}"), "fresh");
    }

    #[test]
    fn debug_lists_names_only() {
        let rendered = format!("{:?}", secrets());
        assert!(rendered.contains(JIT_CONFIG_ENV));
        assert!(!rendered.contains("s3cr3t-token"));
    }
}
