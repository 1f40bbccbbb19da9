//! Template rendering context and the secrets capability

use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

static SECRET_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{\s*secrets\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}$")
        .expect("secret reference pattern is valid")
});

/// Variables available when instantiating step templates for a job
///
/// Keys are flat: `matrix.python`, `pipeline.name`, `job.name`, and bare
/// names for pipeline-level variables.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    variables: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Replace every `{{ key }}` placeholder
    ///
    /// Fails on the first placeholder that has no value, so a job never runs
    /// with a half-rendered command.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match self.variables.get(key) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    caps[0].to_string()
                }
            }
        });

        if let Some(key) = missing {
            anyhow::bail!("Unresolved placeholder '{{{{ {} }}}}' in '{}'", key, template);
        }
        Ok(rendered.into_owned())
    }
}

/// Check whether a string mentions a secret anywhere
pub fn mentions_secret(text: &str) -> bool {
    PLACEHOLDER
        .captures_iter(text)
        .any(|caps| caps[1].starts_with("secrets."))
}

/// Parse a value that consists of exactly one secret reference
pub fn parse_secret_reference(value: &str) -> Option<String> {
    SECRET_REFERENCE
        .captures(value.trim())
        .map(|caps| caps[1].to_string())
}

/// An opaque secret value; never printed by `Debug`
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value at the process boundary
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Replace occurrences of any secret value with `***`
pub fn mask_secrets(text: &str, secrets: &[Secret]) -> String {
    let mut masked = text.to_string();
    for secret in secrets {
        if !secret.0.is_empty() {
            masked = masked.replace(&secret.0, "***");
        }
    }
    masked
}

/// Resolves secret references to values
pub trait SecretStore: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Secret>;
}

/// Secrets read from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn resolve(&self, name: &str) -> Option<Secret> {
        std::env::var(name).ok().map(Secret::new)
    }
}

/// Fixed set of secrets
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, Secret>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), Secret::new(value));
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn resolve(&self, name: &str) -> Option<Secret> {
        self.secrets.get(name).cloned()
    }
}
