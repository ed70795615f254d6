//! Error page templates and template helpers.
//!
//! Templates are plain HTML with `{{ name }}` placeholders. The variables
//! available to every error template are `status` plus the helpers
//! `site_name` (`SITE_NAME`) and `site_url` (`SERVER_NAME`).

use keel_core::config::Configuration;
use std::collections::BTreeMap;
use thiserror::Error;

/// Statuses that must have an error page.
pub const REQUIRED_STATUSES: [u16; 2] = [404, 500];

/// Template rendering failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// No template is registered for the status.
    #[error("no error template for status {0}")]
    Missing(u16),

    /// A placeholder names a variable that does not exist.
    #[error("template for status {status} uses unknown variable `{name}`")]
    UnknownVariable {
        /// Template status
        status: u16,
        /// Placeholder name
        name: String,
    },

    /// A placeholder is opened but never closed.
    #[error("template for status {0} has an unterminated placeholder")]
    Unterminated(u16),
}

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Page not found | {{ site_name }}</title></head>
<body>
<h1>{{ status }}</h1>
<p>The page you were looking for does not exist.</p>
<p><a href="//{{ site_url }}/">Back to {{ site_name }}</a></p>
</body>
</html>
"#;

const SERVER_ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Something went wrong | {{ site_name }}</title></head>
<body>
<h1>{{ status }}</h1>
<p>Something went wrong on our side. The team has been notified.</p>
<p><a href="//{{ site_url }}/">Back to {{ site_name }}</a></p>
</body>
</html>
"#;

/// Values exposed to templates besides `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateHelpers {
    values: BTreeMap<String, String>,
}

impl TemplateHelpers {
    /// The `site_name` and `site_url` helpers, empty when unset.
    #[must_use]
    pub fn from_config(config: &Configuration) -> Self {
        let mut helpers = Self::default();
        helpers.insert("site_name", config.get_string("SITE_NAME").unwrap_or_default());
        helpers.insert("site_url", config.get_string("SERVER_NAME").unwrap_or_default());
        helpers
    }

    /// Add or replace a helper.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Look up a helper.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Error page templates keyed by status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTemplates {
    templates: BTreeMap<u16, String>,
}

impl Default for ErrorTemplates {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(404, NOT_FOUND_PAGE.to_string());
        templates.insert(500, SERVER_ERROR_PAGE.to_string());
        Self { templates }
    }
}

impl ErrorTemplates {
    /// No templates at all.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            templates: BTreeMap::new(),
        }
    }

    /// Add or replace the template for `status`.
    #[must_use]
    pub fn with_template(mut self, status: u16, body: impl Into<String>) -> Self {
        self.templates.insert(status, body.into());
        self
    }

    /// Whether a template exists for `status`.
    #[must_use]
    pub fn contains(&self, status: u16) -> bool {
        self.templates.contains_key(&status)
    }

    /// Check that every required status has a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Missing`] for the first absent status.
    pub fn validate(&self) -> Result<(), TemplateError> {
        REQUIRED_STATUSES
            .iter()
            .find(|status| !self.contains(**status))
            .map_or(Ok(()), |status| Err(TemplateError::Missing(*status)))
    }

    /// Render the template registered for `template`, with `status` as the
    /// `status` variable.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::Missing`] if `template` has no page
    /// - [`TemplateError::UnknownVariable`] / [`TemplateError::Unterminated`] for malformed pages
    pub fn render(
        &self,
        template: u16,
        status: u16,
        helpers: &TemplateHelpers,
    ) -> Result<String, TemplateError> {
        let source = self
            .templates
            .get(&template)
            .ok_or(TemplateError::Missing(template))?;

        let mut out = String::with_capacity(source.len());
        let mut rest = source.as_str();
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or(TemplateError::Unterminated(template))?;
            let name = after[..close].trim();

            if name == "status" {
                out.push_str(&status.to_string());
            } else {
                let value = helpers.get(name).ok_or_else(|| TemplateError::UnknownVariable {
                    status: template,
                    name: name.to_string(),
                })?;
                out.push_str(value);
            }
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
