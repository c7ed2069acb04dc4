//! Template validation.
//!
//! Validation runs before any network call so malformed configuration is
//! rejected without side effects.

use std::collections::HashSet;

use crate::error::{TemplateError, TemplateResult};
use crate::types::AgentTemplate;

const QUANTITY_SUFFIXES: &[&str] = &[
    "", "n", "u", "m", "k", "M", "G", "T", "P", "E", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei",
];

/// Validate a (resolved) template.
///
/// Checks container name uniqueness, resource quantity syntax, and that
/// every raw override fragment parses as YAML. The parsed documents are
/// discarded; overlaying happens at pod construction time.
pub fn validate(template: &AgentTemplate) -> TemplateResult<()> {
    let mut seen = HashSet::new();
    for container in &template.containers {
        if !seen.insert(container.name.as_str()) {
            return Err(TemplateError::DuplicateContainer {
                template: template.name.clone(),
                container: container.name.clone(),
            });
        }

        let fields = [
            ("request_cpu", &container.resources.request_cpu),
            ("request_memory", &container.resources.request_memory),
            ("limit_cpu", &container.resources.limit_cpu),
            ("limit_memory", &container.resources.limit_memory),
        ];
        for (field, value) in fields {
            if !value.is_empty() && !is_valid_quantity(value) {
                return Err(TemplateError::InvalidQuantity {
                    template: template.name.clone(),
                    field: format!("{}.{field}", container.name),
                    value: value.clone(),
                });
            }
        }
    }

    for fragment in &template.yaml_overrides {
        if let Err(err) = serde_yaml::from_str::<serde_yaml::Value>(fragment) {
            return Err(TemplateError::InvalidOverride {
                template: template.name.clone(),
                message: err.to_string(),
            });
        }
    }

    Ok(())
}

/// Check a Kubernetes quantity string: a decimal number followed by an
/// optional SI or binary suffix.
#[must_use]
pub fn is_valid_quantity(value: &str) -> bool {
    let suffix_start = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(suffix_start);

    if number.is_empty() || number.matches('.').count() > 1 || number == "." {
        return false;
    }

    QUANTITY_SUFFIXES.contains(&suffix)
}
