//! Ancestor-chain resolution.
//!
//! A template may name ancestor templates via `inherit_from`. Resolution
//! recursively resolves each ancestor, folds them left-to-right with
//! [`combine`], then combines the accumulated parent with the template
//! itself. Resolution is idempotent: a template flagged `resolved` is
//! returned unchanged.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{TemplateError, TemplateResult};
use crate::merge::combine;
use crate::types::AgentTemplate;

/// All templates known to a backend, keyed by name.
pub type TemplateMap = HashMap<String, AgentTemplate>;

/// Upper bound on inheritance chain depth.
///
/// `inherit_from` cycles are not otherwise detectable; the limit turns a
/// cycle into an error instead of unbounded recursion.
pub const MAX_INHERIT_DEPTH: usize = 16;

/// Resolve a template against the set of known templates.
///
/// `defaults` optionally names an implicit defaults-provider template that
/// is treated as the first ancestor of the top-level template. Unknown
/// ancestor names are skipped with a warning.
pub fn resolve(
    template: &AgentTemplate,
    all: &TemplateMap,
    defaults: Option<&str>,
) -> TemplateResult<AgentTemplate> {
    resolve_at(template, all, defaults, 0)
}

fn resolve_at(
    template: &AgentTemplate,
    all: &TemplateMap,
    defaults: Option<&str>,
    depth: usize,
) -> TemplateResult<AgentTemplate> {
    if template.resolved {
        return Ok(template.clone());
    }
    if depth > MAX_INHERIT_DEPTH {
        return Err(TemplateError::InheritanceDepth {
            template: template.name.clone(),
            limit: MAX_INHERIT_DEPTH,
        });
    }

    let chain: Vec<&str> = defaults
        .into_iter()
        .filter(|name| *name != template.name)
        .chain(template.inherit_from.iter().map(String::as_str))
        .collect();

    let mut accumulated: Option<AgentTemplate> = None;
    for ancestor_name in chain {
        let Some(ancestor) = all.get(ancestor_name) else {
            warn!(
                template = %template.name,
                ancestor = %ancestor_name,
                "unknown ancestor template, skipping"
            );
            continue;
        };

        let resolved_ancestor = resolve_at(ancestor, all, None, depth + 1)?;
        accumulated = Some(match accumulated {
            None => resolved_ancestor,
            Some(parent) => combine(&parent, &resolved_ancestor),
        });
    }

    Ok(match accumulated {
        None => {
            let mut resolved = template.clone();
            resolved.resolved = true;
            resolved
        }
        Some(parent) => combine(&parent, template),
    })
}
