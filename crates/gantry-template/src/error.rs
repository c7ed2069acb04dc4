//! Error types for gantry-template.

/// Result type alias using [`TemplateError`].
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors raised during template validation and resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// Two containers in one template share a name.
    #[error("template {template}: duplicate container name {container}")]
    DuplicateContainer {
        /// Template being validated.
        template: String,
        /// Offending container name.
        container: String,
    },

    /// A resource quantity string could not be parsed.
    #[error("template {template}: invalid quantity {value:?} for {field}")]
    InvalidQuantity {
        /// Template being validated.
        template: String,
        /// Field carrying the quantity.
        field: String,
        /// The rejected value.
        value: String,
    },

    /// The inheritance chain exceeded the resolution depth limit.
    ///
    /// This almost always means the `inherit_from` references form a cycle.
    #[error("template {template}: inheritance chain deeper than {limit} (cycle?)")]
    InheritanceDepth {
        /// Template that triggered the limit.
        template: String,
        /// The depth limit.
        limit: usize,
    },

    /// A raw YAML override fragment could not be parsed.
    #[error("template {template}: invalid yaml override: {message}")]
    InvalidOverride {
        /// Template carrying the fragment.
        template: String,
        /// Parser diagnostic.
        message: String,
    },
}
