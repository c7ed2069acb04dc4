//! Gantry pod templates.
//!
//! This crate holds the template data model and the hierarchical resolution
//! that merges a template with its ancestor chain:
//!
//! - **Model**: [`AgentTemplate`] and its parts ([`ContainerTemplate`],
//!   [`VolumeTemplate`], [`SecuritySpec`], ...). Templates are plain
//!   configuration data; everything here is pure and does no I/O.
//! - **Merging**: [`combine`] folds a child template onto a parent with
//!   child-wins-unless-unset semantics for scalars and override-by-key
//!   semantics for collections.
//! - **Resolution**: [`resolve`] builds the ancestor chain named by
//!   `inherit_from`, folds it left-to-right and combines the result with
//!   the template itself. Resolution is idempotent.
//! - **Validation**: [`validate`] rejects duplicate container names and
//!   malformed resource quantities before any network call is made.
//!
//! # Example
//!
//! ```
//! use gantry_template::{resolve, AgentTemplate, TemplateMap};
//!
//! let mut base = AgentTemplate::new("base");
//! base.label = "linux".to_owned();
//!
//! let mut maven = AgentTemplate::new("maven");
//! maven.inherit_from = vec!["base".to_owned()];
//!
//! let mut all = TemplateMap::new();
//! all.insert("base".to_owned(), base);
//!
//! let resolved = resolve(&maven, &all, None).unwrap();
//! assert_eq!(resolved.label, "linux");
//! assert!(resolved.resolved);
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod merge;
pub mod resolver;
pub mod types;
pub mod validate;

pub use error::{TemplateError, TemplateResult};
pub use merge::{combine, combine_container, merge_env};
pub use resolver::{resolve, TemplateMap, MAX_INHERIT_DEPTH};
pub use types::{
    normalise_mount_path, AgentTemplate, Annotation, ContainerTemplate, LivenessSpec, PortMapping,
    ResourceSpec, SecuritySpec, TemplateEnv, VolumeTemplate, UNCAPPED,
};
pub use validate::{is_valid_quantity, validate};
