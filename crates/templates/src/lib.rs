//! Config template catalog: versioned, typed sources for sandbox config
//! injection. Templates are validated on create/update and again when a
//! container references them during creation.

pub mod store;
pub mod types;
pub mod validate;

pub use {
    store::TemplateStore,
    types::{ConfigTemplate, NewTemplate, TemplateKind, TemplatePatch},
    validate::validate_content,
};
