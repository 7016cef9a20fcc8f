/// `.gitattributes` editing.
pub mod attributes;

/// Filter registration in git config and attributes.
pub mod install;

/// Staging files through their clean filter.
pub mod stage;
