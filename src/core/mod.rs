//! Core compiler functionality
//!
//! Data flows through these modules in order:
//!
//! - [`document`]: YAML text to the typed [`model`], with field-combination
//!   checks from [`rule_constraints`]
//! - [`validator`]: shadowing, redundancy and chain-reference analysis
//! - [`planner`]: chain dependency graph and creation order
//! - [`lower`]: typed rules to iptables argument vectors, tagged by [`comment`]
//! - [`executor`]: runs commands and reports structured results
//! - [`listing`]: reads kernel listings back for removal
//! - [`error`]: error types shared by all of the above

pub mod comment;
pub mod document;
pub mod error;
pub mod executor;
pub mod listing;
pub mod lower;
pub mod model;
pub mod planner;
pub mod rule_constraints;
pub mod validator;

#[cfg(test)]
pub mod test_helpers;
