//! iptables-compose - YAML to iptables rule compiler
//!
//! Turns a YAML firewall document into an ordered sequence of iptables
//! commands and runs them, tagging every rule with a comment so the tool can
//! find and remove exactly what it created.
//!
//! # Architecture
//!
//! - [`core`] - Document model, parsing, validation, planning, lowering and execution
//! - [`validators`] - Leaf value validation (ports, MACs, CIDRs, names)
//! - [`system`] - Host capability checks (root, iptables present and working)
//! - [`orchestrator`] - Apply, remove, reset and dry-run pipelines
//!
//! # Example
//!
//! ```
//! use iptables_compose::core::document::parse_document;
//! use iptables_compose::orchestrator;
//!
//! let doc = parse_document("web:\n  ports:\n    - port: 80\n").unwrap();
//! let compiled = orchestrator::compile(&doc).unwrap();
//! let lines: Vec<String> = compiled.program.commands().map(ToString::to_string).collect();
//! assert_eq!(
//!     lines,
//!     ["-A INPUT -p tcp --dport 80 -j ACCEPT -m comment --comment YAML:web:tcp:port:80:i:any:o:any:mac:any"]
//! );
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod core;
pub mod orchestrator;
pub mod system;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::model::Document;
