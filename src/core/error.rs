use crate::core::validator::WarningKind;
use crate::system::SystemError;
use std::fmt;
use thiserror::Error;

/// Core error types for iptables-compose
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid YAML or does not have the expected shape
    #[error("YAML parsing error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A document value broke a model invariant
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    /// The validator found a problem that stops the apply pipeline
    #[error("{kind} in section '{section}': {message}")]
    Blocked {
        kind: WarningKind,
        section: String,
        message: String,
    },

    /// Custom chains jump to each other in a loop
    #[error("Circular dependency detected in chain references: {}", .chains.join(" -> "))]
    CircularChainDependency { chains: Vec<String> },

    /// A rule jumps to a chain nobody declares
    #[error("Referenced chain '{name}' is not defined (referenced from '{referenced_from}')")]
    UnknownChain {
        referenced_from: String,
        name: String,
    },

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        command: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The host cannot run iptables for us
    #[error(transparent)]
    System(#[from] SystemError),

    /// Bad invocation or unusable input file
    #[error("{0}")]
    Config(String),
}

/// Where in the document a [`ValidationError`] was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Filter,
    Section,
    Chain,
}

/// First broken invariant found while building the typed model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    pub scope: Scope,
    pub section: String,
    /// Zero-based index of the offending rule within its list
    pub rule_index: Option<usize>,
    pub message: String,
}

impl ValidationError {
    pub fn new(scope: Scope, section: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope,
            section: section.into(),
            rule_index: None,
            message: message.into(),
        }
    }

    pub fn at_rule(mut self, index: usize) -> Self {
        self.rule_index = Some(index);
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Filter => write!(f, "Filter section")?,
            Scope::Section => write!(f, "Section '{}'", self.section)?,
            Scope::Chain => write!(f, "Chain definition '{}'", self.section)?,
        }
        if let Some(index) = self.rule_index {
            write!(f, " (rule #{})", index + 1)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches iptables stderr against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("you must be root")
            || lower.contains("operation not permitted")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run iptables-compose as root: sudo iptables-compose config.yaml")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another program is holding the xtables lock")
                .with_suggestion("Another firewall manager may be modifying rules right now")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables  (Arch)")
                .with_suggestion("Or point IPTABLES_COMPOSE_IPTABLES at the binary");
        }

        // Match extension not available in the kernel
        if lower.contains("couldn't load match") {
            return ErrorTranslation::new("A required iptables match extension is not available")
                .with_suggestion("MAC rules need the xt_mac module: sudo modprobe xt_mac")
                .with_suggestion("Identifier comments need xt_comment: sudo modprobe xt_comment")
                .with_suggestion("Port lists need xt_multiport: sudo modprobe xt_multiport");
        }

        // Chain already exists
        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Custom chain already exists")
                .with_suggestion("A chain with this name was created by an earlier run")
                .with_suggestion("Remove managed rules first: iptables-compose --remove-rules");
        }

        // Chain in use
        if lower.contains("too many links") || lower.contains("directory not empty") {
            return ErrorTranslation::new("Chain is still referenced or not empty")
                .with_suggestion("Delete rules jumping to the chain before deleting it")
                .with_suggestion("Flush the chain before deleting it");
        }

        // Missing chain or target
        if lower.contains("no chain/target/match by that name")
            || (lower.contains("chain") && lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Firewall chain or target not found")
                .with_suggestion("Ensure the chain exists before adding rules to it")
                .with_suggestion("Check that every referenced chain is declared in the document")
                .with_suggestion("REDIRECT needs the nat table: sudo modprobe iptable_nat");
        }

        // Rule index past the end of the chain
        if lower.contains("index of deletion too big") || lower.contains("bad rule") {
            return ErrorTranslation::new("Rule no longer exists at the expected position")
                .with_suggestion("Another program may have changed the chain concurrently")
                .with_suggestion("Run --remove-rules again");
        }

        // Port errors
        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("range")) {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("For port ranges, ensure start < end")
                .with_suggestion("Example valid ranges: 1000-2000, 8000-9000");
        }

        // Invalid address
        if (lower.contains("host/network") && lower.contains("not found"))
            || lower.contains("invalid mask")
        {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use proper IPv4 format: 192.168.1.1 or 192.168.1.0/24")
                .with_suggestion("Check CIDR notation: prefix must be between 0 and 32")
                .with_help("https://en.wikipedia.org/wiki/Classless_Inter-Domain_Routing");
        }

        // Argument parse errors
        if lower.contains("bad argument") || lower.contains("unknown option") {
            return ErrorTranslation::new("iptables rejected the rule arguments")
                .with_suggestion("Check your document for typos")
                .with_suggestion("Run with --debug to see the generated commands");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -L -n")
            .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
