//! iptables execution
//!
//! Every kernel change goes through [`Iptables`], which wraps a
//! [`CommandRunner`]. Operations return a [`CommandResult`] instead of
//! failing: the caller decides whether a failed command aborts the pipeline
//! (apply) or is collected and reported at the end (removal, reset).
//!
//! Tests swap [`SystemRunner`] for a scripted runner to check the exact
//! command sequence without touching the host firewall.

use crate::core::error::{Error, Result};
use crate::core::lower::{IptablesCommand, Table, shell_escape};
use crate::core::model::Policy;
use std::process::Command;
use tracing::{debug, error};

/// Outcome of one spawned command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    /// `None` when the process could not be spawned or was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Shell-escaped command line, for diagnostics
    pub command: String,
}

impl CommandResult {
    /// Result for a command that never ran
    pub fn spawn_failure(command: String, err: &std::io::Error) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: err.to_string(),
            command,
        }
    }

    /// Turns a failed result into [`Error::Iptables`].
    ///
    /// # Errors
    ///
    /// Returns the error when `success` is false.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }

        let detail = self
            .stderr
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map_or_else(
                || match self.exit_code {
                    Some(code) => format!("command exited with status {code}"),
                    None => "command terminated by signal or failed to start".to_string(),
                },
                ToString::to_string,
            );

        Err(Error::Iptables {
            message: format!("{detail} (command: {})", self.command),
            command: self.command,
            stderr: (!self.stderr.is_empty()).then_some(self.stderr),
            exit_code: self.exit_code,
        })
    }
}

/// Spawns a program and captures its output
pub trait CommandRunner {
    /// Runs `program` with `args` to completion.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the process could not be spawned.
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandResult>;
}

/// Runs commands on the host with separate stdout and stderr pipes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandResult> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            command: command_line(program, args),
        })
    }
}

/// Shell-escaped `program arg...`
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_escape)
        .collect::<Vec<_>>()
        .join(" ")
}

/// iptables front end over a [`CommandRunner`]
#[derive(Debug, Clone)]
pub struct Iptables<R> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> Iptables<R> {
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs one command. Spawn failures are folded into the result.
    pub fn execute(&self, cmd: &IptablesCommand) -> CommandResult {
        let line = command_line(&self.program, &cmd.args);
        debug!("Running: {line}");

        let result = self
            .runner
            .run(&self.program, &cmd.args)
            .unwrap_or_else(|e| CommandResult::spawn_failure(line.clone(), &e));

        if !result.success {
            error!(
                "Command failed (exit {:?}): {line}: {}",
                result.exit_code,
                result.stderr.trim()
            );
        }
        result
    }

    /// Appends a rule built by the lowerer
    pub fn append(&self, cmd: &IptablesCommand) -> CommandResult {
        self.execute(cmd)
    }

    /// Creates a custom chain. An existing chain counts as success.
    pub fn create_chain(&self, chain: &str) -> CommandResult {
        let mut result = self.execute(&IptablesCommand::new_chain(chain));
        if !result.success && result.stderr.to_lowercase().contains("chain already exists") {
            debug!("Chain {chain} already exists, reusing it");
            result.success = true;
        }
        result
    }

    pub fn set_policy(&self, chain: &str, policy: Policy) -> CommandResult {
        self.execute(&IptablesCommand::set_policy(chain, policy))
    }

    /// Flushes one chain, or every chain of the table
    pub fn flush(&self, table: Table, chain: Option<&str>) -> CommandResult {
        self.execute(&IptablesCommand::flush(table, chain))
    }

    /// Deletes one custom chain, or every custom chain of the table
    pub fn delete_chain(&self, table: Table, chain: Option<&str>) -> CommandResult {
        self.execute(&IptablesCommand::delete_chain(table, chain))
    }

    /// Lists a chain with line numbers (`-L <chain> -n --line-numbers`)
    pub fn list_numbered(&self, table: Table, chain: &str) -> CommandResult {
        self.execute(&IptablesCommand::list_numbered(table, chain))
    }

    /// Lists a table in rule-spec form (`-S`)
    pub fn list_specs(&self, table: Table) -> CommandResult {
        self.execute(&IptablesCommand::list_specs(table))
    }

    pub fn delete_rule(&self, table: Table, chain: &str, line: usize) -> CommandResult {
        self.execute(&IptablesCommand::delete_rule(table, chain, line))
    }

    /// Checks that the iptables program starts and answers `--version`
    pub fn check_tool(&self) -> CommandResult {
        let args = vec!["--version".to_string()];
        let line = command_line(&self.program, &args);
        debug!("Running: {line}");
        self.runner
            .run(&self.program, &args)
            .unwrap_or_else(|e| CommandResult::spawn_failure(line, &e))
    }
}
