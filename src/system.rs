//! Host capability checks
//!
//! Before touching the kernel the tool makes sure that:
//!
//! - it runs with an effective UID of 0
//! - the iptables program can be found
//! - the program actually starts and answers `--version`
//!
//! # Environment Variables
//!
//! - `IPTABLES_COMPOSE_IPTABLES`: iptables program to run, either a name
//!   looked up in `PATH` or an absolute path. Useful for `iptables-legacy`
//!   hosts and for test harnesses.
//!
//! Packagers can bake in a different default by setting
//! `IPTABLES_COMPOSE_SYSTEM_IPTABLES` at compile time.

use crate::core::executor::{CommandRunner, Iptables};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Runtime override for the iptables program
pub const IPTABLES_ENV: &str = "IPTABLES_COMPOSE_IPTABLES";

/// Program used when nothing overrides it
pub const DEFAULT_IPTABLES: &str = match option_env!("IPTABLES_COMPOSE_SYSTEM_IPTABLES") {
    Some(program) => program,
    None => "iptables",
};

/// Why the host cannot run iptables for us
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SystemError {
    #[error("This program must be run as root (current effective UID: {uid})")]
    NotRoot { uid: u32 },

    #[error("'{program}' not found (PATH={path})")]
    ToolMissing { program: String, path: String },

    #[error("'{program}' could not be executed: {reason}")]
    ToolNotExecutable { program: String, reason: String },
}

/// iptables program to run: the environment override, else the built-in default
pub fn iptables_program() -> String {
    std::env::var(IPTABLES_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IPTABLES.to_string())
}

/// Resolves a program the way `execvp` would: paths are taken as given,
/// bare names are searched in `PATH`
pub fn find_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return path.is_file().then(|| path.to_path_buf());
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(name);
            if full_path.is_file() {
                Some(full_path)
            } else {
                None
            }
        })
    })
}

/// What the capability check needs to know about the host
pub trait HostProbe {
    fn effective_uid(&self) -> u32;

    fn find_program(&self, name: &str) -> Option<PathBuf>;
}

/// The machine we are running on
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl HostProbe for LocalHost {
    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        find_program(name)
    }
}

/// Verifies root, tool presence and that the tool runs.
///
/// # Errors
///
/// Returns the first [`SystemError`] that applies.
pub fn check_host<H: HostProbe, R: CommandRunner>(
    host: &H,
    iptables: &Iptables<R>,
) -> Result<(), SystemError> {
    let uid = host.effective_uid();
    if uid != 0 {
        return Err(SystemError::NotRoot { uid });
    }

    let program = iptables.program();
    let Some(path) = host.find_program(program) else {
        return Err(SystemError::ToolMissing {
            program: program.to_string(),
            path: std::env::var("PATH").unwrap_or_default(),
        });
    };
    debug!("Using {}", path.display());

    let result = iptables.check_tool();
    if !result.success {
        let reason = match result.stderr.trim() {
            "" => match result.exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            },
            stderr => stderr.to_string(),
        };
        return Err(SystemError::ToolNotExecutable {
            program: program.to_string(),
            reason,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{ENV_VAR_MUTEX, FakeHost, MockRunner};

    #[test]
    fn test_find_program() {
        // sh should exist on all Unix systems
        assert!(find_program("sh").is_some());
        assert!(find_program("iptables_compose_nonexistent_binary_xyz").is_none());
        assert!(find_program("/nonexistent/dir/iptables").is_none());
    }

    #[test]
    fn test_find_program_absolute_path() {
        assert!(find_program("/bin/sh").is_some());
        assert!(find_program("/nonexistent/iptables").is_none());
    }

    #[test]
    fn test_program_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var(IPTABLES_ENV, "/usr/sbin/iptables-legacy");
        }
        assert_eq!(iptables_program(), "/usr/sbin/iptables-legacy");

        unsafe {
            std::env::set_var(IPTABLES_ENV, "  ");
        }
        assert_eq!(iptables_program(), DEFAULT_IPTABLES);

        unsafe {
            std::env::remove_var(IPTABLES_ENV);
        }
        assert_eq!(iptables_program(), DEFAULT_IPTABLES);
    }

    #[test]
    fn test_check_host_not_root() {
        let ipt = Iptables::new(MockRunner::new(), "iptables");
        let err = check_host(&FakeHost::user(1000), &ipt).unwrap_err();
        assert_eq!(err, SystemError::NotRoot { uid: 1000 });
        assert!(err.to_string().contains("1000"));
        // Nothing was spawned
        assert!(ipt.runner().commands().is_empty());
    }

    #[test]
    fn test_check_host_tool_missing() {
        let ipt = Iptables::new(MockRunner::new(), "iptables");
        let err = check_host(&FakeHost::root_without_tool(), &ipt).unwrap_err();
        assert!(matches!(err, SystemError::ToolMissing { ref program, .. } if program == "iptables"));
    }

    #[test]
    fn test_check_host_tool_broken() {
        let runner = MockRunner::new().fail_when("--version", 126, "permission denied");
        let ipt = Iptables::new(runner, "iptables");
        let err = check_host(&FakeHost::root(), &ipt).unwrap_err();
        assert_eq!(
            err,
            SystemError::ToolNotExecutable {
                program: "iptables".to_string(),
                reason: "permission denied".to_string(),
            }
        );
    }

    #[test]
    fn test_check_host_ok() {
        let ipt = Iptables::new(MockRunner::new(), "iptables");
        assert!(check_host(&FakeHost::root(), &ipt).is_ok());
        assert_eq!(ipt.runner().commands(), ["iptables --version"]);
    }
}
