//! Pipelines behind each command-line mode
//!
//! - [`apply`]: load, validate, plan and compile a document, optionally reset
//!   the kernel, then issue the commands phase by phase. The first failed
//!   command aborts; rules already appended stay in place.
//! - [`remove_rules`]: delete every rule carrying a managed comment, then
//!   the managed custom chains, then reset built-in policies to ACCEPT.
//! - [`reset`]: flush and delete chains in the filter, nat and mangle tables.
//! - [`dry_run`]: everything `apply` would do, without running anything.
//!
//! Removal and reset keep going past failed commands and report them all
//! at the end.
//!
//! Nothing in here prints. Results go back to the binary, which owns stdout
//! and stderr.

use crate::core::document::load_document;
use crate::core::error::{Error, Result};
use crate::core::executor::{CommandResult, CommandRunner, Iptables};
use crate::core::listing;
use crate::core::lower::{self, ApplyPlan, Table};
use crate::core::model::{Direction, Document, Policy};
use crate::core::planner::{self, ChainPlan};
use crate::core::validator::{self, Warning};
use std::path::Path;
use strum::IntoEnumIterator;
use tracing::{info, warn};

/// Built-in chains scanned for managed rules, per table
pub const MANAGED_SLOTS: [(Table, &str); 5] = [
    (Table::Filter, "INPUT"),
    (Table::Filter, "OUTPUT"),
    (Table::Filter, "FORWARD"),
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "POSTROUTING"),
];

/// What a successful apply did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub chains_created: usize,
    pub policies_set: usize,
    pub rules_appended: usize,
    /// Non-blocking validator findings
    pub warnings: Vec<Warning>,
}

/// What a successful removal did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub rules_deleted: usize,
    pub chains_deleted: usize,
}

/// Outcome of a dry run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRun {
    pub warnings: Vec<Warning>,
    /// Command lines in execution order, program included
    pub commands: Vec<String>,
}

/// A validated document ready to be applied
#[derive(Debug)]
pub struct Compiled<'a> {
    pub warnings: Vec<Warning>,
    pub chains: ChainPlan<'a>,
    pub program: ApplyPlan,
}

/// Validates, plans and lowers a document.
///
/// # Errors
///
/// Returns the first blocking validator finding as an error, or whatever
/// planning and lowering report.
pub fn compile(doc: &Document) -> Result<Compiled<'_>> {
    let warnings = validator::validate(doc);
    if let Some(blocking) = validator::first_blocking(&warnings) {
        return Err(blocking.clone().into_error());
    }

    let chains = planner::plan(doc)?;
    let program = lower::compile(doc, &chains)?;
    info!(
        "Compiled {} chains, {} policies, {} rules",
        program.chains.len(),
        program.policies.len(),
        program.rule_count()
    );

    Ok(Compiled {
        warnings,
        chains,
        program,
    })
}

/// Loads and compiles a document without touching the system.
///
/// # Errors
///
/// Returns load, parse and blocking validation errors.
pub fn dry_run(path: &Path, program: &str) -> Result<DryRun> {
    let doc = load_document(path)?;
    let compiled = compile(&doc)?;
    let commands = compiled
        .program
        .commands()
        .map(|cmd| format!("{program} {cmd}"))
        .collect();

    Ok(DryRun {
        warnings: compiled.warnings,
        commands,
    })
}

/// Loads a document from disk and applies it.
///
/// # Errors
///
/// See [`apply_document`].
pub fn apply<R: CommandRunner>(ipt: &Iptables<R>, path: &Path, reset_first: bool) -> Result<ApplyReport> {
    let doc = load_document(path)?;
    apply_document(ipt, &doc, reset_first)
}

/// Applies a parsed document.
///
/// Nothing is run until the document has been validated and compiled, so a
/// bad document never triggers the reset.
///
/// # Errors
///
/// Returns blocking validation errors, an aggregate reset failure, or the
/// first command that fails during the apply phases.
pub fn apply_document<R: CommandRunner>(
    ipt: &Iptables<R>,
    doc: &Document,
    reset_first: bool,
) -> Result<ApplyReport> {
    let compiled = compile(doc)?;

    if reset_first {
        reset(ipt)?;
    }

    let mut report = ApplyReport {
        warnings: compiled.warnings,
        ..ApplyReport::default()
    };

    info!("Creating {} chains", compiled.chains.creation_order().len());
    for chain in compiled.chains.creation_order() {
        ipt.create_chain(chain.name.as_str()).into_result()?;
        report.chains_created += 1;
    }

    for cmd in &compiled.program.policies {
        ipt.execute(cmd).into_result()?;
        report.policies_set += 1;
    }

    let program = &compiled.program;
    info!("Appending {} rules", program.rule_count());
    for cmd in program
        .filter_rules
        .iter()
        .chain(&program.chain_rules)
        .chain(&program.section_rules)
    {
        ipt.append(cmd).into_result()?;
        report.rules_appended += 1;
    }

    info!(
        "Applied {} chains, {} policies, {} rules",
        report.chains_created, report.policies_set, report.rules_appended
    );
    Ok(report)
}

/// Flushes every chain and deletes every custom chain in the filter, nat and
/// mangle tables.
///
/// # Errors
///
/// Returns an aggregate error after all commands ran if any failed.
pub fn reset<R: CommandRunner>(ipt: &Iptables<R>) -> Result<()> {
    info!("Resetting filter, nat and mangle tables");
    let mut failures = Vec::new();
    for table in Table::iter() {
        for result in [ipt.flush(table, None), ipt.delete_chain(table, None)] {
            if !result.success {
                failures.push(result);
            }
        }
    }
    aggregate("reset", failures)
}

/// Removes every rule and chain this tool created.
///
/// Custom chains are discovered from kernel state before any rule is deleted,
/// since the jumps into them are part of the evidence.
///
/// # Errors
///
/// Returns an aggregate error after all commands ran if any failed.
pub fn remove_rules<R: CommandRunner>(ipt: &Iptables<R>) -> Result<RemovalReport> {
    let mut report = RemovalReport::default();
    let mut failures = Vec::new();

    let specs = ipt.list_specs(Table::Filter);
    let managed = if specs.success {
        listing::managed_chains(&listing::parse_specs(&specs.stdout))
    } else {
        failures.push(specs);
        Vec::new()
    };

    for (table, chain) in MANAGED_SLOTS {
        let listed = ipt.list_numbered(table, chain);
        if !listed.success {
            failures.push(listed);
            continue;
        }
        // Bottom-up so earlier deletions don't renumber later ones
        for line in listing::managed_lines(&listed.stdout) {
            let result = ipt.delete_rule(table, chain, line);
            if result.success {
                report.rules_deleted += 1;
            } else {
                failures.push(result);
            }
        }
    }

    info!("Removing {} managed chains", managed.len());
    for chain in &managed {
        let result = ipt.flush(Table::Filter, Some(chain));
        if !result.success {
            failures.push(result);
        }
    }
    for chain in &managed {
        let result = ipt.delete_chain(Table::Filter, Some(chain));
        if result.success {
            report.chains_deleted += 1;
        } else {
            failures.push(result);
        }
    }

    for direction in Direction::iter() {
        let result = ipt.set_policy(direction.chain(), Policy::Accept);
        if !result.success {
            failures.push(result);
        }
    }

    aggregate("cleanup", failures)?;
    info!(
        "Removed {} rules and {} chains",
        report.rules_deleted, report.chains_deleted
    );
    Ok(report)
}

/// Folds the failures of a best-effort pipeline into one error
fn aggregate(stage: &str, failures: Vec<CommandResult>) -> Result<()> {
    let count = failures.len();
    let Some(first) = failures.into_iter().next() else {
        return Ok(());
    };
    warn!("{count} {stage} commands failed");

    match first.into_result() {
        Err(Error::Iptables {
            message,
            command,
            stderr,
            exit_code,
        }) => Err(Error::Iptables {
            message: format!("{count} {stage} command(s) failed; first: {message}"),
            command,
            stderr,
            exit_code,
        }),
        other => other.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{FULL_DOCUMENT, FakeKernel, MockRunner, document};

    #[test]
    fn test_apply_phase_order() {
        let ipt = Iptables::new(MockRunner::new(), "iptables");
        let doc = document(FULL_DOCUMENT);
        let report = apply_document(&ipt, &doc, false).unwrap();

        assert_eq!(report.chains_created, 2);
        assert_eq!(report.policies_set, 3);

        let commands = ipt.runner().commands();
        let position = |needle: &str| {
            commands
                .iter()
                .position(|c| c.contains(needle))
                .unwrap_or_else(|| panic!("missing {needle}"))
        };
        assert!(position("-N MAC_ETH1") < position("-N SSH_GUARD"));
        assert!(position("-N SSH_GUARD") < position("-P INPUT DROP"));
        assert!(position("-P FORWARD DROP") < position("--mac-source 00:11:22:33:44:55"));
        assert!(position("--mac-source 00:11:22:33:44:55") < position("-A MAC_ETH1"));
        assert!(position("-A SSH_GUARD -j DROP") < position("-A INPUT -p tcp --dport 80"));
        assert_eq!(commands.len(), 2 + 3 + report.rules_appended);
    }

    #[test]
    fn test_apply_aborts_on_first_append_failure() {
        let runner = MockRunner::new().fail_when("--dport 443", 1, "iptables: Resource temporarily unavailable.");
        let ipt = Iptables::new(runner, "iptables");
        let err = apply_document(&ipt, &document(FULL_DOCUMENT), false).unwrap_err();

        assert!(matches!(err, Error::Iptables { exit_code: Some(1), .. }));
        let commands = ipt.runner().commands();
        assert!(commands.last().unwrap().contains("--dport 443"));
        assert!(!commands.iter().any(|c| c.contains("multiport")));
    }

    #[test]
    fn test_cycle_fails_before_any_command() {
        let ipt = Iptables::new(MockRunner::new(), "iptables");
        let doc = document(
            r"
loop:
  chain:
    - name: A
      rules:
        g:
          interface:
            input: eth0
            chain: B
    - name: B
      rules:
        g:
          interface:
            input: eth0
            chain: A
",
        );
        let err = apply_document(&ipt, &doc, true).unwrap_err();
        match err {
            Error::CircularChainDependency { chains } => {
                assert!(chains.contains(&"A".to_string()));
                assert!(chains.contains(&"B".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert!(ipt.runner().commands().is_empty());
    }

    #[test]
    fn test_reset_runs_before_apply() {
        let ipt = Iptables::new(MockRunner::new(), "iptables");
        apply_document(&ipt, &document("web:\n  ports:\n    - port: 80\n"), true).unwrap();
        assert_eq!(
            ipt.runner().commands()[..6],
            [
                "iptables -F",
                "iptables -X",
                "iptables -t nat -F",
                "iptables -t nat -X",
                "iptables -t mangle -F",
                "iptables -t mangle -X",
            ]
        );
    }

    #[test]
    fn test_failed_reset_stops_apply() {
        let runner = MockRunner::new().fail_when("-t nat -F", 1, "iptables: Permission denied.");
        let ipt = Iptables::new(runner, "iptables");
        let err = apply_document(&ipt, &document("web:\n  ports:\n    - port: 80\n"), true).unwrap_err();

        assert!(err.to_string().contains("1 reset command(s) failed"));
        let commands = ipt.runner().commands();
        // Reset keeps going, apply never starts
        assert_eq!(commands.len(), 6);
        assert!(!commands.iter().any(|c| c.contains("-A")));
    }

    #[test]
    fn test_remove_rules_deletes_descending() {
        let listing = "\
Chain INPUT (policy DROP)
num  target     prot opt source               destination
1    ACCEPT     tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:80 /* YAML:web:tcp:port:80:i:any:o:any:mac:any */
2    ACCEPT     all  --  0.0.0.0/0            0.0.0.0/0            /* added by hand */
3    ACCEPT     tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:443 /* YAML:web:tcp:port:443:i:any:o:any:mac:any */
";
        let runner = MockRunner::new().respond_when("-L INPUT", listing);
        let ipt = Iptables::new(runner, "iptables");
        let report = remove_rules(&ipt).unwrap();

        assert_eq!(report.rules_deleted, 2);
        let commands = ipt.runner().commands();
        let deletes: Vec<_> = commands.iter().filter(|c| c.contains(" -D ")).collect();
        assert_eq!(deletes, ["iptables -D INPUT 3", "iptables -D INPUT 1"]);
        assert!(commands.ends_with(&[
            "iptables -P INPUT ACCEPT".to_string(),
            "iptables -P OUTPUT ACCEPT".to_string(),
            "iptables -P FORWARD ACCEPT".to_string(),
        ]));
    }

    #[test]
    fn test_remove_rules_continues_past_failures() {
        let runner = MockRunner::new().fail_when("-t nat -L PREROUTING", 3, "iptables: can't initialize iptables table `nat'");
        let ipt = Iptables::new(runner, "iptables");
        let err = remove_rules(&ipt).unwrap_err();

        assert!(err.to_string().contains("1 cleanup command(s) failed"));
        let commands = ipt.runner().commands();
        assert!(commands.iter().any(|c| c.contains("-L POSTROUTING")));
        assert!(commands.iter().any(|c| c == "iptables -P INPUT ACCEPT"));
    }

    #[test]
    fn test_apply_then_remove_restores_kernel() {
        let kernel = FakeKernel::new();
        kernel.seed_rule("filter", "INPUT", &["-p", "tcp", "--dport", "9000", "-m", "comment", "--comment", "keep me", "-j", "ACCEPT"]);
        kernel.seed_rule("filter", "DOCKER", &["-j", "RETURN"]);
        let ipt = Iptables::new(kernel, "iptables");

        let report = apply_document(&ipt, &document(FULL_DOCUMENT), false).unwrap();
        assert_eq!(ipt.runner().policy("INPUT").as_deref(), Some("DROP"));
        assert_eq!(ipt.runner().rule_count(), 2 + report.rules_appended);

        let removal = remove_rules(&ipt).unwrap();
        assert_eq!(removal.chains_deleted, 2);

        let kernel = ipt.runner();
        assert_eq!(kernel.rule_count(), 2);
        assert_eq!(kernel.rules("filter", "INPUT").len(), 1);
        assert!(kernel.rules("filter", "INPUT")[0].contains("keep me"));
        assert_eq!(kernel.chains("filter"), ["INPUT", "FORWARD", "OUTPUT", "DOCKER"]);
        assert_eq!(kernel.policy("INPUT").as_deref(), Some("ACCEPT"));
        assert_eq!(kernel.policy("FORWARD").as_deref(), Some("ACCEPT"));
    }

    #[test]
    fn test_remove_reclaims_chain_without_rules() {
        let ipt = Iptables::new(FakeKernel::new(), "iptables");
        let doc = document("spare:\n  chain:\n    - name: SPARE\n      rules: {}\n");

        let report = apply_document(&ipt, &doc, false).unwrap();
        assert_eq!(report.chains_created, 1);
        assert_eq!(ipt.runner().rules("filter", "SPARE").len(), 1);

        let removal = remove_rules(&ipt).unwrap();
        assert_eq!(removal.chains_deleted, 1);
        assert_eq!(ipt.runner().chains("filter"), ["INPUT", "FORWARD", "OUTPUT"]);
        assert_eq!(ipt.runner().rule_count(), 0);
    }

    #[test]
    fn test_apply_twice_reuses_chains() {
        let ipt = Iptables::new(FakeKernel::new(), "iptables");
        let doc = document(FULL_DOCUMENT);
        let first = apply_document(&ipt, &doc, false).unwrap();
        let second = apply_document(&ipt, &doc, false).unwrap();

        assert_eq!(first.chains_created, second.chains_created);
        assert_eq!(ipt.runner().chains("filter").len(), 3 + 2);
        // Appends are not deduplicated; removal still finds every copy
        assert_eq!(ipt.runner().rule_count(), 2 * first.rules_appended);
        remove_rules(&ipt).unwrap();
        assert_eq!(ipt.runner().rule_count(), 0);
    }

    #[test]
    fn test_dry_run_lists_commands() {
        let path = std::env::temp_dir().join(format!("iptables-compose-dry-run-{}.yaml", std::process::id()));
        std::fs::write(&path, "web:\n  ports:\n    - port: 80\n").unwrap();
        let result = dry_run(&path, "iptables");
        std::fs::remove_file(&path).unwrap();

        let result = result.unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(
            result.commands,
            ["iptables -A INPUT -p tcp --dport 80 -j ACCEPT -m comment --comment YAML:web:tcp:port:80:i:any:o:any:mac:any"]
        );
    }
}
