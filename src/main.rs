//! iptables-compose - YAML to iptables rule compiler
//!
//! Reads a YAML firewall document, checks it for mistakes and applies it to
//! the kernel as iptables commands. Every rule it appends carries a `YAML:`
//! comment, so `--remove-rules` can take them back out later without
//! touching rules added by anything else.
//!
//! # Usage
//!
//! ```bash
//! iptables-compose firewall.yaml            # Apply on top of current rules
//! iptables-compose --reset firewall.yaml    # Flush everything, then apply
//! iptables-compose --debug firewall.yaml    # Validate and print commands only
//! iptables-compose --remove-rules           # Remove every managed rule and chain
//! ```

use clap::{ArgGroup, CommandFactory, Parser};
use iptables_compose::core::error::IptablesErrorPattern;
use iptables_compose::core::executor::{Iptables, SystemRunner};
use iptables_compose::system::{self, LocalHost};
use iptables_compose::{Error, orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

const LICENSE: &str = include_str!("../LICENSE");

#[derive(Parser, Debug)]
#[command(name = "iptables-compose", version)]
#[command(about = "Compile a YAML firewall document into iptables rules", long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .args(["config_file", "remove_rules", "license"])
        .required(true)
))]
struct Cli {
    /// Reset all tables before applying CONFIG_FILE
    #[arg(short, long, requires = "config_file")]
    reset: bool,

    /// Remove all rules and chains created by this tool
    #[arg(short = 'm', long, conflicts_with_all = ["config_file", "license"])]
    remove_rules: bool,

    /// Print license text
    #[arg(short, long, conflicts_with_all = ["config_file", "remove_rules"])]
    license: bool,

    /// Validate only and print the commands that would run
    #[arg(short, long, requires = "config_file")]
    debug: bool,

    /// YAML firewall document
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help and version go to stdout and are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if cli.license {
        print!("{LICENSE}");
        return ExitCode::SUCCESS;
    }

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let program = system::iptables_program();

    if cli.debug {
        let path = config_path(cli)?;
        let dry_run = orchestrator::dry_run(&path, &program)?;
        print_warnings(&dry_run.warnings);
        println!("Configuration is valid. Commands that would run:");
        for line in &dry_run.commands {
            println!("  {line}");
        }
        return Ok(());
    }

    let ipt = Iptables::new(SystemRunner, program);
    system::check_host(&LocalHost, &ipt)?;

    if cli.remove_rules {
        let report = orchestrator::remove_rules(&ipt)?;
        println!(
            "Removed {} rules and {} chains.",
            report.rules_deleted, report.chains_deleted
        );
        return Ok(());
    }

    let path = config_path(cli)?;
    let report = orchestrator::apply(&ipt, &path, cli.reset)?;
    print_warnings(&report.warnings);
    println!(
        "Applied {}: {} chains created, {} policies set, {} rules appended.",
        path.display(),
        report.chains_created,
        report.policies_set,
        report.rules_appended
    );
    Ok(())
}

fn config_path(cli: &Cli) -> Result<PathBuf, Error> {
    cli.config_file
        .clone()
        .ok_or_else(|| Error::Config(Cli::command().render_usage().to_string()))
}

fn print_warnings(warnings: &[iptables_compose::core::validator::Warning]) {
    for warning in warnings {
        println!("Warning: {warning}");
    }
}

fn report_error(error: &Error) {
    eprintln!("Error: {error}");

    match error {
        Error::Iptables {
            command,
            stderr,
            exit_code,
            ..
        } => {
            eprintln!("  command:   {command}");
            if let Some(code) = exit_code {
                eprintln!("  exit code: {code}");
            }
            if let Some(stderr) = stderr {
                eprintln!("  stderr:    {}", stderr.trim());
                let translation = IptablesErrorPattern::match_error(stderr);
                eprintln!("\n{}", translation.user_message);
                for suggestion in &translation.suggestions {
                    eprintln!("  - {suggestion}");
                }
                if let Some(url) = &translation.help_url {
                    eprintln!("  See {url}");
                }
            }
        }
        Error::System(_) => eprintln!("Use --help for usage information."),
        _ => {}
    }
}
