//! Parsers for iptables listings
//!
//! Removal works purely from kernel state. Two listing formats are read:
//!
//! - `-L <chain> -n --line-numbers`: the numbered table view. Comments show
//!   up as `/* ... */`, which is enough to find the lines to delete.
//! - `-S`: the rule-spec view of a whole table. It keeps `-N` declarations
//!   and jump targets, which is what managed-chain discovery needs.

use crate::core::comment;
use crate::core::model::ChainName;
use crate::core::planner::DependencyGraph;
use std::collections::{BTreeSet, HashSet};

/// Line numbers of rows that contain `needle`, highest first.
///
/// Deleting from the bottom up keeps the remaining numbers valid.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::listing::lines_containing;
///
/// let listing = "Chain INPUT (policy ACCEPT)\n\
///                num  target  prot opt source     destination\n\
///                1    ACCEPT  tcp  --  0.0.0.0/0  0.0.0.0/0  /* YAML:web */\n\
///                2    DROP    all  --  0.0.0.0/0  0.0.0.0/0\n\
///                3    ACCEPT  udp  --  0.0.0.0/0  0.0.0.0/0  /* YAML:web */\n";
/// assert_eq!(lines_containing(listing, "YAML:web"), [3, 1]);
/// ```
pub fn lines_containing(listing: &str, needle: &str) -> Vec<usize> {
    numbered_rows(listing, |row| row.contains(needle))
}

/// Line numbers of rows whose comment starts with the managed prefix,
/// highest first
pub fn managed_lines(listing: &str) -> Vec<usize> {
    let marker = format!("/* {}", comment::PREFIX);
    numbered_rows(listing, |row| row.contains(&marker))
}

fn numbered_rows(listing: &str, keep: impl Fn(&str) -> bool) -> Vec<usize> {
    let mut lines: Vec<usize> = listing
        .lines()
        .filter_map(|row| {
            let number = row.split_whitespace().next()?.parse::<usize>().ok()?;
            keep(row).then_some(number)
        })
        .collect();
    lines.sort_unstable_by(|a, b| b.cmp(a));
    lines.dedup();
    lines
}

// ═══════════════════════════════════════════════════════════════════════════
// -S parsing
// ═══════════════════════════════════════════════════════════════════════════

/// One line of `iptables -S`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecLine {
    /// `-P <chain> <policy>`
    Policy { chain: String, policy: String },
    /// `-N <chain>`
    NewChain(String),
    /// `-A <chain> ...`
    Rule {
        chain: String,
        /// Value of `-j` or `-g`
        target: Option<String>,
        comment: Option<String>,
    },
}

/// Splits a `-S` line into arguments, honouring double quotes and
/// backslash escapes the way iptables prints them
pub fn split_spec(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Parses `iptables -S` output. Unknown lines are skipped.
pub fn parse_specs(output: &str) -> Vec<SpecLine> {
    output
        .lines()
        .filter_map(|line| {
            let args = split_spec(line);
            let value_after = |flag: &str| {
                args.windows(2)
                    .find(|w| w[0] == flag)
                    .map(|w| w[1].clone())
            };

            match args.first().map(String::as_str) {
                Some("-P") if args.len() >= 3 => Some(SpecLine::Policy {
                    chain: args[1].clone(),
                    policy: args[2].clone(),
                }),
                Some("-N") if args.len() >= 2 => Some(SpecLine::NewChain(args[1].clone())),
                Some("-A") if args.len() >= 2 => Some(SpecLine::Rule {
                    chain: args[1].clone(),
                    target: value_after("-j").or_else(|| value_after("-g")),
                    comment: value_after("--comment"),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Custom chains this tool owns, in deletion order.
///
/// A custom chain is managed when it holds a rule with the managed comment
/// prefix, when such a rule jumps to it, or when a managed chain jumps to it.
/// Custom chains created by other software are left out.
pub fn managed_chains(specs: &[SpecLine]) -> Vec<String> {
    let custom: HashSet<&str> = specs
        .iter()
        .filter_map(|s| match s {
            SpecLine::NewChain(name) if !ChainName::is_builtin(name) => Some(name.as_str()),
            _ => None,
        })
        .collect();

    let mut graph = DependencyGraph::new();
    let mut managed: BTreeSet<String> = BTreeSet::new();

    for spec in specs {
        match spec {
            SpecLine::NewChain(name) if custom.contains(name.as_str()) => {
                graph.add_node(name);
            }
            SpecLine::Rule {
                chain,
                target,
                comment: rule_comment,
            } => {
                let owned = rule_comment.as_deref().is_some_and(comment::is_managed);
                let target = target.as_deref().filter(|t| custom.contains(t));

                if owned && custom.contains(chain.as_str()) {
                    managed.insert(chain.clone());
                }
                if let Some(t) = target {
                    if owned {
                        managed.insert(t.to_string());
                    }
                    if custom.contains(chain.as_str()) {
                        graph.add_edge(chain, t);
                    }
                }
            }
            _ => {}
        }
    }

    // Close over jumps: anything a managed chain jumps to is managed too
    let mut frontier: Vec<String> = managed.iter().cloned().collect();
    while let Some(chain) = frontier.pop() {
        for target in graph.targets(&chain) {
            if managed.insert(target.to_string()) {
                frontier.push(target.to_string());
            }
        }
    }

    graph
        .cleanup_order()
        .into_iter()
        .filter(|c| managed.contains(c))
        .collect()
}
