//! Rule validation
//!
//! A single pass over the document in kernel append order. Two families of
//! findings come out of it:
//!
//! - **Blocking**: a jump to an undeclared chain, chains that jump to each
//!   other in a loop, or a rule that both jumps and denies/redirects. The
//!   apply pipeline refuses to start.
//! - **Advisory**: rules that can never match because an earlier rule on
//!   the same chain already matches all of their traffic (unreachable or
//!   redundant), and partial subnet overlaps with opposite verdicts.
//!
//! Shadowing is only checked between rules that land on the same kernel
//! chain. A jump into a custom chain does not shadow later rules, since the
//! packet can return from that chain.

use crate::core::comment;
use crate::core::document::FILTER_KEY;
use crate::core::error::Error;
use crate::core::model::{Action, ChainRef, Cidr, Direction, Document, InterfaceName, Protocol, RuleRef};
use crate::core::planner::{ChainIndex, build_graph};
use crate::core::rule_constraints;
use std::fmt;
use tracing::debug;

/// Kind of finding reported by [`validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum WarningKind {
    #[strum(to_string = "Unreachable rule")]
    UnreachableRule,
    #[strum(to_string = "Redundant rule")]
    RedundantRule,
    #[strum(to_string = "Subnet overlap")]
    SubnetOverlap,
    #[strum(to_string = "Invalid chain reference")]
    InvalidChainReference,
    #[strum(to_string = "Circular chain dependency")]
    CircularChainDependency,
    #[strum(to_string = "Chain action conflict")]
    ChainActionConflict,
}

impl WarningKind {
    /// Blocking findings stop the apply pipeline
    pub const fn is_blocking(self) -> bool {
        matches!(
            self,
            WarningKind::InvalidChainReference
                | WarningKind::CircularChainDependency
                | WarningKind::ChainActionConflict
        )
    }
}

/// One validator finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    /// Section token of the offending rule (`filter`, a section name, or `CHAIN/group`)
    pub section: String,
    /// Zero-based rule index within its section
    pub rule_index: Option<usize>,
    /// Earlier rule responsible for the finding, as `(section, index)`
    pub conflicting: Option<(String, usize)>,
    /// Chains involved: the cycle path, or the missing jump target
    pub chains: Vec<String>,
    pub message: String,
}

impl Warning {
    fn new(kind: WarningKind, section: &str, rule_index: Option<usize>, message: String) -> Self {
        Self {
            kind,
            section: section.to_string(),
            rule_index,
            conflicting: None,
            chains: Vec::new(),
            message,
        }
    }

    /// Converts a blocking finding into the error the pipeline fails with
    pub fn into_error(self) -> Error {
        match self.kind {
            WarningKind::CircularChainDependency => Error::CircularChainDependency {
                chains: self.chains,
            },
            WarningKind::InvalidChainReference if !self.chains.is_empty() => Error::UnknownChain {
                referenced_from: self.section,
                name: self.chains.into_iter().next().unwrap_or_default(),
            },
            kind => Error::Blocked {
                kind,
                section: self.section,
                message: self.message,
            },
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.kind)?;
        match self.rule_index {
            Some(i) => write!(f, "Section '{}' rule #{}: ", self.section, i + 1)?,
            None => write!(f, "Section '{}': ", self.section)?,
        }
        f.write_str(&self.message)
    }
}

/// First blocking finding, if any
pub fn first_blocking(warnings: &[Warning]) -> Option<&Warning> {
    warnings.iter().find(|w| w.kind.is_blocking())
}

// ═══════════════════════════════════════════════════════════════════════════
// Selectivity
// ═══════════════════════════════════════════════════════════════════════════

/// What a rule does with the packets it matches
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Terminal(&'static str),
    Jump(String),
    Redirect(u16),
}

impl Verdict {
    fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Jump(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Terminal(t) => f.write_str(t),
            Verdict::Jump(chain) => write!(f, "jump to {chain}"),
            Verdict::Redirect(port) => write!(f, "redirect to {port}"),
        }
    }
}

/// Match set of one rule. `None` and empty lists mean "any".
#[derive(Debug, Clone)]
struct Selectivity {
    /// `(table, chain)` the rule is appended to
    slot: (&'static str, String),
    subnets: Vec<Cidr>,
    ports: Option<Vec<(u16, u16)>>,
    protocol: Option<Protocol>,
    in_iface: Option<String>,
    out_iface: Option<String>,
    mac: Option<String>,
    verdict: Verdict,
    section: String,
    index: usize,
}

impl Selectivity {
    fn of(rule: RuleRef<'_>, section: &str, index: usize, custom_chain: Option<&str>) -> Self {
        let slot_for = |builtin: &str| ("filter", custom_chain.unwrap_or(builtin).to_string());
        let name = |i: Option<&InterfaceName>| i.map(|n| n.as_str().to_string());
        let jump_or = |chain: Option<&ChainRef>, allow: bool| {
            chain.map_or_else(
                || Verdict::Terminal(Action::from_allow(allow).target()),
                |c| Verdict::Jump(c.to_string()),
            )
        };

        let base = Self {
            slot: slot_for(Direction::Input.chain()),
            subnets: Vec::new(),
            ports: None,
            protocol: None,
            in_iface: None,
            out_iface: None,
            mac: None,
            verdict: Verdict::Terminal("ACCEPT"),
            section: section.to_string(),
            index,
        };

        match rule {
            RuleRef::Port(r) => Self {
                slot: if r.redirect.is_some() {
                    ("nat", "PREROUTING".to_string())
                } else {
                    slot_for(r.direction.chain())
                },
                subnets: r.subnets.clone(),
                ports: Some(r.ports.intervals()),
                protocol: Some(r.protocol),
                in_iface: name(r.interface.input.as_ref()),
                out_iface: name(r.interface.output.as_ref()),
                mac: r.mac_source.as_ref().map(|m| m.normalized()),
                verdict: match r.redirect {
                    Some(port) => Verdict::Redirect(port),
                    None => jump_or(r.target_chain(), r.allow),
                },
                ..base
            },
            RuleRef::Mac(r) => Self {
                subnets: r.subnets.clone(),
                in_iface: name(r.interface.input.as_ref()),
                mac: Some(r.mac.normalized()),
                verdict: jump_or(r.target_chain(), r.allow),
                ..base
            },
            RuleRef::Interface(r) => Self {
                slot: slot_for(r.direction.chain()),
                in_iface: name(r.input.as_ref()),
                out_iface: name(r.output.as_ref()),
                verdict: Verdict::Terminal(r.action().target()),
                ..base
            },
            RuleRef::ChainCall(call) => Self {
                slot: slot_for(call.direction().chain()),
                in_iface: name(call.input.as_ref()),
                out_iface: name(call.output.as_ref()),
                verdict: Verdict::Jump(call.chain.to_string()),
                ..base
            },
            RuleRef::CatchAll(action) => Self {
                verdict: Verdict::Terminal(action.target()),
                ..base
            },
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        match (&self.protocol, &self.ports) {
            (Some(p), Some(ports)) => {
                let ports = ports
                    .iter()
                    .map(|(lo, hi)| if lo == hi { lo.to_string() } else { format!("{lo}-{hi}") })
                    .collect::<Vec<_>>()
                    .join(",");
                parts.push(format!("{} port {ports}", p.display_name()));
            }
            _ => parts.push("all traffic".to_string()),
        }
        if !self.subnets.is_empty() {
            let subnets = self.subnets.iter().map(Cidr::as_str).collect::<Vec<_>>().join(",");
            parts.push(format!("from {subnets}"));
        }
        if let Some(mac) = &self.mac {
            parts.push(format!("mac {mac}"));
        }
        if let Some(i) = &self.in_iface {
            parts.push(format!("in {i}"));
        }
        if let Some(o) = &self.out_iface {
            parts.push(format!("out {o}"));
        }
        format!("{} -> {}", parts.join(" "), self.verdict)
    }

    /// Every dimension except subnets is at least as permissive as `other`'s
    fn covers_except_subnets(&self, other: &Selectivity) -> bool {
        let protocol = match (self.protocol, other.protocol) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a == b,
        };
        let ports = match (&self.ports, &other.ports) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b
                .iter()
                .all(|(lo, hi)| a.iter().any(|(alo, ahi)| alo <= lo && hi <= ahi)),
        };
        let same_or_any = |a: &Option<String>, b: &Option<String>| a.is_none() || a == b;

        protocol
            && ports
            && same_or_any(&self.in_iface, &other.in_iface)
            && same_or_any(&self.out_iface, &other.out_iface)
            && same_or_any(&self.mac, &other.mac)
    }

    fn subnets_cover(&self, other: &Selectivity) -> bool {
        if self.subnets.is_empty() {
            return true;
        }
        if other.subnets.is_empty() {
            return false;
        }
        other
            .subnets
            .iter()
            .all(|b| self.subnets.iter().any(|a| a.contains(b)))
    }

    fn subnets_overlap(&self, other: &Selectivity) -> bool {
        self.subnets
            .iter()
            .any(|a| other.subnets.iter().any(|b| a.overlaps(b)))
    }

    /// `self ⊇ other`
    fn is_superset_of(&self, other: &Selectivity) -> bool {
        self.covers_except_subnets(other) && self.subnets_cover(other)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation pass
// ═══════════════════════════════════════════════════════════════════════════

/// State carried through one validation pass
struct Pass<'a> {
    index: ChainIndex<'a>,
    seen: Vec<Selectivity>,
    warnings: Vec<Warning>,
}

impl Pass<'_> {
    fn visit(&mut self, rule: RuleRef<'_>, section: &str, i: usize, custom_chain: Option<&str>) {
        check_rule_integrity(rule, section, i, &self.index, &mut self.warnings);
        let current = Selectivity::of(rule, section, i, custom_chain);
        if let Some(w) = check_shadowing(&self.seen, &current) {
            self.warnings.push(w);
        }
        self.seen.push(current);
    }
}

/// Runs every check over the document and returns the findings in append
/// order.
pub fn validate(doc: &Document) -> Vec<Warning> {
    let mut pass = Pass {
        index: ChainIndex::new(doc),
        seen: Vec::new(),
        warnings: Vec::new(),
    };

    for (i, mac) in doc.filter_macs().iter().enumerate() {
        pass.visit(RuleRef::Mac(mac), FILTER_KEY, i, None);
    }

    for named in &doc.sections {
        for (i, rule) in named.section.rules().enumerate() {
            pass.visit(rule, &named.name, i, None);
        }
    }

    for chain in &doc.chains {
        for group in &chain.groups {
            let token = comment::group_token(&chain.name, &group.name);
            for (i, rule) in group.section.rules().enumerate() {
                pass.visit(rule, &token, i, Some(chain.name.as_str()));
            }
        }
    }

    let Pass {
        index,
        mut warnings,
        ..
    } = pass;

    // Unresolved jumps are already reported per rule above
    if let Ok(graph) = build_graph(doc, &index)
        && let Some(cycle) = graph.find_cycle()
    {
        let first = cycle.first().cloned().unwrap_or_default();
        let declared_in = doc
            .chain(&first)
            .map_or(first.clone(), |c| c.declared_in.clone());
        warnings.push(Warning {
            chains: cycle.clone(),
            ..Warning::new(
                WarningKind::CircularChainDependency,
                &declared_in,
                None,
                format!("Chains jump to each other in a loop: {}", cycle.join(" -> ")),
            )
        });
    }

    debug!(
        "Validation finished: {} findings ({} blocking)",
        warnings.len(),
        warnings.iter().filter(|w| w.kind.is_blocking()).count()
    );
    warnings
}

fn check_rule_integrity(
    rule: RuleRef<'_>,
    section: &str,
    i: usize,
    index: &ChainIndex<'_>,
    warnings: &mut Vec<Warning>,
) {
    if let Some(message) = rule_constraints::chain_action_conflict(rule) {
        warnings.push(Warning::new(
            WarningKind::ChainActionConflict,
            section,
            Some(i),
            message.to_string(),
        ));
    }

    if let Some(reference) = rule.chain_reference()
        && index.resolve(reference).is_none()
    {
        warnings.push(Warning {
            chains: vec![reference.to_string()],
            ..Warning::new(
                WarningKind::InvalidChainReference,
                section,
                Some(i),
                format!("Referenced chain '{reference}' is not defined"),
            )
        });
    }
}

/// Compares a rule against every earlier rule on the same chain
fn check_shadowing(earlier: &[Selectivity], current: &Selectivity) -> Option<Warning> {
    let same_slot = || earlier.iter().filter(|a| a.slot == current.slot && a.verdict.is_terminal());

    if let Some(a) = same_slot().find(|a| a.is_superset_of(current)) {
        let (kind, what) = if a.verdict == current.verdict {
            (WarningKind::RedundantRule, "is redundant")
        } else {
            (WarningKind::UnreachableRule, "is unreachable")
        };
        return Some(Warning {
            conflicting: Some((a.section.clone(), a.index)),
            ..Warning::new(
                kind,
                &current.section,
                Some(current.index),
                format!(
                    "Rule ({}) {what}: rule #{} in section '{}' ({}) matches all of its traffic first",
                    current.describe(),
                    a.index + 1,
                    a.section,
                    a.describe()
                ),
            )
        });
    }

    if !current.verdict.is_terminal() {
        return None;
    }

    same_slot()
        .find(|a| {
            a.verdict != current.verdict
                && a.covers_except_subnets(current)
                && a.subnets_overlap(current)
        })
        .map(|a| Warning {
            conflicting: Some((a.section.clone(), a.index)),
            ..Warning::new(
                WarningKind::SubnetOverlap,
                &current.section,
                Some(current.index),
                format!(
                    "Rule ({}) partially overlaps rule #{} in section '{}' ({}) with a different verdict; the overlapping part never reaches this rule",
                    current.describe(),
                    a.index + 1,
                    a.section,
                    a.describe()
                ),
            )
        })
}
