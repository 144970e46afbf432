//! Rule lowering
//!
//! Turns typed rules into iptables argument vectors. Lowering is pure: the
//! same document always yields the same commands in the same order, and
//! nothing here touches the system.
//!
//! A rule with several subnets lowers to one command per subnet. The clones
//! differ only in `-s` and share one identifier comment.

use crate::core::comment;
use crate::core::document::FILTER_KEY;
use crate::core::error::{Error, Result};
use crate::core::model::{
    ChainCall, ChainDefinition, ChainName, ChainRef, Cidr, Direction, Document, InterfaceName,
    InterfaceRule, MacAddress, MacRule, Policy, PortMatch, PortRule, RuleRef,
};
use crate::core::planner::ChainPlan;
use std::fmt;

/// Packet-filter table a command operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
    Mangle,
}

/// One iptables invocation, arguments only
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptablesCommand {
    pub table: Table,
    pub args: Vec<String>,
}

impl IptablesCommand {
    /// Starts a command, adding `-t <table>` for anything but the filter table
    fn on(table: Table) -> Self {
        let args = match table {
            Table::Filter => Vec::new(),
            _ => vec!["-t".to_string(), table.to_string()],
        };
        Self { table, args }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `-N <chain>`
    pub fn new_chain(chain: &str) -> Self {
        Self::on(Table::Filter).args(["-N", chain])
    }

    /// `-P <chain> <policy>`
    pub fn set_policy(chain: &str, policy: Policy) -> Self {
        Self::on(Table::Filter).args(["-P", chain, policy.target()])
    }

    /// `-F [chain]`
    pub fn flush(table: Table, chain: Option<&str>) -> Self {
        Self::on(table).arg("-F").args(chain)
    }

    /// `-X [chain]`
    pub fn delete_chain(table: Table, chain: Option<&str>) -> Self {
        Self::on(table).arg("-X").args(chain)
    }

    /// `-t <table> -L <chain> -n --line-numbers`
    pub fn list_numbered(table: Table, chain: &str) -> Self {
        Self {
            table,
            args: Vec::new(),
        }
        .args(["-t", table.as_ref(), "-L", chain, "-n", "--line-numbers"])
    }

    /// `-t <table> -S`
    pub fn list_specs(table: Table) -> Self {
        Self {
            table,
            args: Vec::new(),
        }
        .args(["-t", table.as_ref(), "-S"])
    }

    /// `-D <chain> <line>`
    pub fn delete_rule(table: Table, chain: &str, line: usize) -> Self {
        Self::on(table).args(["-D", chain]).arg(line.to_string())
    }

    /// The rule comment, if this command carries one
    pub fn comment(&self) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == "--comment")
            .map(|w| w[1].as_str())
    }
}

impl fmt::Display for IptablesCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escaped: Vec<String> = self.args.iter().map(|a| shell_escape(a)).collect();
        f.write_str(&escaped.join(" "))
    }
}

/// Characters that make an argument unsafe to paste into a shell
const SHELL_SPECIAL: &[char] = &[
    ' ', '\t', '\n', '\r', '"', '\'', '\\', '$', '`', '|', '&', ';', '<', '>', '(', ')', '{', '}',
    '[', ']', '?', '*', '~',
];

/// Quotes an argument for display in a copy-pasteable command line.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::lower::shell_escape;
///
/// assert_eq!(shell_escape("INPUT"), "INPUT");
/// assert_eq!(shell_escape("a b"), "'a b'");
/// assert_eq!(shell_escape("it's"), r#"'it'"'"'s'"#);
/// ```
pub fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg.contains(SHELL_SPECIAL) {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    } else {
        arg.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rule lowering
// ═══════════════════════════════════════════════════════════════════════════

/// Chain a rule list is appended to
#[derive(Debug, Clone, Copy)]
pub enum Placement<'a> {
    /// The built-in chain implied by each rule
    BuiltIn,
    /// A custom chain
    Custom(&'a ChainName),
}

impl Placement<'_> {
    fn chain(&self, built_in: &'static str) -> String {
        match self {
            Placement::BuiltIn => built_in.to_string(),
            Placement::Custom(name) => name.to_string(),
        }
    }
}

/// Shared inputs for lowering one section's rules
pub struct Lowerer<'p, 'a> {
    plan: &'p ChainPlan<'a>,
    placement: Placement<'p>,
    token: &'p str,
}

impl<'p, 'a> Lowerer<'p, 'a> {
    pub fn new(plan: &'p ChainPlan<'a>, placement: Placement<'p>, token: &'p str) -> Self {
        Self {
            plan,
            placement,
            token,
        }
    }

    /// Lowers one rule to its commands, one per subnet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownChain`] if the rule jumps to an undeclared chain.
    pub fn lower(&self, rule: RuleRef<'_>) -> Result<Vec<IptablesCommand>> {
        let id = comment::identifier(self.token, rule);
        match rule {
            RuleRef::Port(r) => self.lower_port(r, &id),
            RuleRef::Mac(r) => self.lower_mac(r, &id),
            RuleRef::Interface(r) => Ok(vec![self.lower_interface(r, &id)]),
            RuleRef::ChainCall(call) => self.lower_chain_call(call, &id).map(|c| vec![c]),
            RuleRef::CatchAll(action) => Ok(vec![
                IptablesCommand::on(Table::Filter)
                    .args(["-A", self.placement.chain(Direction::Input.chain()).as_str()])
                    .args(["-j", action.target()])
                    .with_comment(&id),
            ]),
        }
    }

    fn target(&self, reference: Option<&ChainRef>, verdict: &'static str) -> Result<String> {
        match reference {
            None => Ok(verdict.to_string()),
            Some(reference) => self
                .plan
                .resolve(reference)
                .map(ToString::to_string)
                .ok_or_else(|| Error::UnknownChain {
                    referenced_from: self.token.to_string(),
                    name: reference.to_string(),
                }),
        }
    }

    fn lower_port(&self, rule: &PortRule, id: &str) -> Result<Vec<IptablesCommand>> {
        let iface = &rule.interface;

        let (base, tail) = if let (Some(to), PortMatch::Single(port)) = (rule.redirect, &rule.ports) {
            let base = IptablesCommand::on(Table::Nat)
                .args(["-A", "PREROUTING", "-p", rule.protocol.as_str()])
                .args(interface_args(iface.input.as_ref(), None));
            let tail = vec![
                "--dport".to_string(),
                port.to_string(),
                "-j".to_string(),
                "REDIRECT".to_string(),
                "--to-port".to_string(),
                to.to_string(),
            ];
            (base, tail)
        } else {
            let base = IptablesCommand::on(Table::Filter)
                .args(["-A", self.placement.chain(rule.direction.chain()).as_str()])
                .args(["-p", rule.protocol.as_str()])
                .args(interface_args(iface.input.as_ref(), iface.output.as_ref()));
            let mut tail = match &rule.ports {
                PortMatch::Single(port) => vec!["--dport".to_string(), port.to_string()],
                PortMatch::Ranges(ranges) => vec![
                    "-m".to_string(),
                    "multiport".to_string(),
                    "--dports".to_string(),
                    PortMatch::range_list(ranges),
                ],
            };
            tail.push("-j".to_string());
            tail.push(self.target(rule.target_chain(), rule.action().target())?);
            (base, tail)
        };

        Ok(fan_out(&rule.subnets, |subnet| {
            base.clone()
                .args(subnet_args(subnet))
                .args(mac_args(rule.mac_source.as_ref()))
                .args(tail.iter().cloned())
                .with_comment(id)
        }))
    }

    fn lower_mac(&self, rule: &MacRule, id: &str) -> Result<Vec<IptablesCommand>> {
        let target = self.target(rule.target_chain(), rule.action().target())?;
        Ok(fan_out(&rule.subnets, |subnet| {
            IptablesCommand::on(Table::Filter)
                .args(["-A", self.placement.chain(Direction::Input.chain()).as_str()])
                .args(interface_args(rule.interface.input.as_ref(), None))
                .args(subnet_args(subnet))
                .args(mac_args(Some(&rule.mac)))
                .args(["-j", target.as_str()])
                .with_comment(id)
        }))
    }

    fn lower_interface(&self, rule: &InterfaceRule, id: &str) -> IptablesCommand {
        IptablesCommand::on(Table::Filter)
            .args(["-A", self.placement.chain(rule.direction.chain()).as_str()])
            .args(interface_args(rule.input.as_ref(), rule.output.as_ref()))
            .args(["-j", rule.action().target()])
            .with_comment(id)
    }

    fn lower_chain_call(&self, call: &ChainCall, id: &str) -> Result<IptablesCommand> {
        let target = self.target(Some(&call.chain), "")?;
        Ok(IptablesCommand::on(Table::Filter)
            .args(["-A", self.placement.chain(call.direction().chain()).as_str()])
            .args(interface_args(call.input.as_ref(), call.output.as_ref()))
            .args(["-j", target.as_str()])
            .with_comment(id))
    }
}

impl IptablesCommand {
    fn with_comment(self, id: &str) -> Self {
        self.args(["-m", "comment", "--comment", id])
    }
}

fn interface_args(input: Option<&InterfaceName>, output: Option<&InterfaceName>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(i) = input {
        args.extend(["-i".to_string(), i.to_string()]);
    }
    if let Some(o) = output {
        args.extend(["-o".to_string(), o.to_string()]);
    }
    args
}

fn subnet_args(subnet: Option<&Cidr>) -> Vec<String> {
    subnet.map_or_else(Vec::new, |s| vec!["-s".to_string(), s.to_string()])
}

fn mac_args(mac: Option<&MacAddress>) -> Vec<String> {
    mac.map_or_else(Vec::new, |m| {
        vec![
            "-m".to_string(),
            "mac".to_string(),
            "--mac-source".to_string(),
            m.to_string(),
        ]
    })
}

/// One command per subnet, or a single command without `-s`
fn fan_out(subnets: &[Cidr], build: impl Fn(Option<&Cidr>) -> IptablesCommand) -> Vec<IptablesCommand> {
    if subnets.is_empty() {
        vec![build(None)]
    } else {
        subnets.iter().map(|s| build(Some(s))).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Apply program
// ═══════════════════════════════════════════════════════════════════════════

/// Every command the apply pipeline issues, grouped by phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    /// `-N` for each custom chain, dependencies first
    pub chains: Vec<IptablesCommand>,
    /// `-P` for each filter policy
    pub policies: Vec<IptablesCommand>,
    /// Global MAC rules from the filter block
    pub filter_rules: Vec<IptablesCommand>,
    /// Rules that populate custom chains
    pub chain_rules: Vec<IptablesCommand>,
    /// Section rules in document order
    pub section_rules: Vec<IptablesCommand>,
}

impl ApplyPlan {
    /// All commands in execution order
    pub fn commands(&self) -> impl Iterator<Item = &IptablesCommand> {
        self.chains
            .iter()
            .chain(&self.policies)
            .chain(&self.filter_rules)
            .chain(&self.chain_rules)
            .chain(&self.section_rules)
    }

    /// Number of `-A` commands
    pub fn rule_count(&self) -> usize {
        self.filter_rules.len() + self.chain_rules.len() + self.section_rules.len()
    }
}

/// Lowers a whole document into its apply program.
///
/// # Errors
///
/// Returns [`Error::UnknownChain`] for a jump to an undeclared chain.
pub fn compile(doc: &Document, plan: &ChainPlan<'_>) -> Result<ApplyPlan> {
    let mut program = ApplyPlan::default();

    for chain in plan.creation_order() {
        program.chains.push(IptablesCommand::new_chain(chain.name.as_str()));
    }

    if let Some(filter) = &doc.filter {
        for (direction, policy) in filter.policies() {
            program
                .policies
                .push(IptablesCommand::set_policy(direction.chain(), policy));
        }

        let lowerer = Lowerer::new(plan, Placement::BuiltIn, FILTER_KEY);
        for mac in &filter.macs {
            program.filter_rules.extend(lowerer.lower(RuleRef::Mac(mac))?);
        }
    }

    for chain in plan.creation_order() {
        program.chain_rules.extend(lower_chain(chain, plan)?);
    }

    for named in &doc.sections {
        let lowerer = Lowerer::new(plan, Placement::BuiltIn, &named.name);
        for rule in named.section.rules() {
            program.section_rules.extend(lowerer.lower(rule)?);
        }
    }

    Ok(program)
}

/// Rules of one custom chain, ending with its default verdict if any
fn lower_chain(chain: &ChainDefinition, plan: &ChainPlan<'_>) -> Result<Vec<IptablesCommand>> {
    let mut commands = Vec::new();
    for group in &chain.groups {
        let token = comment::group_token(&chain.name, &group.name);
        let lowerer = Lowerer::new(plan, Placement::Custom(&chain.name), &token);
        for rule in group.section.rules() {
            commands.extend(lowerer.lower(rule)?);
        }
    }

    if let (Some(action), Some(id)) = (chain.default_rule(), comment::chain_default_identifier(chain)) {
        commands.push(
            IptablesCommand::on(Table::Filter)
                .args(["-A", chain.name.as_str(), "-j", action.target()])
                .with_comment(&id),
        );
    }

    if commands.is_empty() {
        commands.push(
            IptablesCommand::on(Table::Filter)
                .args(["-A", chain.name.as_str(), "-j", "RETURN"])
                .with_comment(&comment::chain_marker_identifier(&chain.name)),
        );
    }

    Ok(commands)
}
