//! Typed firewall model
//!
//! The document parser turns YAML into these types once; everything downstream
//! (validator, planner, lowerer) only ever borrows them.
//!
//! # Structure
//!
//! A [`Document`] holds:
//! - An optional [`FilterPolicy`] (built-in chain policies plus global MAC rules)
//! - An ordered list of [`NamedSection`]s whose rules are appended to built-in chains
//! - The [`ChainDefinition`]s pulled out of sections that declare a `chain` block
//!
//! Leaf values ([`PortRange`], [`MacAddress`], [`Cidr`], [`ChainName`],
//! [`InterfaceName`]) can only be built through their validating constructors.

use crate::validators;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Chains that exist in every kernel and are never created or deleted.
pub const BUILTIN_CHAINS: [&str; 5] = ["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];

// ═══════════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════════

/// Traffic direction, one per filter built-in chain
#[derive(
    Debug,
    Clone,
    Copy,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(try_from = "String")]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    #[default]
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "forward")]
    Forward,
}

impl Direction {
    /// Built-in chain that carries this direction
    pub const fn chain(self) -> &'static str {
        match self {
            Direction::Input => "INPUT",
            Direction::Output => "OUTPUT",
            Direction::Forward => "FORWARD",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
            Direction::Forward => "forward",
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse()
            .map_err(|_| format!("Invalid direction '{value}': expected input, output or forward"))
    }
}

/// Terminal verdict for a rule or a chain
///
/// `allow` and `deny` are accepted as spellings of `accept` and `drop`.
#[derive(
    Debug,
    Clone,
    Copy,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(try_from = "String")]
#[strum(ascii_case_insensitive)]
pub enum Action {
    #[default]
    #[strum(to_string = "accept", serialize = "allow")]
    Accept,
    #[strum(to_string = "drop", serialize = "deny")]
    Drop,
    #[strum(serialize = "reject")]
    Reject,
}

impl Action {
    /// iptables jump target for this verdict
    pub const fn target(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
        }
    }

    /// Maps a rule's `allow` flag to a verdict
    pub const fn from_allow(allow: bool) -> Self {
        if allow { Action::Accept } else { Action::Drop }
    }
}

impl TryFrom<String> for Action {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse()
            .map_err(|_| format!("Invalid action '{value}': expected accept, drop or reject"))
    }
}

/// Built-in chain default policy. Same value set as [`Action`].
pub type Policy = Action;

/// Transport protocol for port matching
#[derive(
    Debug,
    Clone,
    Copy,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(try_from = "String")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse()
            .map_err(|_| format!("Invalid protocol '{value}': expected tcp or udp"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Leaf types
// ═══════════════════════════════════════════════════════════════════════════

/// Inclusive destination port range with `start < end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, other: &PortRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = validators::validate_port_range(s)?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Port selector of a [`PortRule`]: one port, or a multiport list of ranges
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortMatch {
    Single(u16),
    Ranges(Vec<PortRange>),
}

impl PortMatch {
    /// Intervals covered by this selector, as `(lo, hi)` pairs
    pub fn intervals(&self) -> Vec<(u16, u16)> {
        match self {
            PortMatch::Single(p) => vec![(*p, *p)],
            PortMatch::Ranges(ranges) => ranges.iter().map(|r| (r.start, r.end)).collect(),
        }
    }

    /// Comma-joined range list as passed to `--dports`
    pub fn range_list(ranges: &[PortRange]) -> String {
        ranges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Source MAC address, kept exactly as written
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case- and separator-insensitive comparison key
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase().replace('-', ":")
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validators::validate_mac(s).map(Self)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IPv4 source subnet
///
/// Keeps the text as written (for `-s` and identifiers) next to the masked
/// network integer and prefix used for containment checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cidr {
    text: String,
    network: u32,
    prefix: u8,
}

impl Cidr {
    pub fn network(&self) -> u32 {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn mask(&self) -> u32 {
        prefix_mask(self.prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True when every address in `other` is also in `self`
    ///
    /// # Examples
    ///
    /// ```
    /// use iptables_compose::core::model::Cidr;
    ///
    /// let wide: Cidr = "10.0.0.0/8".parse().unwrap();
    /// let narrow: Cidr = "10.1.2.0/24".parse().unwrap();
    /// assert!(wide.contains(&narrow));
    /// assert!(!narrow.contains(&wide));
    /// ```
    pub fn contains(&self, other: &Cidr) -> bool {
        self.prefix <= other.prefix && (other.network & self.mask()) == self.network
    }

    /// Two CIDR blocks overlap exactly when one contains the other
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }
}

/// Network mask for a prefix length; `/0` masks everything away
pub fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net = validators::validate_cidr(s)?;
        Ok(Self {
            text: s.to_string(),
            network: u32::from(net.network()),
            prefix: net.prefix(),
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Name of a custom chain declared in the document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainName(String);

impl ChainName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_builtin(name: &str) -> bool {
        BUILTIN_CHAINS.contains(&name)
    }
}

impl FromStr for ChainName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = validators::validate_chain_name(s)?;
        if Self::is_builtin(&name) {
            return Err(format!("Chain name '{name}' is reserved for a built-in chain"));
        }
        Ok(Self(name))
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a chain from a rule: either a chain name or the name of a
/// section that declares chains. Resolved by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainRef(String);

impl ChainRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ChainRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validators::validate_section_name(s)
            .map(Self)
            .map_err(|_| format!("Invalid chain reference '{s}'"))
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network interface name (`eth0`, `br-lan`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName(String);

impl InterfaceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for InterfaceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validators::validate_interface(s).map(Self)
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════

/// Interface filter attached to a rule, optionally doubling as a chain jump
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InterfaceSpec {
    pub input: Option<InterfaceName>,
    pub output: Option<InterfaceName>,
    pub chain: Option<ChainRef>,
}

/// Section-level jump into a custom chain, scoped by interfaces
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainCall {
    pub input: Option<InterfaceName>,
    pub output: Option<InterfaceName>,
    pub chain: ChainRef,
}

impl ChainCall {
    /// Built-in chain the jump is appended to
    ///
    /// Input only or neither → INPUT, output only → OUTPUT, both → FORWARD.
    pub fn direction(&self) -> Direction {
        match (&self.input, &self.output) {
            (None, Some(_)) => Direction::Output,
            (Some(_), Some(_)) => Direction::Forward,
            _ => Direction::Input,
        }
    }
}

/// TCP/UDP destination-port rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRule {
    pub ports: PortMatch,
    pub protocol: Protocol,
    pub direction: Direction,
    pub subnets: Vec<Cidr>,
    /// Local port for a NAT `REDIRECT` (the document's `forward` key)
    pub redirect: Option<u16>,
    pub allow: bool,
    pub interface: InterfaceSpec,
    pub mac_source: Option<MacAddress>,
    pub chain: Option<ChainRef>,
}

impl PortRule {
    /// Jump target: the rule's own `chain`, else its interface spec's chain
    pub fn target_chain(&self) -> Option<&ChainRef> {
        self.chain.as_ref().or(self.interface.chain.as_ref())
    }

    pub fn action(&self) -> Action {
        Action::from_allow(self.allow)
    }
}

/// Source-MAC rule, always on the input path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacRule {
    pub mac: MacAddress,
    pub subnets: Vec<Cidr>,
    pub allow: bool,
    pub interface: InterfaceSpec,
    pub chain: Option<ChainRef>,
}

impl MacRule {
    pub fn target_chain(&self) -> Option<&ChainRef> {
        self.chain.as_ref().or(self.interface.chain.as_ref())
    }

    pub fn action(&self) -> Action {
        Action::from_allow(self.allow)
    }
}

/// Plain interface-scoped accept or drop
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceRule {
    pub input: Option<InterfaceName>,
    pub output: Option<InterfaceName>,
    pub direction: Direction,
    pub allow: bool,
}

impl InterfaceRule {
    pub fn action(&self) -> Action {
        Action::from_allow(self.allow)
    }
}

/// Borrowed view of one rule of a section, in append order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleRef<'a> {
    Port(&'a PortRule),
    Mac(&'a MacRule),
    Interface(&'a InterfaceRule),
    ChainCall(&'a ChainCall),
    CatchAll(Action),
}

impl RuleRef<'_> {
    /// Chain reference this rule jumps to, if any
    pub fn chain_reference(&self) -> Option<&ChainRef> {
        match self {
            RuleRef::Port(rule) => rule.target_chain(),
            RuleRef::Mac(rule) => rule.target_chain(),
            RuleRef::ChainCall(call) => Some(&call.chain),
            RuleRef::Interface(_) | RuleRef::CatchAll(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections and documents
// ═══════════════════════════════════════════════════════════════════════════

/// A group of rules appended as one contiguous block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub ports: Vec<PortRule>,
    pub macs: Vec<MacRule>,
    pub interfaces: Vec<InterfaceRule>,
    pub jump: Option<ChainCall>,
    pub action: Option<Action>,
}

impl Section {
    /// Rules in append order: ports, MACs, interface rules, chain jump, catch-all
    pub fn rules(&self) -> impl Iterator<Item = RuleRef<'_>> {
        self.ports
            .iter()
            .map(RuleRef::Port)
            .chain(self.macs.iter().map(RuleRef::Mac))
            .chain(self.interfaces.iter().map(RuleRef::Interface))
            .chain(self.jump.iter().map(RuleRef::ChainCall))
            .chain(self.action.map(RuleRef::CatchAll))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSection {
    pub name: String,
    pub section: Section,
}

/// Built-in chain policies plus MAC rules applied ahead of every section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    pub input: Option<Policy>,
    pub output: Option<Policy>,
    pub forward: Option<Policy>,
    pub macs: Vec<MacRule>,
}

impl FilterPolicy {
    /// Policies that are set, in INPUT, OUTPUT, FORWARD order
    pub fn policies(&self) -> Vec<(Direction, Policy)> {
        [
            (Direction::Input, self.input),
            (Direction::Output, self.output),
            (Direction::Forward, self.forward),
        ]
        .into_iter()
        .filter_map(|(direction, policy)| policy.map(|p| (direction, p)))
        .collect()
    }
}

/// Custom chain with its ordered rule groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDefinition {
    pub name: ChainName,
    /// Non-accept values append a terminal rule after the groups
    pub action: Action,
    pub groups: Vec<NamedSection>,
    /// Section whose `chain` block declared this chain
    pub declared_in: String,
}

impl ChainDefinition {
    pub fn rules(&self) -> impl Iterator<Item = (&str, RuleRef<'_>)> {
        self.groups
            .iter()
            .flat_map(|g| g.section.rules().map(move |r| (g.name.as_str(), r)))
    }

    /// Verdict of the terminal rule appended after the groups, if any
    pub fn default_rule(&self) -> Option<Action> {
        (self.action != Action::Accept).then_some(self.action)
    }
}

/// Fully parsed firewall document. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub filter: Option<FilterPolicy>,
    pub sections: Vec<NamedSection>,
    pub chains: Vec<ChainDefinition>,
}

impl Document {
    pub fn chain(&self, name: &str) -> Option<&ChainDefinition> {
        self.chains.iter().find(|c| c.name.as_str() == name)
    }

    /// Filter-section MAC rules, or an empty slice
    pub fn filter_macs(&self) -> &[MacRule] {
        self.filter.as_ref().map_or(&[], |f| f.macs.as_slice())
    }
}
