//! YAML document parsing
//!
//! Parsing happens in two steps. `serde_yaml` first fills a raw tree that
//! mirrors the document's keys, keeping top-level and chain-group order. The
//! raw tree is then converted into the typed [`model`](crate::core::model),
//! validating every leaf on the way. The first broken invariant stops
//! conversion with a [`ValidationError`].
//!
//! # Document shape
//!
//! ```yaml
//! filter:
//!   input: drop
//!   mac:
//!     - mac-source: "aa:bb:cc:dd:ee:ff"
//! web:
//!   ports:
//!     - port: 80
//!     - range: ["8000-8100"]
//!       protocol: udp
//! trusted:
//!   chain:
//!     - name: TRUSTED
//!       rules:
//!         lan:
//!           ports:
//!             - port: 22
//!               subnet: ["10.0.0.0/8"]
//! ```
//!
//! A `chain` block can be a list of chains, a `{chain: [...]}` map, or a
//! single chain map. Sections that declare chains are removed from the
//! section list and feed [`Document::chains`] instead.

use crate::core::comment;
use crate::core::error::{Error, Result, Scope, ValidationError};
use crate::core::model::{
    Action, ChainCall, ChainDefinition, ChainName, ChainRef, Cidr, Direction, Document,
    FilterPolicy, InterfaceName, InterfaceRule, InterfaceSpec, MacAddress, MacRule, NamedSection,
    PortMatch, PortRange, PortRule, Protocol, Section,
};
use crate::core::rule_constraints;
use crate::validators;
use serde::Deserialize;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Top-level key holding built-in chain policies
pub const FILTER_KEY: &str = "filter";

// ═══════════════════════════════════════════════════════════════════════════
// Raw tree
// ═══════════════════════════════════════════════════════════════════════════

/// Mapping that keeps its entries in document order
#[derive(Debug)]
struct Ordered<T>(Vec<(String, T)>);

impl<T> Default for Ordered<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Ordered<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Ordered<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of names to sections")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(Ordered::default())
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// Whole document: the `filter` key plus every other key as a section
#[derive(Debug, Default)]
struct RawDocument {
    filter: Option<RawFilter>,
    sections: Vec<(String, RawSection)>,
}

impl<'de> Deserialize<'de> for RawDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DocumentVisitor;

        impl<'de> Visitor<'de> for DocumentVisitor {
            type Value = RawDocument;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of section names to sections")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(RawDocument::default())
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut doc = RawDocument::default();
                while let Some(key) = map.next_key::<String>()? {
                    if key == FILTER_KEY {
                        if doc.filter.is_some() {
                            return Err(de::Error::duplicate_field(FILTER_KEY));
                        }
                        doc.filter = Some(map.next_value::<Option<RawFilter>>()?.unwrap_or_default());
                    } else {
                        let section = map.next_value::<Option<RawSection>>()?.unwrap_or_default();
                        doc.sections.push((key, section));
                    }
                }
                Ok(doc)
            }
        }

        deserializer.deserialize_map(DocumentVisitor)
    }
}

/// A scalar or a list of scalars
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    input: Option<Action>,
    output: Option<Action>,
    forward: Option<Action>,
    #[serde(default)]
    mac: Vec<RawMacRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInterfaceSpec {
    input: Option<String>,
    output: Option<String>,
    chain: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPortRule {
    port: Option<u32>,
    range: Option<OneOrMany<String>>,
    protocol: Option<Protocol>,
    direction: Option<Direction>,
    subnet: Option<OneOrMany<String>>,
    forward: Option<u32>,
    allow: Option<bool>,
    interface: Option<RawInterfaceSpec>,
    #[serde(rename = "mac-source")]
    mac_source: Option<String>,
    chain: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMacRule {
    #[serde(rename = "mac-source")]
    mac_source: String,
    direction: Option<Direction>,
    subnet: Option<OneOrMany<String>>,
    allow: Option<bool>,
    interface: Option<RawInterfaceSpec>,
    chain: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInterfaceRule {
    input: Option<String>,
    output: Option<String>,
    direction: Option<Direction>,
    allow: Option<bool>,
}

/// A section's `interface` key: a jump spec or a list of interface rules
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSectionInterface {
    Rules(Vec<RawInterfaceRule>),
    Jump(RawInterfaceSpec),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSection {
    #[serde(default)]
    ports: Vec<RawPortRule>,
    #[serde(default, alias = "macs")]
    mac: Vec<RawMacRule>,
    interface: Option<RawSectionInterface>,
    action: Option<Action>,
    chain: Option<RawChainBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChainDef {
    name: String,
    action: Option<Action>,
    #[serde(default)]
    rules: Ordered<Option<RawSection>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChainWrapper {
    chain: Vec<RawChainDef>,
}

/// The accepted spellings of a `chain` block
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawChainBlock {
    List(Vec<RawChainDef>),
    Wrapped(RawChainWrapper),
    Single(RawChainDef),
}

impl RawChainBlock {
    fn into_defs(self) -> Vec<RawChainDef> {
        match self {
            RawChainBlock::List(defs) | RawChainBlock::Wrapped(RawChainWrapper { chain: defs }) => {
                defs
            }
            RawChainBlock::Single(def) => vec![def],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Entry points
// ═══════════════════════════════════════════════════════════════════════════

/// Parses and validates a YAML document held in memory.
///
/// # Errors
///
/// Returns [`Error::Parse`] for malformed YAML and [`Error::Validation`] for
/// the first value that breaks a model invariant.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::document::parse_document;
///
/// let doc = parse_document("web:\n  ports:\n    - port: 80\n").unwrap();
/// assert_eq!(doc.sections[0].name, "web");
/// ```
pub fn parse_document(yaml: &str) -> Result<Document> {
    let raw: RawDocument = if is_blank(yaml) {
        RawDocument::default()
    } else {
        serde_yaml::from_str(yaml)?
    };
    let doc = Converter::default().convert(raw)?;
    check_identifiers(&doc)?;

    debug!(
        "Parsed document: {} sections, {} chain definitions",
        doc.sections.len(),
        doc.chains.len()
    );
    Ok(doc)
}

/// Reads and parses a document from disk.
///
/// # Errors
///
/// Returns [`Error::Config`] if the path is missing or not a regular file,
/// otherwise the errors of [`parse_document`].
pub fn load_document(path: &Path) -> Result<Document> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| Error::Config(format!("Config file not found: {}", path.display())))?;
    if !metadata.is_file() {
        return Err(Error::Config(format!(
            "Config path is not a regular file: {}",
            path.display()
        )));
    }

    let contents = std::fs::read_to_string(path)?;
    parse_document(&contents)
}

fn is_blank(yaml: &str) -> bool {
    yaml.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw → typed conversion
// ═══════════════════════════════════════════════════════════════════════════

/// Where a rule list sits, which decides the interface checks that apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Appended to the built-in chain named by the rule's direction
    BuiltIn,
    /// Appended to a custom chain; callers decide the traffic path
    Custom,
}

/// Error scope for one section, group, or the filter block
struct Ctx {
    scope: Scope,
    section: String,
    placement: Placement,
}

impl Ctx {
    fn err(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::new(self.scope.clone(), self.section.clone(), message)
    }

    fn rule_err(&self, index: usize, message: impl Into<String>) -> ValidationError {
        self.err(message).at_rule(index)
    }
}

#[derive(Default)]
struct Converter {
    chains: Vec<ChainDefinition>,
    chain_names: HashSet<String>,
}

impl Converter {
    fn convert(mut self, raw: RawDocument) -> std::result::Result<Document, ValidationError> {
        let filter = raw.filter.map(|f| self.convert_filter(f)).transpose()?;

        let mut sections = Vec::new();
        let mut seen = HashSet::new();
        for (name, raw_section) in raw.sections {
            let ctx = Ctx {
                scope: Scope::Section,
                section: name.clone(),
                placement: Placement::BuiltIn,
            };
            validators::validate_section_name(&name).map_err(|e| ctx.err(e))?;
            if !seen.insert(name.clone()) {
                return Err(ctx.err("Section is defined more than once"));
            }

            if let Some(block) = raw_section.chain {
                let has_rules = !raw_section.ports.is_empty()
                    || !raw_section.mac.is_empty()
                    || raw_section.interface.is_some()
                    || raw_section.action.is_some();
                if has_rules {
                    return Err(ctx.err(
                        "A section that declares chains cannot also contain rules; \
                         move the rules into a chain group",
                    ));
                }
                self.convert_chain_block(block, &name)?;
                continue;
            }

            let section = self.convert_section(raw_section, &ctx)?;
            sections.push(NamedSection { name, section });
        }

        Ok(Document {
            filter,
            sections,
            chains: self.chains,
        })
    }

    fn convert_filter(&mut self, raw: RawFilter) -> std::result::Result<FilterPolicy, ValidationError> {
        let ctx = Ctx {
            scope: Scope::Filter,
            section: FILTER_KEY.to_string(),
            placement: Placement::BuiltIn,
        };
        let macs = raw
            .mac
            .into_iter()
            .enumerate()
            .map(|(i, m)| convert_mac_rule(m, &ctx, i))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let filter = FilterPolicy {
            input: raw.input,
            output: raw.output,
            forward: raw.forward,
            macs,
        };
        for (direction, policy) in filter.policies() {
            rule_constraints::check_policy(direction, policy).map_err(|e| ctx.err(e))?;
        }
        Ok(filter)
    }

    fn convert_chain_block(
        &mut self,
        block: RawChainBlock,
        declared_in: &str,
    ) -> std::result::Result<(), ValidationError> {
        let defs = block.into_defs();
        if defs.is_empty() {
            return Err(ValidationError::new(
                Scope::Section,
                declared_in,
                "Chain block must declare at least one chain",
            ));
        }

        for def in defs {
            let name_err = |msg: String| ValidationError::new(Scope::Chain, def.name.clone(), msg);
            let name = ChainName::from_str(&def.name).map_err(name_err)?;
            if !self.chain_names.insert(name.as_str().to_string()) {
                return Err(name_err("Chain is defined more than once".to_string()));
            }

            let mut groups = Vec::with_capacity(def.rules.0.len());
            for (group, raw_section) in def.rules.0 {
                let ctx = Ctx {
                    scope: Scope::Chain,
                    section: name.as_str().to_string(),
                    placement: Placement::Custom,
                };
                validators::validate_section_name(&group)
                    .map_err(|e| ctx.err(format!("group '{group}': {e}")))?;
                if groups.iter().any(|g: &NamedSection| g.name == group) {
                    return Err(ctx.err(format!("Group '{group}' is defined more than once")));
                }

                let mut raw_section = raw_section.unwrap_or_default();
                if let Some(nested) = raw_section.chain.take() {
                    self.convert_chain_block(nested, &group)?;
                }
                let section = self.convert_section(raw_section, &ctx)?;
                groups.push(NamedSection {
                    name: group,
                    section,
                });
            }

            self.chains.push(ChainDefinition {
                name,
                action: def.action.unwrap_or_default(),
                groups,
                declared_in: declared_in.to_string(),
            });
        }
        Ok(())
    }

    fn convert_section(
        &mut self,
        raw: RawSection,
        ctx: &Ctx,
    ) -> std::result::Result<Section, ValidationError> {
        let ports = raw
            .ports
            .into_iter()
            .enumerate()
            .map(|(i, r)| convert_port_rule(r, ctx, i))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let macs = raw
            .mac
            .into_iter()
            .enumerate()
            .map(|(i, r)| convert_mac_rule(r, ctx, i))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let (interfaces, jump) = match raw.interface {
            None => (Vec::new(), None),
            Some(RawSectionInterface::Rules(rules)) => {
                let rules = rules
                    .into_iter()
                    .enumerate()
                    .map(|(i, r)| convert_interface_rule(r, ctx, i))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                (rules, None)
            }
            Some(RawSectionInterface::Jump(spec)) => (Vec::new(), Some(convert_chain_call(spec, ctx)?)),
        };

        Ok(Section {
            ports,
            macs,
            interfaces,
            jump,
            action: raw.action,
        })
    }
}

fn parse_subnets(
    raw: Option<OneOrMany<String>>,
    ctx: &Ctx,
    index: usize,
) -> std::result::Result<Vec<Cidr>, ValidationError> {
    raw.map(OneOrMany::into_vec)
        .unwrap_or_default()
        .iter()
        .map(|s| s.parse::<Cidr>().map_err(|e| ctx.rule_err(index, e)))
        .collect()
}

fn parse_interface(
    name: Option<String>,
    ctx: &Ctx,
    index: Option<usize>,
) -> std::result::Result<Option<InterfaceName>, ValidationError> {
    name.map(|n| {
        n.parse::<InterfaceName>().map_err(|e| match index {
            Some(i) => ctx.rule_err(i, e),
            None => ctx.err(e),
        })
    })
    .transpose()
}

fn parse_chain_ref(
    name: Option<String>,
    ctx: &Ctx,
    index: Option<usize>,
) -> std::result::Result<Option<ChainRef>, ValidationError> {
    name.map(|n| {
        n.parse::<ChainRef>().map_err(|e| match index {
            Some(i) => ctx.rule_err(i, e),
            None => ctx.err(e),
        })
    })
    .transpose()
}

fn convert_interface_spec(
    raw: Option<RawInterfaceSpec>,
    ctx: &Ctx,
    index: usize,
) -> std::result::Result<InterfaceSpec, ValidationError> {
    let raw = raw.unwrap_or_default();
    Ok(InterfaceSpec {
        input: parse_interface(raw.input, ctx, Some(index))?,
        output: parse_interface(raw.output, ctx, Some(index))?,
        chain: parse_chain_ref(raw.chain, ctx, Some(index))?,
    })
}

fn convert_port_rule(
    raw: RawPortRule,
    ctx: &Ctx,
    index: usize,
) -> std::result::Result<PortRule, ValidationError> {
    let err = |msg: String| ctx.rule_err(index, msg);

    let ports = match (raw.port, raw.range) {
        (Some(_), Some(_)) => {
            return Err(err(
                "Cannot specify both 'port' and 'range' - they are mutually exclusive".into(),
            ));
        }
        (None, None) => return Err(err("Either 'port' or 'range' must be specified".into())),
        (Some(port), None) => PortMatch::Single(validators::validate_port(port).map_err(err)?),
        (None, Some(ranges)) => {
            let ranges = ranges
                .into_vec()
                .iter()
                .map(|r| r.parse::<PortRange>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(err)?;
            if ranges.is_empty() {
                return Err(err("Port range list cannot be empty".into()));
            }
            PortMatch::Ranges(ranges)
        }
    };

    let direction = raw.direction.unwrap_or_default();
    let redirect = raw
        .forward
        .map(|p| validators::validate_port(p).map_err(|e| err(format!("forward: {e}"))))
        .transpose()?;

    if redirect.is_some() {
        if !rule_constraints::redirect_supported(&ports) {
            return Err(err("Port forwarding requires a single 'port', not 'range'".into()));
        }
        if direction != Direction::Input {
            return Err(err("Port forwarding is only supported for the input direction".into()));
        }
        if ctx.placement == Placement::Custom {
            return Err(err("Port forwarding is not supported inside chain definitions".into()));
        }
    }

    let interface = convert_interface_spec(raw.interface, ctx, index)?;
    if ctx.placement == Placement::BuiltIn {
        let chain = if redirect.is_some() {
            "PREROUTING"
        } else {
            direction.chain()
        };
        rule_constraints::check_interfaces(chain, interface.input.is_some(), interface.output.is_some())
            .map_err(err)?;
    }

    Ok(PortRule {
        ports,
        protocol: raw.protocol.unwrap_or_default(),
        direction,
        subnets: parse_subnets(raw.subnet, ctx, index)?,
        redirect,
        allow: raw.allow.unwrap_or(true),
        interface,
        mac_source: raw
            .mac_source
            .map(|m| m.parse::<MacAddress>())
            .transpose()
            .map_err(err)?,
        chain: parse_chain_ref(raw.chain, ctx, Some(index))?,
    })
}

fn convert_mac_rule(
    raw: RawMacRule,
    ctx: &Ctx,
    index: usize,
) -> std::result::Result<MacRule, ValidationError> {
    let err = |msg: String| ctx.rule_err(index, msg);

    let mac = raw.mac_source.parse::<MacAddress>().map_err(err)?;
    if raw.direction.is_some_and(|d| d != Direction::Input) {
        return Err(err("MAC rules only support the input direction".into()));
    }

    let interface = convert_interface_spec(raw.interface, ctx, index)?;
    if interface.output.is_some() {
        return Err(err("MAC rules can only match an input interface".into()));
    }

    Ok(MacRule {
        mac,
        subnets: parse_subnets(raw.subnet, ctx, index)?,
        allow: raw.allow.unwrap_or(true),
        interface,
        chain: parse_chain_ref(raw.chain, ctx, Some(index))?,
    })
}

fn convert_interface_rule(
    raw: RawInterfaceRule,
    ctx: &Ctx,
    index: usize,
) -> std::result::Result<InterfaceRule, ValidationError> {
    let input = parse_interface(raw.input, ctx, Some(index))?;
    let output = parse_interface(raw.output, ctx, Some(index))?;
    if input.is_none() && output.is_none() {
        return Err(ctx.rule_err(
            index,
            "At least one interface (input or output) must be specified",
        ));
    }

    let direction = raw.direction.unwrap_or_default();
    if ctx.placement == Placement::BuiltIn {
        rule_constraints::check_interfaces(direction.chain(), input.is_some(), output.is_some())
            .map_err(|e| ctx.rule_err(index, e))?;
    }

    Ok(InterfaceRule {
        input,
        output,
        direction,
        allow: raw.allow.unwrap_or(true),
    })
}

fn convert_chain_call(
    raw: RawInterfaceSpec,
    ctx: &Ctx,
) -> std::result::Result<ChainCall, ValidationError> {
    let input = parse_interface(raw.input, ctx, None)?;
    let output = parse_interface(raw.output, ctx, None)?;
    let chain = parse_chain_ref(raw.chain, ctx, None)?
        .ok_or_else(|| ctx.err("Interface configuration must specify a chain target"))?;

    Ok(ChainCall {
        input,
        output,
        chain,
    })
}

/// Rejects identifier collisions inside one section and identifiers too
/// long for the comment match.
fn check_identifiers(doc: &Document) -> std::result::Result<(), ValidationError> {
    let check = |scope: Scope, label: &str, ids: Vec<(usize, String)>| {
        let mut seen = HashSet::new();
        for (index, id) in ids {
            let err = || ValidationError::new(scope.clone(), label, "").at_rule(index);
            if id.len() > comment::MAX_COMMENT_LEN {
                return Err(ValidationError {
                    message: format!(
                        "Rule identifier exceeds {} bytes: {id}",
                        comment::MAX_COMMENT_LEN
                    ),
                    ..err()
                });
            }
            if !seen.insert(id.clone()) {
                return Err(ValidationError {
                    message: format!(
                        "Two rules produce the same identifier '{id}'; \
                         move one of them to another section"
                    ),
                    ..err()
                });
            }
        }
        Ok(())
    };

    if let Some(filter) = &doc.filter {
        let ids = filter
            .macs
            .iter()
            .enumerate()
            .map(|(i, m)| (i, comment::identifier(FILTER_KEY, crate::core::model::RuleRef::Mac(m))))
            .collect();
        check(Scope::Filter, FILTER_KEY, ids)?;
    }

    for named in &doc.sections {
        let ids = named
            .section
            .rules()
            .enumerate()
            .map(|(i, r)| (i, comment::identifier(&named.name, r)))
            .collect();
        check(Scope::Section, &named.name, ids)?;
    }

    for chain in &doc.chains {
        let mut ids: Vec<(usize, String)> = chain
            .rules()
            .enumerate()
            .map(|(i, (group, r))| (i, comment::identifier(&comment::group_token(&chain.name, group), r)))
            .collect();
        if let Some(id) = comment::chain_default_identifier(chain) {
            ids.push((ids.len(), id));
        }
        check(Scope::Chain, chain.name.as_str(), ids)?;
    }

    Ok(())
}
