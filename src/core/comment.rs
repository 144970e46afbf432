//! Rule identifier comments
//!
//! Every rule the tool appends carries `-m comment --comment <id>` where
//! `<id>` is built here:
//!
//! ```text
//! YAML:<section>:<kind>:<details>:i:<in|any>:o:<out|any>:mac:<mac|any>[:chain:<name>][:subnets:<a,b,...>]
//! ```
//!
//! The string is a pure function of the rule, so re-applying a document
//! produces byte-identical comments. Removal only relies on the `YAML:`
//! prefix; the rest keeps identifiers unique within a section.

use crate::core::model::{ChainDefinition, ChainName, Cidr, InterfaceName, MacAddress, PortMatch, RuleRef};
use std::fmt::Write;

/// Prefix shared by every comment this tool writes
pub const PREFIX: &str = "YAML:";

/// Longest comment the iptables `comment` match accepts
pub const MAX_COMMENT_LEN: usize = 256;

const ANY: &str = "any";

/// True when a comment was written by this tool
pub fn is_managed(comment: &str) -> bool {
    comment.starts_with(PREFIX)
}

/// Section token for a rule inside a chain group
///
/// Uses `/`, which section names cannot contain, so group rules never share
/// a token with a top-level section or the chain's own default rule.
pub fn group_token(chain: &ChainName, group: &str) -> String {
    format!("{chain}/{group}")
}

/// Builds the identifier for one rule of `section`.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::comment::identifier;
/// use iptables_compose::core::model::{Action, RuleRef};
///
/// assert_eq!(
///     identifier("web", RuleRef::CatchAll(Action::Drop)),
///     "YAML:web:action:DROP:i:any:o:any:mac:any"
/// );
/// ```
pub fn identifier(section: &str, rule: RuleRef<'_>) -> String {
    let mut id = format!("{PREFIX}{section}:");

    match rule {
        RuleRef::Port(r) => {
            id.push_str(r.protocol.as_str());
            match &r.ports {
                PortMatch::Single(port) => {
                    let _ = write!(id, ":port:{port}");
                    if let Some(to) = r.redirect {
                        let _ = write!(id, ":forward:{to}");
                    }
                }
                PortMatch::Ranges(ranges) => {
                    let _ = write!(id, ":multiport:{}", PortMatch::range_list(ranges));
                }
            }
            push_match(&mut id, r.interface.input.as_ref(), r.interface.output.as_ref(), r.mac_source.as_ref());
            push_tail(&mut id, r.target_chain().map(|c| c.as_str()), &r.subnets);
        }
        RuleRef::Mac(r) => {
            let _ = write!(id, "mac:mac:{}", r.mac);
            push_match(&mut id, r.interface.input.as_ref(), None, Some(&r.mac));
            push_tail(&mut id, r.target_chain().map(|c| c.as_str()), &r.subnets);
        }
        RuleRef::Interface(r) => {
            let _ = write!(id, "interface:{}", r.direction.as_str());
            push_match(&mut id, r.input.as_ref(), r.output.as_ref(), None);
        }
        RuleRef::ChainCall(call) => {
            let _ = write!(id, "chain_call:{}", call.chain);
            push_match(&mut id, call.input.as_ref(), call.output.as_ref(), None);
        }
        RuleRef::CatchAll(action) => {
            let _ = write!(id, "action:{}", action.target());
            push_match(&mut id, None, None, None);
        }
    }

    id
}

/// Identifier of the terminal rule a chain gets when its default action is
/// not `accept`
pub fn chain_default_identifier(chain: &ChainDefinition) -> Option<String> {
    chain
        .default_rule()
        .map(|action| identifier(chain.name.as_str(), RuleRef::CatchAll(action)))
}

/// Identifier of the `RETURN` rule that tags a chain with no other rules,
/// so removal can still recognise it
pub fn chain_marker_identifier(chain: &ChainName) -> String {
    let mut id = format!("{PREFIX}{chain}:action:RETURN");
    push_match(&mut id, None, None, None);
    id
}

fn push_match(
    id: &mut String,
    input: Option<&InterfaceName>,
    output: Option<&InterfaceName>,
    mac: Option<&MacAddress>,
) {
    let _ = write!(
        id,
        ":i:{}:o:{}:mac:{}",
        input.map_or(ANY, InterfaceName::as_str),
        output.map_or(ANY, InterfaceName::as_str),
        mac.map_or(ANY, MacAddress::as_str),
    );
}

fn push_tail(id: &mut String, chain: Option<&str>, subnets: &[Cidr]) {
    if let Some(chain) = chain {
        let _ = write!(id, ":chain:{chain}");
    }
    if !subnets.is_empty() {
        let joined = subnets.iter().map(Cidr::as_str).collect::<Vec<_>>().join(",");
        let _ = write!(id, ":subnets:{joined}");
    }
}
