//! Rule constraint functions
//!
//! This module centralizes the rules about valid field combinations. The
//! document parser uses the interface predicates while building the model,
//! and the validator uses the jump/verdict predicates to report blocking
//! `ChainActionConflict` warnings.
//!
//! # Examples
//!
//! ```
//! use iptables_compose::core::rule_constraints::*;
//!
//! assert!(chain_matches_input_interface("INPUT"));
//! assert!(!chain_matches_output_interface("INPUT"));
//! assert!(jump_conflicts_with_deny(true, false));
//! ```

use crate::core::model::{Action, Direction, PortMatch, RuleRef};

/// Message for a rule that both jumps to a chain and denies
pub const CHAIN_WITH_DENY: &str =
    "Cannot specify both 'chain' target and 'allow: false' - they are mutually exclusive";

/// Message for a rule that both jumps to a chain and redirects
pub const CHAIN_WITH_FORWARD: &str =
    "Cannot specify both 'chain' target and 'forward' port - they are mutually exclusive";

// ═══════════════════════════════════════════════════════════════════════════
// Interface Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if rules on this built-in chain can match `-i`.
///
/// Locally generated packets have no input interface, so OUTPUT and
/// POSTROUTING cannot match one.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::rule_constraints::chain_matches_input_interface;
///
/// assert!(chain_matches_input_interface("INPUT"));
/// assert!(chain_matches_input_interface("FORWARD"));
/// assert!(chain_matches_input_interface("PREROUTING"));
/// assert!(!chain_matches_input_interface("OUTPUT"));
/// ```
#[inline]
pub fn chain_matches_input_interface(chain: &str) -> bool {
    !matches!(chain, "OUTPUT" | "POSTROUTING")
}

/// Returns `true` if rules on this built-in chain can match `-o`.
///
/// The output interface is not known before routing, so INPUT and
/// PREROUTING cannot match one.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::rule_constraints::chain_matches_output_interface;
///
/// assert!(chain_matches_output_interface("OUTPUT"));
/// assert!(chain_matches_output_interface("FORWARD"));
/// assert!(!chain_matches_output_interface("INPUT"));
/// assert!(!chain_matches_output_interface("PREROUTING"));
/// ```
#[inline]
pub fn chain_matches_output_interface(chain: &str) -> bool {
    !matches!(chain, "INPUT" | "PREROUTING")
}

/// Checks the interfaces of a rule appended to a built-in chain.
///
/// # Errors
///
/// Returns a message naming the interface the chain cannot see.
pub fn check_interfaces(chain: &str, has_input: bool, has_output: bool) -> Result<(), String> {
    if has_input && !chain_matches_input_interface(chain) {
        return Err(format!(
            "Input interface cannot be matched on the {chain} chain"
        ));
    }
    if has_output && !chain_matches_output_interface(chain) {
        return Err(format!(
            "Output interface cannot be matched on the {chain} chain"
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Jump / Verdict Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if a jump target and `allow: false` are both present.
///
/// A rule has a single `-j`; it can hand the packet to a chain or drop it,
/// not both.
#[inline]
pub fn jump_conflicts_with_deny(has_chain: bool, allow: bool) -> bool {
    has_chain && !allow
}

/// Returns `true` if a jump target and a NAT redirect are both present.
#[inline]
pub fn jump_conflicts_with_redirect(has_chain: bool, has_redirect: bool) -> bool {
    has_chain && has_redirect
}

/// Returns `true` if the port selector can be redirected.
///
/// `REDIRECT --to-port` maps one destination port; multiport lists have no
/// single source port to map.
///
/// # Examples
///
/// ```
/// use iptables_compose::core::model::PortMatch;
/// use iptables_compose::core::rule_constraints::redirect_supported;
///
/// assert!(redirect_supported(&PortMatch::Single(80)));
/// assert!(!redirect_supported(&PortMatch::Ranges(vec!["1-2".parse().unwrap()])));
/// ```
#[inline]
pub fn redirect_supported(ports: &PortMatch) -> bool {
    matches!(ports, PortMatch::Single(_))
}

/// Returns `true` if `-P` accepts this verdict as a built-in chain policy.
///
/// The kernel only knows `ACCEPT` and `DROP` as policies; `REJECT` is a
/// target extension and fails with "Bad policy name".
#[inline]
pub fn policy_supported(policy: Action) -> bool {
    !matches!(policy, Action::Reject)
}

/// Checks one `filter` policy entry.
///
/// # Errors
///
/// Returns a message naming the direction whose policy `-P` would refuse.
pub fn check_policy(direction: Direction, policy: Action) -> Result<(), String> {
    if policy_supported(policy) {
        Ok(())
    } else {
        Err(format!(
            "Policy '{policy}' is not valid for the {} chain; built-in chain policies must be accept or drop",
            direction.chain()
        ))
    }
}

/// Returns the message for the first jump/verdict conflict of a rule.
pub fn chain_action_conflict(rule: RuleRef<'_>) -> Option<&'static str> {
    match rule {
        RuleRef::Port(r) => {
            let has_chain = r.target_chain().is_some();
            if jump_conflicts_with_redirect(has_chain, r.redirect.is_some()) {
                Some(CHAIN_WITH_FORWARD)
            } else if jump_conflicts_with_deny(has_chain, r.allow) {
                Some(CHAIN_WITH_DENY)
            } else {
                None
            }
        }
        RuleRef::Mac(r) => {
            jump_conflicts_with_deny(r.target_chain().is_some(), r.allow).then_some(CHAIN_WITH_DENY)
        }
        RuleRef::Interface(_) | RuleRef::ChainCall(_) | RuleRef::CatchAll(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{InterfaceSpec, MacRule, PortRule, Protocol};

    fn port_rule() -> PortRule {
        PortRule {
            ports: PortMatch::Single(80),
            protocol: Protocol::Tcp,
            direction: Direction::Input,
            subnets: vec![],
            redirect: None,
            allow: true,
            interface: InterfaceSpec::default(),
            mac_source: None,
            chain: None,
        }
    }

    #[test]
    fn test_check_interfaces_messages() {
        assert!(check_interfaces("INPUT", true, false).is_ok());
        assert!(check_interfaces("OUTPUT", false, true).is_ok());
        assert!(check_interfaces("FORWARD", true, true).is_ok());

        let err = check_interfaces("INPUT", false, true).unwrap_err();
        assert_eq!(err, "Output interface cannot be matched on the INPUT chain");
        let err = check_interfaces("OUTPUT", true, false).unwrap_err();
        assert_eq!(err, "Input interface cannot be matched on the OUTPUT chain");
        assert!(check_interfaces("PREROUTING", false, true).is_err());
    }

    #[test]
    fn test_port_rule_conflicts() {
        let mut rule = port_rule();
        assert_eq!(chain_action_conflict(RuleRef::Port(&rule)), None);

        rule.chain = Some("WEB".parse().unwrap());
        assert_eq!(chain_action_conflict(RuleRef::Port(&rule)), None);

        rule.allow = false;
        assert_eq!(chain_action_conflict(RuleRef::Port(&rule)), Some(CHAIN_WITH_DENY));

        rule.redirect = Some(8080);
        assert_eq!(chain_action_conflict(RuleRef::Port(&rule)), Some(CHAIN_WITH_FORWARD));
    }

    #[test]
    fn test_interface_chain_counts_as_jump() {
        let mut rule = port_rule();
        rule.interface.chain = Some("WEB".parse().unwrap());
        rule.redirect = Some(8080);
        assert_eq!(chain_action_conflict(RuleRef::Port(&rule)), Some(CHAIN_WITH_FORWARD));
    }

    #[test]
    fn test_policy_checks() {
        assert!(check_policy(Direction::Input, Action::Drop).is_ok());
        assert!(check_policy(Direction::Output, Action::Accept).is_ok());
        assert_eq!(
            check_policy(Direction::Forward, Action::Reject).unwrap_err(),
            "Policy 'reject' is not valid for the FORWARD chain; built-in chain policies must be accept or drop"
        );
    }

    #[test]
    fn test_mac_rule_conflicts() {
        let rule = MacRule {
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            subnets: vec![],
            allow: false,
            interface: InterfaceSpec::default(),
            chain: Some("MACS".parse().unwrap()),
        };
        assert_eq!(chain_action_conflict(RuleRef::Mac(&rule)), Some(CHAIN_WITH_DENY));
    }
}
