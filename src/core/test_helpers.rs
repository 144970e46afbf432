//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::document::parse_document;
use crate::core::executor::{CommandResult, CommandRunner, command_line};
use crate::core::model::Document;
use crate::system::HostProbe;
use std::path::PathBuf;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("IPTABLES_COMPOSE_IPTABLES", "iptables-legacy");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("IPTABLES_COMPOSE_IPTABLES");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// A document touching every feature: policies, filter MACs, nested chain
/// jumps, port rules, forwarding, interface rules and a catch-all.
pub const FULL_DOCUMENT: &str = r"
filter:
  input: drop
  output: accept
  forward: drop
  mac:
    - mac-source: 00:11:22:33:44:55
      allow: true
trusted:
  chain:
    - name: MAC_ETH1
      rules:
        known:
          mac:
            - mac-source: aa:bb:cc:dd:ee:ff
    - name: SSH_GUARD
      action: drop
      rules:
        office:
          ports:
            - port: 22
              subnet: [10.0.0.0/8, 192.168.0.0/16]
        lan:
          interface:
            input: eth1
            chain: MAC_ETH1
web:
  ports:
    - port: 80
    - port: 443
    - range: [1000-2000, 3000-4000]
      protocol: udp
      allow: false
redir:
  ports:
    - port: 8080
      forward: 80
entry:
  interface:
    input: eth0
    chain: SSH_GUARD
lan:
  interface:
    - input: eth2
      allow: true
fallback:
  action: drop
";

/// Parses a fixture document, panicking on error
pub fn document(yaml: &str) -> Document {
    parse_document(yaml).expect("fixture document must parse")
}

// ═══════════════════════════════════════════════════════════════════════════
// Scripted runner
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Script {
    pattern: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Records every command and answers from a script.
///
/// Scripts match on a substring of the full command line. The first match
/// wins; anything unmatched succeeds with empty output.
#[derive(Debug, Default)]
pub struct MockRunner {
    scripts: Vec<Script>,
    commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails commands containing `pattern`
    pub fn fail_when(mut self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.scripts.push(Script {
            pattern: pattern.to_string(),
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
        self
    }

    /// Answers commands containing `pattern` with `stdout`
    pub fn respond_when(mut self, pattern: &str, stdout: &str) -> Self {
        self.scripts.push(Script {
            pattern: pattern.to_string(),
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
        self
    }

    /// Command lines run so far, program included
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandResult> {
        let line = command_line(program, args);
        self.commands.lock().unwrap().push(line.clone());

        let script = self.scripts.iter().find(|s| line.contains(&s.pattern));
        Ok(match script {
            Some(s) => CommandResult {
                success: s.exit_code == 0,
                exit_code: Some(s.exit_code),
                stdout: s.stdout.clone(),
                stderr: s.stderr.clone(),
                command: line,
            },
            None => CommandResult {
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                command: line,
            },
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stateful kernel
// ═══════════════════════════════════════════════════════════════════════════

const STANDARD_TARGETS: [&str; 7] = ["ACCEPT", "DROP", "REJECT", "RETURN", "REDIRECT", "LOG", "MASQUERADE"];

#[derive(Debug, Clone)]
struct FakeChain {
    name: String,
    policy: Option<String>,
    rules: Vec<Vec<String>>,
}

impl FakeChain {
    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: Some("ACCEPT".to_string()),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeTable {
    name: String,
    chains: Vec<FakeChain>,
}

impl FakeTable {
    fn new(name: &str, builtins: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            chains: builtins.iter().map(|c| FakeChain::builtin(c)).collect(),
        }
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut FakeChain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }

    fn is_referenced(&self, name: &str) -> bool {
        self.chains
            .iter()
            .flat_map(|c| &c.rules)
            .any(|r| target_of(r) == Some(name))
    }
}

fn target_of(rule: &[String]) -> Option<&str> {
    rule.windows(2)
        .find(|w| w[0] == "-j" || w[0] == "-g")
        .map(|w| w[1].as_str())
}

type Outcome = std::result::Result<String, (i32, String)>;

fn no_such_chain() -> (i32, String) {
    (1, "iptables: No chain/target/match by that name.".to_string())
}

/// In-memory packet filter that understands the commands this crate issues.
///
/// Starts with every built-in chain at policy ACCEPT and no rules.
#[derive(Debug)]
pub struct FakeKernel {
    tables: Mutex<Vec<FakeTable>>,
    commands: Mutex<Vec<String>>,
    failures: Vec<Script>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self {
            tables: Mutex::new(vec![
                FakeTable::new("filter", &["INPUT", "FORWARD", "OUTPUT"]),
                FakeTable::new("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
                FakeTable::new("mangle", &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"]),
            ]),
            commands: Mutex::new(Vec::new()),
            failures: Vec::new(),
        }
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails commands containing `pattern` without changing state
    pub fn fail_when(mut self, pattern: &str, stderr: &str) -> Self {
        self.failures.push(Script {
            pattern: pattern.to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
        self
    }

    /// Installs a rule directly, as other software would
    pub fn seed_rule(&self, table: &str, chain: &str, spec: &[&str]) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.iter_mut().find(|t| t.name == table).unwrap();
        if table.chain_mut(chain).is_none() {
            table.chains.push(FakeChain {
                name: chain.to_string(),
                policy: None,
                rules: Vec::new(),
            });
        }
        let chain = table.chain_mut(chain).unwrap();
        chain.rules.push(spec.iter().map(ToString::to_string).collect());
    }

    /// Rules of one chain, each as a space-joined argument list
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        let tables = self.tables.lock().unwrap();
        tables
            .iter()
            .find(|t| t.name == table)
            .and_then(|t| t.chains.iter().find(|c| c.name == chain))
            .map(|c| c.rules.iter().map(|r| r.join(" ")).collect())
            .unwrap_or_default()
    }

    /// Names of every chain in a table, built-ins first
    pub fn chains(&self, table: &str) -> Vec<String> {
        let tables = self.tables.lock().unwrap();
        tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.chains.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn policy(&self, chain: &str) -> Option<String> {
        let tables = self.tables.lock().unwrap();
        tables[0]
            .chains
            .iter()
            .find(|c| c.name == chain)
            .and_then(|c| c.policy.clone())
    }

    /// Total rule count across every table
    pub fn rule_count(&self) -> usize {
        let tables = self.tables.lock().unwrap();
        tables
            .iter()
            .flat_map(|t| &t.chains)
            .map(|c| c.rules.len())
            .sum()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn dispatch(&self, args: &[String]) -> Outcome {
        let (table_name, rest) = match args {
            [flag, table, rest @ ..] if flag == "-t" => (table.as_str(), rest),
            rest => ("filter", rest),
        };
        if rest.first().map(String::as_str) == Some("--version") {
            return Ok("iptables v1.8.10 (fake)\n".to_string());
        }

        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .iter_mut()
            .find(|t| t.name == table_name)
            .ok_or((3, format!("can't initialize iptables table `{table_name}'")))?;
        let op = rest.first().map_or("", String::as_str);
        let chain_arg = rest.get(1).map(String::as_str);

        match op {
            "-N" => {
                let name = chain_arg.ok_or_else(no_such_chain)?;
                if table.chain_mut(name).is_some() {
                    return Err((1, "iptables: Chain already exists.".to_string()));
                }
                table.chains.push(FakeChain {
                    name: name.to_string(),
                    policy: None,
                    rules: Vec::new(),
                });
                Ok(String::new())
            }
            "-P" => {
                let chain = table
                    .chain_mut(chain_arg.unwrap_or_default())
                    .filter(|c| c.policy.is_some())
                    .ok_or_else(no_such_chain)?;
                chain.policy = rest.get(2).cloned();
                Ok(String::new())
            }
            "-A" => {
                let spec: Vec<String> = rest[2..].to_vec();
                if let Some(target) = target_of(&spec)
                    && !STANDARD_TARGETS.contains(&target)
                    && table.chain_mut(target).is_none()
                {
                    return Err(no_such_chain());
                }
                let chain = table
                    .chain_mut(chain_arg.unwrap_or_default())
                    .ok_or_else(no_such_chain)?;
                chain.rules.push(spec);
                Ok(String::new())
            }
            "-F" => {
                match chain_arg {
                    Some(name) => table.chain_mut(name).ok_or_else(no_such_chain)?.rules.clear(),
                    None => table.chains.iter_mut().for_each(|c| c.rules.clear()),
                }
                Ok(String::new())
            }
            "-X" => match chain_arg {
                Some(name) => {
                    let chain = table
                        .chains
                        .iter()
                        .find(|c| c.name == name && c.policy.is_none())
                        .ok_or_else(no_such_chain)?;
                    if !chain.rules.is_empty() {
                        return Err((1, "iptables: Directory not empty.".to_string()));
                    }
                    if table.is_referenced(name) {
                        return Err((1, "iptables: Too many links.".to_string()));
                    }
                    table.chains.retain(|c| c.name != name);
                    Ok(String::new())
                }
                None => {
                    if table.chains.iter().any(|c| c.policy.is_none() && !c.rules.is_empty()) {
                        return Err((1, "iptables: Directory not empty.".to_string()));
                    }
                    table.chains.retain(|c| c.policy.is_some());
                    Ok(String::new())
                }
            },
            "-D" => {
                let chain = table
                    .chain_mut(chain_arg.unwrap_or_default())
                    .ok_or_else(no_such_chain)?;
                let line: usize = rest
                    .get(2)
                    .and_then(|l| l.parse().ok())
                    .ok_or((2, "iptables v1.8.10: Invalid rule number".to_string()))?;
                if line == 0 || line > chain.rules.len() {
                    return Err((1, "iptables: Index of deletion too big.".to_string()));
                }
                chain.rules.remove(line - 1);
                Ok(String::new())
            }
            "-L" => {
                let chain = table
                    .chain_mut(chain_arg.unwrap_or_default())
                    .ok_or_else(no_such_chain)?;
                Ok(render_numbered(chain))
            }
            "-S" => Ok(render_specs(table)),
            _ => Err((2, format!("iptables v1.8.10: unknown option \"{op}\""))),
        }
    }
}

fn render_numbered(chain: &FakeChain) -> String {
    let mut out = match &chain.policy {
        Some(p) => format!("Chain {} (policy {p})\n", chain.name),
        None => format!("Chain {} (0 references)\n", chain.name),
    };
    out.push_str("num  target     prot opt source               destination\n");

    for (i, rule) in chain.rules.iter().enumerate() {
        let value = |flag: &str| {
            rule.windows(2)
                .find(|w| w[0] == flag)
                .map(|w| w[1].clone())
        };
        let target = target_of(rule).unwrap_or_default();
        let prot = value("-p").unwrap_or_else(|| "all".to_string());
        let source = value("-s").unwrap_or_else(|| "0.0.0.0/0".to_string());
        let mut extra = String::new();
        if let Some(port) = value("--dport") {
            extra.push_str(&format!("{prot} dpt:{port} "));
        }
        if let Some(ports) = value("--dports") {
            extra.push_str(&format!("multiport dports {ports} "));
        }
        if let Some(mac) = value("--mac-source") {
            extra.push_str(&format!("MAC{} ", mac.to_uppercase()));
        }
        if let Some(c) = value("--comment") {
            extra.push_str(&format!("/* {c} */ "));
        }
        out.push_str(&format!(
            "{:<4} {target:<10} {prot:<4} --  {source:<20} 0.0.0.0/0            {}\n",
            i + 1,
            extra.trim_end()
        ));
    }
    out
}

fn render_specs(table: &FakeTable) -> String {
    let mut out = String::new();
    for chain in &table.chains {
        if let Some(p) = &chain.policy {
            out.push_str(&format!("-P {} {p}\n", chain.name));
        }
    }
    for chain in table.chains.iter().filter(|c| c.policy.is_none()) {
        out.push_str(&format!("-N {}\n", chain.name));
    }
    for chain in &table.chains {
        for rule in &chain.rules {
            let mut line = format!("-A {}", chain.name);
            let mut quote_next = false;
            for arg in rule {
                if quote_next {
                    line.push_str(&format!(" \"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\"")));
                } else {
                    line.push(' ');
                    line.push_str(arg);
                }
                quote_next = arg == "--comment";
            }
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

impl CommandRunner for FakeKernel {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandResult> {
        let line = command_line(program, args);
        self.commands.lock().unwrap().push(line.clone());

        let outcome = match self.failures.iter().find(|s| line.contains(&s.pattern)) {
            Some(s) => Err((s.exit_code, s.stderr.clone())),
            None => self.dispatch(args),
        };
        Ok(match outcome {
            Ok(stdout) => CommandResult {
                success: true,
                exit_code: Some(0),
                stdout,
                stderr: String::new(),
                command: line,
            },
            Err((code, stderr)) => CommandResult {
                success: false,
                exit_code: Some(code),
                stdout: String::new(),
                stderr: format!("{stderr}\n"),
                command: line,
            },
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Host
// ═══════════════════════════════════════════════════════════════════════════

/// Host with a fixed UID and an optional iptables binary
#[derive(Debug, Clone)]
pub struct FakeHost {
    uid: u32,
    tool: Option<PathBuf>,
}

impl FakeHost {
    pub fn root() -> Self {
        Self {
            uid: 0,
            tool: Some(PathBuf::from("/usr/sbin/iptables")),
        }
    }

    pub fn root_without_tool() -> Self {
        Self { uid: 0, tool: None }
    }

    pub fn user(uid: u32) -> Self {
        Self {
            uid,
            ..Self::root()
        }
    }
}

impl HostProbe for FakeHost {
    fn effective_uid(&self) -> u32 {
        self.uid
    }

    fn find_program(&self, _name: &str) -> Option<PathBuf> {
        self.tool.clone()
    }
}
