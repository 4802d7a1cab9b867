//! In-memory host used by tests in place of the real ipset/iptables/pidof
//!
//! Exit codes and stderr text mirror what the real tools print, so the
//! stores' output classification is exercised end to end.

use super::{command_line, CommandOutput, CommandRunner, PlatformError};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

type Hook = Box<dyn FnMut(&str) -> Option<CommandOutput> + Send>;

const NO_SUCH_SET: &str = "ipset v7.15: The set with the given name does not exist";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

#[derive(Debug, Clone)]
struct FakeSet {
    kind: String,
    members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakeRule {
    table: String,
    chain: String,
    spec: Vec<String>,
}

#[derive(Default)]
struct HostState {
    sets: BTreeMap<String, FakeSet>,
    rules: Vec<FakeRule>,
    processes: BTreeSet<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeHost {
    state: Mutex<HostState>,
    hook: Mutex<Option<Hook>>,
}

pub(crate) fn failure(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install a hook that sees every command line before it executes.
    /// Returning `Some` replaces the simulated result.
    pub(crate) fn on_command<F>(&self, hook: F)
    where
        F: FnMut(&str) -> Option<CommandOutput> + Send + 'static,
    {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn clear_hook(&self) {
        *self.hook.lock().unwrap() = None;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn has_set(&self, name: &str) -> bool {
        self.state.lock().unwrap().sets.contains_key(name)
    }

    pub(crate) fn members(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sets
            .get(name)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub(crate) fn insert_member(&self, name: &str, entry: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.sets.get_mut(name) {
            set.members.push(entry.to_string());
        }
    }

    /// Number of rules in `table`/`chain` referencing `set_name`
    pub(crate) fn rule_count(&self, table: &str, chain: &str, set_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .rules
            .iter()
            .filter(|r| r.table == table && r.chain == chain && r.spec.iter().any(|a| a == set_name))
            .count()
    }

    /// Delete rules behind the stores' back, as another firewall manager would
    pub(crate) fn drop_rules_for_set(&self, set_name: &str) {
        self.state
            .lock()
            .unwrap()
            .rules
            .retain(|r| !r.spec.iter().any(|a| a == set_name));
    }

    pub(crate) fn start_process(&self, name: &str) {
        self.state.lock().unwrap().processes.insert(name.to_string());
    }

    pub(crate) fn is_process_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().processes.contains(name)
    }

    fn simulate(&self, program: &str, args: &[&str]) -> Result<CommandOutput, PlatformError> {
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        let mut state = self.state.lock().unwrap();
        match name {
            "ipset" => Ok(ipset(&mut state, args)),
            "iptables" => Ok(iptables(&mut state, args)),
            "pidof" => Ok(match args.first() {
                Some(p) if state.processes.contains(*p) => ok("4242\n"),
                _ => CommandOutput {
                    code: Some(1),
                    ..Default::default()
                },
            }),
            "pkill" => Ok(match args.first() {
                Some(p) if state.processes.remove(*p) => ok(""),
                _ => CommandOutput {
                    code: Some(1),
                    ..Default::default()
                },
            }),
            _ => Err(PlatformError::CommandNotFound(program.to_string())),
        }
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, PlatformError> {
        let line = command_line(program, args);
        self.state.lock().unwrap().calls.push(line.clone());

        // The hook runs without the state lock held so it may inspect the host.
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            if let Some(output) = hook(&line) {
                return Ok(output);
            }
        }
        self.simulate(program, args)
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32, PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(command_line(program, args));
        state.processes.insert(program.to_string());
        Ok(4242)
    }
}

fn parse_member(entry: &str) -> Option<IpAddr> {
    entry
        .parse::<IpAddr>()
        .ok()
        .or_else(|| entry.parse::<IpNet>().ok().map(|n| n.addr()))
}

fn ipset(state: &mut HostState, args: &[&str]) -> CommandOutput {
    let exist = args.contains(&"-exist");
    match args {
        ["create", name, kind, ..] => {
            if *kind != "hash:ip" && *kind != "hash:net" {
                return failure(1, &format!("ipset v7.15: Syntax error: typename '{}' is unknown", kind));
            }
            if state.sets.contains_key(*name) {
                if exist {
                    return ok("");
                }
                return failure(
                    1,
                    "ipset v7.15: Set cannot be created: set with the same name already exists",
                );
            }
            state.sets.insert(
                name.to_string(),
                FakeSet {
                    kind: kind.to_string(),
                    members: Vec::new(),
                },
            );
            ok("")
        }
        ["add", name, entry, ..] => {
            let Some(set) = state.sets.get_mut(*name) else {
                return failure(1, NO_SUCH_SET);
            };
            match parse_member(entry) {
                Some(IpAddr::V4(_)) => {}
                _ => {
                    return failure(
                        1,
                        &format!(
                            "ipset v7.15: Syntax error: cannot parse {}: resolving to IPv4 address failed",
                            entry
                        ),
                    );
                }
            }
            if set.members.iter().any(|m| m == entry) {
                if exist {
                    return ok("");
                }
                return failure(1, "ipset v7.15: Element cannot be added to the set: it's already added");
            }
            set.members.push(entry.to_string());
            ok("")
        }
        ["del", name, entry, ..] => {
            let Some(set) = state.sets.get_mut(*name) else {
                return failure(1, NO_SUCH_SET);
            };
            match set.members.iter().position(|m| m == entry) {
                Some(idx) => {
                    set.members.remove(idx);
                    ok("")
                }
                None => failure(
                    1,
                    "ipset v7.15: Element cannot be deleted from the set: it's not added",
                ),
            }
        }
        ["list", name, rest @ ..] => {
            let Some(set) = state.sets.get(*name) else {
                return failure(1, NO_SUCH_SET);
            };
            let references = state
                .rules
                .iter()
                .filter(|r| r.spec.iter().any(|a| a == name))
                .count();
            let mut out = format!(
                "Name: {}\nType: {}\nRevision: 6\nHeader: family inet hashsize 1024 maxelem 65536 bucketsize 12\nSize in memory: 200\nReferences: {}\nNumber of entries: {}\nMembers:\n",
                name,
                set.kind,
                references,
                set.members.len()
            );
            if !rest.contains(&"-terse") {
                for member in &set.members {
                    out.push_str(member);
                    out.push('\n');
                }
            }
            ok(out)
        }
        ["destroy", name] => {
            if !state.sets.contains_key(*name) {
                return failure(1, NO_SUCH_SET);
            }
            if state.rules.iter().any(|r| r.spec.iter().any(|a| a == name)) {
                return failure(
                    1,
                    "ipset v7.15: Set cannot be destroyed: it is in use by a kernel component",
                );
            }
            state.sets.remove(*name);
            ok("")
        }
        _ => failure(1, "ipset v7.15: Syntax error: unknown command"),
    }
}

fn iptables(state: &mut HostState, args: &[&str]) -> CommandOutput {
    let mut rest = args;
    if let ["-w", _, tail @ ..] = rest {
        rest = tail;
    }
    let ["-t", table, op, chain, spec @ ..] = rest else {
        return failure(2, "iptables v1.8.7 (legacy): unknown arguments");
    };

    if let Some(pos) = spec.iter().position(|a| *a == "--match-set") {
        if let Some(set) = spec.get(pos + 1) {
            if !state.sets.contains_key(*set) {
                return failure(
                    2,
                    &format!(
                        "iptables v1.8.7 (legacy): Set {} doesn't exist.\n\nTry `iptables -h' or 'iptables --help' for more information.",
                        set
                    ),
                );
            }
        }
    }

    let rule = FakeRule {
        table: table.to_string(),
        chain: chain.to_string(),
        spec: spec.iter().map(|s| s.to_string()).collect(),
    };
    match *op {
        "-C" => {
            if state.rules.contains(&rule) {
                ok("")
            } else {
                failure(1, BAD_RULE)
            }
        }
        "-A" => {
            state.rules.push(rule);
            ok("")
        }
        "-D" => match state.rules.iter().position(|r| *r == rule) {
            Some(idx) => {
                state.rules.remove(idx);
                ok("")
            }
            None => failure(1, BAD_RULE),
        },
        _ => failure(2, "iptables v1.8.7 (legacy): unknown option"),
    }
}
