//! Claude CLI process classification.
//!
//! Classification is an ordered list of named predicate rules over a raw
//! process record; the first rule that returns a verdict decides. The
//! decision is a pure function of (command line, working directory,
//! pid-vs-self), so rules can be unit-tested and reordered independently.
//!
//! The classifier fails safe: anything that does not match an approved
//! invocation pattern is rejected, including processes whose path or argv
//! merely contains the product name as a substring.

use crate::collect::{ProcessTable, RawProcess};
use ct_common::ProcessId;
use std::collections::{HashMap, HashSet, VecDeque};

/// Classification decision for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// A named classification rule.
///
/// Returns `Some(verdict)` when the rule decides, `None` to fall through.
pub struct Rule {
    pub name: &'static str,
    pub check: fn(&RawProcess, ProcessId) -> Option<Verdict>,
}

/// Desktop-app process markers that must never be monitored.
const GUI_MARKERS: &[&str] = &["Claude.app", "Claude Helper", "chrome_crashpad", "Squirrel"];

/// Package runners that execute a package binary directly.
const PACKAGE_RUNNERS: &[&str] = &["npx", "bunx", "pnpx"];

/// Package managers with an exec subcommand.
const PACKAGE_MANAGERS: &[&str] = &["npm", "pnpm", "yarn", "bun"];

/// Script interpreters the CLI ships under.
const INTERPRETERS: &[&str] = &["node", "bun"];

/// The classification rules, in decision order.
pub fn rules() -> &'static [Rule] {
    const RULES: &[Rule] = &[
        Rule {
            name: "own-process",
            check: rule_own_process,
        },
        Rule {
            name: "gui-variant",
            check: rule_gui_variant,
        },
        Rule {
            name: "direct-cli",
            check: rule_direct_cli,
        },
        Rule {
            name: "package-runner",
            check: rule_package_runner,
        },
        Rule {
            name: "package-manager",
            check: rule_package_manager,
        },
        Rule {
            name: "interpreter",
            check: rule_interpreter,
        },
    ];
    RULES
}

fn rule_own_process(proc: &RawProcess, self_pid: ProcessId) -> Option<Verdict> {
    (proc.pid == self_pid).then_some(Verdict::Reject)
}

fn rule_gui_variant(proc: &RawProcess, _self_pid: ProcessId) -> Option<Verdict> {
    let cmd = proc.cmdline_str();
    GUI_MARKERS
        .iter()
        .any(|m| cmd.contains(m))
        .then_some(Verdict::Reject)
}

fn rule_direct_cli(proc: &RawProcess, _self_pid: ProcessId) -> Option<Verdict> {
    (basename(proc.cmdline.first()?) == "claude").then_some(Verdict::Accept)
}

fn rule_package_runner(proc: &RawProcess, _self_pid: ProcessId) -> Option<Verdict> {
    let argv0 = basename(proc.cmdline.first()?);
    if !PACKAGE_RUNNERS.contains(&argv0) {
        return None;
    }
    let target = first_non_flag(&proc.cmdline[1..])?;
    is_agent_package(target).then_some(Verdict::Accept)
}

fn rule_package_manager(proc: &RawProcess, _self_pid: ProcessId) -> Option<Verdict> {
    let argv0 = basename(proc.cmdline.first()?);
    if !PACKAGE_MANAGERS.contains(&argv0) {
        return None;
    }
    let subcommand = proc.cmdline.get(1)?;
    if subcommand != "exec" && subcommand != "x" {
        return None;
    }
    let target = first_non_flag(&proc.cmdline[2..])?;
    is_agent_package(target).then_some(Verdict::Accept)
}

fn rule_interpreter(proc: &RawProcess, _self_pid: ProcessId) -> Option<Verdict> {
    let argv0 = basename(proc.cmdline.first()?);
    if !INTERPRETERS.contains(&argv0) {
        return None;
    }
    let script = first_non_flag(&proc.cmdline[1..])?;
    is_agent_entry_point(script).then_some(Verdict::Accept)
}

/// Classify one raw process record.
///
/// Pure function of the record and the monitor's own pid; the default when
/// no rule decides is `Reject`.
pub fn classify(proc: &RawProcess, self_pid: ProcessId) -> Verdict {
    classify_with_rule(proc, self_pid).1
}

/// Classify and report which rule decided (for diagnostics and rule tests).
pub fn classify_with_rule(proc: &RawProcess, self_pid: ProcessId) -> (&'static str, Verdict) {
    for rule in rules() {
        if let Some(verdict) = (rule.check)(proc, self_pid) {
            return (rule.name, verdict);
        }
    }
    ("default", Verdict::Reject)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn first_non_flag(args: &[String]) -> Option<&str> {
    args.iter()
        .map(String::as_str)
        .find(|arg| !arg.starts_with('-'))
}

/// Whether a package-runner target names the agent package.
fn is_agent_package(target: &str) -> bool {
    target == "claude"
        || target.starts_with("claude@")
        || target == "@anthropic-ai/claude-code"
        || target.starts_with("@anthropic-ai/claude-code@")
}

/// Whether a script path is the agent's own entry point.
fn is_agent_entry_point(script: &str) -> bool {
    let name = basename(script);
    name == "claude" || name == "claude.js" || script.contains("@anthropic-ai/claude-code/")
}

/// Subprocess tree for all accepted roots, rebuilt from scratch each cycle.
///
/// Rebuilding (never patching) keeps the map consistent with process
/// reparenting. A descendant that is itself an accepted root is excluded
/// from its ancestor's group, and descent stops there: each instance owns
/// its own subtree and totals are never double counted.
pub fn build_subprocess_map(
    table: &ProcessTable,
    roots: &HashSet<ProcessId>,
) -> HashMap<ProcessId, Vec<ProcessId>> {
    let mut children_of: HashMap<ProcessId, Vec<ProcessId>> = HashMap::new();
    for proc in &table.processes {
        children_of.entry(proc.ppid).or_default().push(proc.pid);
    }

    let mut map = HashMap::new();
    for &root in roots {
        let mut descendants = Vec::new();
        let mut queue: VecDeque<ProcessId> = VecDeque::new();
        queue.push_back(root);

        while let Some(pid) = queue.pop_front() {
            let Some(kids) = children_of.get(&pid) else {
                continue;
            };
            for &kid in kids {
                if roots.contains(&kid) {
                    continue;
                }
                descendants.push(kid);
                queue.push_back(kid);
            }
        }

        descendants.sort_unstable();
        map.insert(root, descendants);
    }

    map
}
