//! Command allowlist
//!
//! Default-deny gate that every execute request passes before a process is
//! created. A command line is split at the first whitespace into a command name
//! and a single untokenized arguments string; the name must appear in the
//! allow table and must not appear in the blocklist, and the arguments string
//! must satisfy the entry's [`ArgPolicy`].

use regex::Regex;
use std::sync::OnceLock;

/// Names that are refused even if an allow entry exists for them.
pub const BLOCKED_COMMANDS: &[&str] = &[
    "rm",
    "rmdir",
    "dd",
    "mkfs",
    "fdisk",
    "sudo",
    "su",
    "chmod",
    "chown",
    "chgrp",
    "kill",
    "killall",
    "pkill",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "passwd",
    "useradd",
    "userdel",
    "usermod",
    "iptables",
    "ufw",
    "firewall-cmd",
    "curl",
    "wget",
    "nc",
    "netcat",
    "telnet",
    "ssh",
    "scp",
    "sftp",
    "rsync",
    "mount",
    "umount",
    "systemctl",
    "service",
];

/// What a command accepts after its name
#[derive(Debug, Clone)]
pub enum ArgPolicy {
    /// Bare command only
    NoArgs,
    /// Anything goes
    Any,
    /// The whole arguments string must match one of these
    Patterns(Vec<Regex>),
}

#[derive(Debug, Clone)]
pub struct AllowedCommandSpec {
    pub name: String,
    pub description: String,
    pub policy: ArgPolicy,
}

impl AllowedCommandSpec {
    pub fn new(name: &str, description: &str, policy: ArgPolicy) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            policy,
        }
    }

    /// Build a pattern-restricted entry. Each pattern is anchored to the full
    /// arguments string, so `status` never matches `status; rm -rf /`.
    pub fn with_patterns(
        name: &str,
        description: &str,
        patterns: &[&str],
    ) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(name, description, ArgPolicy::Patterns(compiled)))
    }
}

/// Outcome of [`Allowlist::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Immutable allow table plus blocklist.
#[derive(Debug, Clone)]
pub struct Allowlist {
    commands: Vec<AllowedCommandSpec>,
    blocked: Vec<String>,
}

impl Allowlist {
    pub fn new(commands: Vec<AllowedCommandSpec>, blocked: &[&str]) -> Self {
        Self {
            commands,
            blocked: blocked.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The process-wide built-in table, compiled on first use.
    pub fn builtin() -> &'static Allowlist {
        static BUILTIN: OnceLock<Allowlist> = OnceLock::new();
        BUILTIN.get_or_init(|| Allowlist::new(builtin_commands(), BLOCKED_COMMANDS))
    }

    pub fn validate(&self, command_line: &str) -> ValidationResult {
        let (name, args) = split_command(command_line);

        if self.is_blocked(name) {
            return ValidationResult::deny(format!(
                "Command '{}' is blocked for security reasons",
                name
            ));
        }

        let spec = match self.commands.iter().find(|c| c.name == name) {
            Some(spec) => spec,
            None => {
                return ValidationResult::deny(format!(
                    "Command '{}' is not in the allowlist",
                    name
                ))
            }
        };

        if args.is_empty() {
            return ValidationResult::allow();
        }

        match &spec.policy {
            ArgPolicy::Any => ValidationResult::allow(),
            ArgPolicy::Patterns(patterns) if !patterns.is_empty() => {
                if patterns.iter().any(|p| p.is_match(args)) {
                    ValidationResult::allow()
                } else {
                    ValidationResult::deny(format!(
                        "Arguments '{}' are not allowed for command '{}'",
                        args, name
                    ))
                }
            }
            _ => ValidationResult::deny(format!("Command '{}' does not accept arguments", name)),
        }
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        self.blocked.iter().any(|b| b == name)
    }

    pub fn commands(&self) -> &[AllowedCommandSpec] {
        &self.commands
    }

    pub fn blocked(&self) -> &[String] {
        &self.blocked
    }
}

/// The command name part of a command line.
pub fn command_name(command_line: &str) -> &str {
    split_command(command_line).0
}

/// Split at the first whitespace. The remainder is trimmed but not tokenized.
fn split_command(command_line: &str) -> (&str, &str) {
    let trimmed = command_line.trim();
    match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim()),
        None => (trimmed, ""),
    }
}

fn builtin_commands() -> Vec<AllowedCommandSpec> {
    use ArgPolicy::{Any, NoArgs};

    let mut commands = vec![
        // File system navigation and inspection
        AllowedCommandSpec::new("ls", "List directory contents", Any),
        AllowedCommandSpec::new("pwd", "Print working directory", NoArgs),
        AllowedCommandSpec::new("cat", "Display file contents", Any),
        AllowedCommandSpec::new("head", "Display first lines of file", Any),
        AllowedCommandSpec::new("tail", "Display last lines of file", Any),
        AllowedCommandSpec::new("find", "Find files", Any),
        AllowedCommandSpec::new("tree", "Display directory tree", Any),
        // Text processing
        AllowedCommandSpec::new("grep", "Search text patterns", Any),
        AllowedCommandSpec::new("wc", "Count words, lines, bytes", Any),
        AllowedCommandSpec::new("sort", "Sort lines of text", Any),
        AllowedCommandSpec::new("uniq", "Report or omit repeated lines", Any),
        // System info
        AllowedCommandSpec::new("whoami", "Print current user", NoArgs),
        AllowedCommandSpec::new("date", "Display or set date", Any),
        AllowedCommandSpec::new("uptime", "Show system uptime", NoArgs),
        AllowedCommandSpec::new("uname", "Print system information", Any),
        AllowedCommandSpec::new("hostname", "Show system hostname", NoArgs),
    ];

    let restricted: [(&str, &str, &[&str]); 3] = [
        (
            "git",
            "Version control (safe commands only)",
            &[
                r"status",
                r"log(\s+.*)?",
                r"diff(\s+.*)?",
                r"branch(\s+.*)?",
                r"show(\s+.*)?",
                r"blame(\s+.*)?",
                r"rev-parse(\s+.*)?",
                r"ls-files(\s+.*)?",
                r"remote(\s+-v)?",
                r"config(\s+--list)?",
            ],
        ),
        ("node", "Node.js (version only)", &[r"--version", r"-v"]),
        (
            "npm",
            "Node package manager (safe commands only)",
            &[
                r"--version",
                r"-v",
                r"list(\s+.*)?",
                r"ls(\s+.*)?",
                r"view(\s+.*)?",
                r"show(\s+.*)?",
                r"outdated",
                r"run\s+\w+",
                r"test",
                r"install(\s+.*)?",
                r"i(\s+.*)?",
            ],
        ),
    ];
    for (name, description, patterns) in restricted {
        match AllowedCommandSpec::with_patterns(name, description, patterns) {
            Ok(spec) => commands.push(spec),
            // A bad built-in pattern leaves the command denied rather than open.
            Err(e) => tracing::error!("Dropping allowlist entry '{}': {}", name, e),
        }
    }

    commands.extend([
        AllowedCommandSpec::new("npx", "Execute npm package binaries", Any),
        // Development tools
        AllowedCommandSpec::new("echo", "Display text", Any),
        AllowedCommandSpec::new("which", "Locate command", Any),
        AllowedCommandSpec::new("env", "Show environment variables", NoArgs),
        AllowedCommandSpec::new("printenv", "Print environment variables", Any),
    ]);
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(line: &str) -> bool {
        Allowlist::builtin().validate(line).allowed
    }

    #[test]
    fn unknown_commands_are_denied() {
        for line in ["python3 -c 1", "bash", "vim file.txt", ""] {
            let result = Allowlist::builtin().validate(line);
            assert!(!result.allowed, "{line:?} should be denied");
            assert!(result.reason.unwrap().contains("not in the allowlist"));
        }
    }

    #[test]
    fn blocklist_wins_over_allow_entry() {
        let list = Allowlist::new(
            vec![AllowedCommandSpec::new("rm", "remove", ArgPolicy::Any)],
            BLOCKED_COMMANDS,
        );
        let result = list.validate("rm -rf /");
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("blocked"));
        assert!(!allowed("sudo ls"));
        assert!(!allowed("curl http://example.com"));
    }

    #[test]
    fn any_policy_accepts_with_and_without_args() {
        assert!(allowed("ls"));
        assert!(allowed("ls -la"));
        assert!(allowed("  ls   -la  "));
    }

    #[test]
    fn no_arg_commands_reject_arguments() {
        assert!(allowed("pwd"));
        let result = Allowlist::builtin().validate("pwd -P");
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("does not accept arguments"));
    }

    #[test]
    fn git_is_restricted_to_read_only_subcommands() {
        assert!(allowed("git status"));
        assert!(allowed("git log --oneline -5"));
        assert!(allowed("git remote -v"));
        assert!(allowed("git"));

        let result = Allowlist::builtin().validate("git push origin main");
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("'push origin main'"));
    }

    #[test]
    fn patterns_match_the_whole_argument_string() {
        // Prefix and suffix smuggling must both fail.
        assert!(!allowed("git status --porcelain; rm -rf ~"));
        assert!(!allowed("git xstatus"));
        assert!(!allowed("git remote add evil https://x"));
        assert!(!allowed("node --version --eval 1"));
        assert!(allowed("npm run build"));
        assert!(!allowed("npm run build && curl x"));
    }

    #[test]
    fn empty_pattern_set_behaves_like_no_args() {
        let list = Allowlist::new(
            vec![AllowedCommandSpec::new("tool", "t", ArgPolicy::Patterns(Vec::new()))],
            &[],
        );
        assert!(list.validate("tool").allowed);
        assert!(!list.validate("tool --flag").allowed);
    }
}
