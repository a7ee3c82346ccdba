// ABOUTME: Dangerous-command filter — quote-aware command parsing and glob-signature matching.
// ABOUTME: Classifies commands as Safe or Dangerous(category) independent of any grant.

use std::fmt;
use std::path::Path;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read pattern file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse pattern file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid glob '{glob}': {source}")]
    InvalidGlob {
        glob: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Broad family a dangerous command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DangerCategory {
    DestructiveFilesystem,
    PrivilegeModification,
    SystemPower,
    ProcessKill,
    NetworkExposure,
    /// Nested deeper than the parser follows, so the inner commands were not all seen.
    Obfuscation,
}

impl fmt::Display for DangerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DangerCategory::DestructiveFilesystem => "destructive-filesystem",
            DangerCategory::PrivilegeModification => "privilege-modification",
            DangerCategory::SystemPower => "system-power",
            DangerCategory::ProcessKill => "process-kill",
            DangerCategory::NetworkExposure => "network-exposure",
            DangerCategory::Obfuscation => "obfuscation",
        };
        f.write_str(s)
    }
}

/// What part of a command a pattern inspects. All globs match lowercase text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Signature {
    /// One segment whose executable basename matches, optionally with any argument matching.
    Segment {
        executable: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arg: Option<String>,
    },
    /// A segment piped (directly or further down the pipeline) into a matching executable.
    Pipe { from: String, into: String },
    /// The whole command with all whitespace removed.
    Text { glob: String },
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Segment { executable, arg: Some(arg) } => write!(f, "{executable} {arg}"),
            Signature::Segment { executable, arg: None } => f.write_str(executable),
            Signature::Pipe { from, into } => write!(f, "{from} | {into}"),
            Signature::Text { glob } => f.write_str(glob),
        }
    }
}

/// A blocking rule: commands matching `signature` are dangerous in `category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerousPattern {
    pub category: DangerCategory,
    #[serde(flatten)]
    pub signature: Signature,
}

/// Extra patterns loaded from disk. Entries only ever add to the built-in set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternsFile {
    pub version: u32,
    #[serde(default)]
    pub patterns: Vec<DangerousPattern>,
}

impl PatternsFile {
    /// Load extra patterns. A missing file means no extras.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Ok(Self {
                version: 1,
                patterns: Vec::new(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// The filter's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Safe,
    Dangerous(DangerMatch),
}

impl Classification {
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Classification::Dangerous(_))
    }
}

/// Which rule fired for a dangerous command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DangerMatch {
    pub category: DangerCategory,
    pub signature: String,
}

/// A single segment of a parsed command (one executable with its arguments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSegment {
    /// Lowercased executable basename, after wrapper prefixes are stripped.
    pub executable: String,
    /// Lowercased arguments.
    pub args: Vec<String>,
    /// Index of the `&&`/`||`/`;` chain this segment belongs to.
    pub chain: usize,
    /// Whether this segment reads from a pipe.
    pub stdin_only: bool,
}

/// Commands that run another command and are looked through during matching.
const WRAPPERS: &[&str] = &[
    "sudo", "doas", "env", "nohup", "exec", "time", "nice", "timeout", "command",
];

/// Wrapper options that consume the following word.
const WRAPPER_VALUE_FLAGS: &[&str] = &["-u", "-g"];

/// Shells whose `-c` operand is itself a command line.
const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "ash", "fish"];

/// Script interpreters whose inline program may shell out.
const INTERPRETERS: &[&str] = &["python", "python2", "python3", "perl", "ruby", "node", "php"];

/// Commands that run the command given in their operands.
const RUNNERS: &[&str] = &[
    "xargs", "watch", "parallel", "flock", "su", "runuser", "setsid", "stdbuf", "chroot",
];

/// `find` actions followed by a command terminated by `;` or `+`.
const FIND_EXEC: &[&str] = &["-exec", "-execdir", "-ok", "-okdir"];

/// How deep nested command lines are followed.
const MAX_NESTING: usize = 8;

/// Upper bound on segments produced for one command, nested ones included.
const MAX_SEGMENTS: usize = 256;

/// Upper bound on start positions tried for one runner invocation.
const MAX_RUNNER_CANDIDATES: usize = 8;

fn segment(category: DangerCategory, executable: &str, arg: Option<&str>) -> DangerousPattern {
    DangerousPattern {
        category,
        signature: Signature::Segment {
            executable: executable.to_string(),
            arg: arg.map(str::to_string),
        },
    }
}

/// The built-in patterns. They are always in force; loaded files can only add.
pub fn builtin_patterns() -> Vec<DangerousPattern> {
    use DangerCategory::*;

    let mut patterns = vec![
        segment(DestructiveFilesystem, "rm", Some("-*r*")),
        segment(DestructiveFilesystem, "mkfs*", None),
        segment(DestructiveFilesystem, "dd", Some("if=*")),
        segment(DestructiveFilesystem, "fdisk", None),
        segment(DestructiveFilesystem, "shred", None),
        segment(DestructiveFilesystem, "wipefs", None),
        segment(DestructiveFilesystem, "format", Some("c:*")),
        DangerousPattern {
            category: DestructiveFilesystem,
            signature: Signature::Text {
                glob: "*:(){*".to_string(),
            },
        },
        segment(PrivilegeModification, "chmod", Some("777")),
        segment(PrivilegeModification, "chmod", Some("-*r*")),
        segment(PrivilegeModification, "chown", None),
        segment(PrivilegeModification, "usermod", None),
        segment(PrivilegeModification, "userdel", None),
        segment(PrivilegeModification, "passwd", None),
        segment(PrivilegeModification, "visudo", None),
        segment(PrivilegeModification, "chattr", None),
        segment(SystemPower, "shutdown", None),
        segment(SystemPower, "reboot", None),
        segment(SystemPower, "halt", None),
        segment(SystemPower, "poweroff", None),
        segment(SystemPower, "init", Some("[06]")),
        segment(SystemPower, "systemctl", Some("reboot")),
        segment(SystemPower, "systemctl", Some("poweroff")),
        segment(ProcessKill, "kill", Some("-9")),
        segment(ProcessKill, "kill", Some("-kill")),
        segment(ProcessKill, "pkill", Some("-9")),
        segment(ProcessKill, "killall", None),
        segment(NetworkExposure, "nc", Some("-*l*")),
        segment(NetworkExposure, "ncat", Some("-*l*")),
        segment(NetworkExposure, "iptables", Some("-f")),
        segment(NetworkExposure, "iptables", Some("--flush")),
        segment(NetworkExposure, "ufw", Some("disable")),
    ];
    for from in ["curl", "wget"] {
        for into in ["sh", "bash", "zsh", "dash"] {
            patterns.push(DangerousPattern {
                category: NetworkExposure,
                signature: Signature::Pipe {
                    from: from.to_string(),
                    into: into.to_string(),
                },
            });
        }
    }
    patterns
}

#[derive(Debug, Clone)]
enum CompiledSignature {
    Segment {
        executable: Pattern,
        arg: Option<Pattern>,
    },
    Pipe {
        from: Pattern,
        into: Pattern,
    },
    Text(Pattern),
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: DangerousPattern,
    compiled: CompiledSignature,
}

fn compile_glob(glob: &str) -> Result<Pattern, PolicyError> {
    Pattern::new(&glob.to_lowercase()).map_err(|source| PolicyError::InvalidGlob {
        glob: glob.to_string(),
        source,
    })
}

impl CompiledPattern {
    fn compile(source: DangerousPattern) -> Result<Self, PolicyError> {
        let compiled = match &source.signature {
            Signature::Segment { executable, arg } => CompiledSignature::Segment {
                executable: compile_glob(executable)?,
                arg: arg.as_deref().map(compile_glob).transpose()?,
            },
            Signature::Pipe { from, into } => CompiledSignature::Pipe {
                from: compile_glob(from)?,
                into: compile_glob(into)?,
            },
            Signature::Text { glob } => CompiledSignature::Text(compile_glob(glob)?),
        };
        Ok(Self { source, compiled })
    }

    fn matches(&self, segments: &[CommandSegment], compact: &str) -> bool {
        match &self.compiled {
            CompiledSignature::Segment { executable, arg } => segments.iter().any(|seg| {
                executable.matches(&seg.executable)
                    && arg
                        .as_ref()
                        .is_none_or(|a| seg.args.iter().any(|x| a.matches(x)))
            }),
            CompiledSignature::Pipe { from, into } => {
                segments.iter().enumerate().any(|(i, sink)| {
                    sink.stdin_only
                        && into.matches(&sink.executable)
                        && segments[..i]
                            .iter()
                            .any(|src| src.chain == sink.chain && from.matches(&src.executable))
                })
            }
            CompiledSignature::Text(glob) => glob.matches(compact),
        }
    }
}

/// Hard gate over command text. A Dangerous verdict is final.
#[derive(Debug, Clone)]
pub struct DangerousCommandFilter {
    patterns: Vec<CompiledPattern>,
}

impl Default for DangerousCommandFilter {
    fn default() -> Self {
        Self::with_extras(Vec::new()).unwrap_or_else(|_| unreachable!("built-in globs are valid"))
    }
}

impl DangerousCommandFilter {
    /// Build a filter from the built-in set plus `extras`.
    pub fn with_extras(extras: Vec<DangerousPattern>) -> Result<Self, PolicyError> {
        let patterns = builtin_patterns()
            .into_iter()
            .chain(extras)
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Build a filter from the built-in set plus the extras in `path`.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Self::with_extras(PatternsFile::load(path)?.patterns)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Classify a command string. Independent of any privilege state.
    pub fn classify(&self, command: &str) -> Classification {
        let mut walk = SegmentWalk::default();
        walk.collect(&command.to_lowercase(), 0);
        if walk.truncated {
            return Classification::Dangerous(DangerMatch {
                category: DangerCategory::Obfuscation,
                signature: "nesting beyond parser limits".to_string(),
            });
        }
        let segments = walk.segments;
        let compact: String = command
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        self.patterns
            .iter()
            .find(|p| p.matches(&segments, &compact))
            .map(|p| {
                Classification::Dangerous(DangerMatch {
                    category: p.source.category,
                    signature: p.source.signature.to_string(),
                })
            })
            .unwrap_or(Classification::Safe)
    }
}

/// Quote-aware word splitting that respects single quotes, double quotes, and backslash escaping.
fn shell_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(c) = chars.next() {
        if in_single_quote {
            if c == '\'' {
                in_single_quote = false;
            } else {
                current.push(c);
            }
        } else if in_double_quote {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            } else if c == '"' {
                in_double_quote = false;
            } else {
                current.push(c);
            }
        } else if c == '\\' {
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == '\'' {
            in_single_quote = true;
        } else if c == '"' {
            in_double_quote = true;
        } else if c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Split on `&&`, `||`, `;`, `|` and newlines outside quotes.
///
/// Each part is tagged with its chain index and whether it follows a pipe.
fn split_operators(input: &str) -> Vec<(usize, bool, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut chain = 0;
    let mut piped = false;

    while let Some(c) = chars.next() {
        if in_single_quote {
            current.push(c);
            if c == '\'' {
                in_single_quote = false;
            }
        } else if in_double_quote {
            current.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            } else if c == '"' {
                in_double_quote = false;
            }
        } else if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == '\'' {
            in_single_quote = true;
            current.push(c);
        } else if c == '"' {
            in_double_quote = true;
            current.push(c);
        } else if c == '&' && chars.peek() == Some(&'&') {
            chars.next();
            parts.push((chain, piped, std::mem::take(&mut current)));
            chain += 1;
            piped = false;
        } else if c == '|' {
            if chars.peek() == Some(&'|') {
                chars.next();
                parts.push((chain, piped, std::mem::take(&mut current)));
                chain += 1;
                piped = false;
            } else {
                parts.push((chain, piped, std::mem::take(&mut current)));
                piped = true;
            }
        } else if c == ';' || c == '\n' || c == '&' {
            // A lone '&' backgrounds the command; what follows starts a new chain.
            parts.push((chain, piped, std::mem::take(&mut current)));
            chain += 1;
            piped = false;
        } else {
            current.push(c);
        }
    }
    parts.push((chain, piped, current));
    parts
}

/// Drop wrapper commands, their options, and leading `VAR=value` assignments.
fn strip_wrappers(mut words: Vec<String>) -> Vec<String> {
    loop {
        let Some(first) = words.first() else {
            return words;
        };
        if first.contains('=') && !first.starts_with('-') {
            words.remove(0);
            continue;
        }
        let base = basename(first);
        if !WRAPPERS.contains(&base.as_str()) {
            return words;
        }
        words.remove(0);
        while let Some(opt) = words.first() {
            if !opt.starts_with('-') {
                break;
            }
            let takes_value = WRAPPER_VALUE_FLAGS.contains(&opt.as_str());
            words.remove(0);
            if takes_value && !words.is_empty() {
                words.remove(0);
            }
        }
        // Numeric operands such as `nice -n 10` or `timeout 30`.
        while words
            .first()
            .is_some_and(|w| w.chars().all(|c| c.is_ascii_digit() || c == '.'))
        {
            words.remove(0);
        }
    }
}

fn basename(word: &str) -> String {
    Path::new(word)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(word)
        .to_string()
}

/// Parse a command string into lowercased, wrapper-stripped segments.
///
/// Command lines nested inside the command are parsed too and appended with
/// their own chain numbers: shell `-c` scripts, `eval`, runners such as `xargs`
/// and `watch`, `find -exec`, and `$(...)` or backtick substitutions.
pub fn parse_command(command: &str) -> Vec<CommandSegment> {
    let mut walk = SegmentWalk::default();
    walk.collect(&command.to_lowercase(), 0);
    walk.segments
}

/// Segments gathered so far, and whether a limit cut the walk short.
#[derive(Default)]
struct SegmentWalk {
    segments: Vec<CommandSegment>,
    truncated: bool,
}

impl SegmentWalk {
    fn collect(&mut self, command: &str, depth: usize) {
        if self.truncated {
            return;
        }
        if depth > MAX_NESTING || self.segments.len() >= MAX_SEGMENTS {
            self.truncated = true;
            return;
        }
        let base = self.segments.last().map_or(0, |s| s.chain + 1);
        let mut nested = substitutions(command);
        for (chain, stdin_only, part) in split_operators(command) {
            let words = strip_wrappers(shell_words(part.trim()));
            let Some((first, rest)) = words.split_first() else {
                continue;
            };
            let segment = CommandSegment {
                executable: basename(first),
                args: rest.to_vec(),
                chain: base + chain,
                stdin_only,
            };
            let mut inner = nested_commands(&segment);
            if inner.len() > MAX_RUNNER_CANDIDATES {
                inner.truncate(MAX_RUNNER_CANDIDATES);
                self.truncated = true;
            }
            nested.extend(inner);
            self.segments.push(segment);
            if self.segments.len() >= MAX_SEGMENTS {
                self.truncated = true;
                return;
            }
        }
        for inner in nested {
            self.collect(&inner, depth + 1);
        }
    }
}

/// Command lines a segment will run on its own behalf.
fn nested_commands(segment: &CommandSegment) -> Vec<String> {
    let args = &segment.args;
    let exe = segment.executable.as_str();
    if SHELLS.contains(&exe) {
        // `-c` may be combined with other flags, as in `bash -lc`.
        return args
            .iter()
            .position(|a| a.starts_with('-') && !a.starts_with("--") && a.contains('c'))
            .and_then(|i| args.get(i + 1))
            .cloned()
            .into_iter()
            .collect();
    }
    if is_interpreter(exe) {
        return args
            .iter()
            .position(|a| matches!(a.as_str(), "-c" | "-e" | "-r" | "--eval"))
            .and_then(|i| args.get(i + 1))
            .map(|script| quoted_literals(script))
            .unwrap_or_default();
    }
    match exe {
        "eval" => vec![args.join(" ")],
        "find" => find_exec_commands(args),
        _ if RUNNERS.contains(&exe) => runner_candidates(args),
        _ => Vec::new(),
    }
}

fn is_interpreter(exe: &str) -> bool {
    INTERPRETERS.contains(&exe)
        || exe
            .strip_prefix("python")
            .is_some_and(|v| v.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

/// Possible command lines behind a runner. Option values look like operands and
/// some runners take one operand of their own (`flock FILE`, `chroot DIR`), so each
/// operand after an option and the first two plain operands are tried as the start.
fn runner_candidates(args: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut after_option = false;
    let mut plain_operands = 0;
    for (i, word) in args.iter().enumerate() {
        if word.starts_with('-') {
            after_option = true;
            continue;
        }
        candidates.push(args[i..].join(" "));
        if candidates.len() > MAX_RUNNER_CANDIDATES {
            break;
        }
        if !std::mem::take(&mut after_option) {
            plain_operands += 1;
            if plain_operands == 2 {
                break;
            }
        }
    }
    candidates
}

/// The commands given to `find -exec` and friends.
fn find_exec_commands(args: &[String]) -> Vec<String> {
    let mut commands = Vec::new();
    let mut rest = args.iter();
    while let Some(word) = rest.next() {
        if !FIND_EXEC.contains(&word.as_str()) {
            continue;
        }
        let command: Vec<&str> = rest
            .by_ref()
            .take_while(|w| !matches!(w.as_str(), ";" | "+"))
            .map(String::as_str)
            .collect();
        commands.push(command.join(" "));
    }
    commands
}

/// Bodies of `$(...)`, `<(...)`, `>(...)` and backtick substitutions outside single quotes.
/// An unterminated substitution runs to the end of the input.
fn substitutions(input: &str) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut chars = input.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(c) = chars.next() {
        if in_single_quote {
            in_single_quote = c != '\'';
            continue;
        }
        match c {
            '\\' => {
                chars.next();
            }
            '\'' if !in_double_quote => in_single_quote = true,
            '"' => in_double_quote = !in_double_quote,
            '`' => {
                let mut body = String::new();
                while let Some(b) = chars.next() {
                    match b {
                        '`' => break,
                        '\\' => body.extend(chars.next()),
                        _ => body.push(b),
                    }
                }
                bodies.push(body);
            }
            '$' | '<' | '>' if chars.peek() == Some(&'(') => {
                chars.next();
                let mut body = String::new();
                let mut depth = 1;
                for b in chars.by_ref() {
                    match b {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    body.push(b);
                }
                bodies.push(body);
            }
            _ => {}
        }
    }
    bodies
}

/// Quoted string literals in an inline script, each a candidate command line.
fn quoted_literals(script: &str) -> Vec<String> {
    let mut literals = Vec::new();
    let mut chars = script.chars();
    while let Some(c) = chars.next() {
        if c != '\'' && c != '"' {
            continue;
        }
        let mut literal = String::new();
        while let Some(b) = chars.next() {
            match b {
                '\\' => literal.extend(chars.next()),
                _ if b == c => break,
                _ => literal.push(b),
            }
        }
        literals.push(literal);
    }
    literals
}
