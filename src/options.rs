//! qsub-style option parsing.
//!
//! Grid Engine flags are single-dash words (`-l`, `-pe`, `-hold_jid`) and a few
//! of them take more than one token, so they are classified here from a flag
//! table rather than through clap.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Port the notebook server listens on unless `-port` says otherwise.
pub const DEFAULT_PORT: u16 = 7777;
/// Base job name unless `-N` says otherwise.
pub const DEFAULT_BASE_NAME: &str = "jupyter";
/// Host the launcher connects to unless `-remote` says otherwise.
pub const DEFAULT_REMOTE: &str = "grid";

/// How many tokens a flag consumes and how repeats combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// No argument.
    Switch,
    /// One argument; a repeat replaces the earlier value.
    Single,
    /// One argument; repeats are joined with `,`.
    CommaList,
    /// Several tokens joined with a space (`-pe smp 4`).
    SpaceJoined(usize),
}

/// Which binary a flag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Submitter,
    Launcher,
}

impl Program {
    pub fn name(self) -> &'static str {
        match self {
            Program::Submitter => "qsub-jupyter",
            Program::Launcher => "run-jupyter",
        }
    }
}

#[derive(Debug)]
struct FlagSpec {
    name: &'static str,
    arity: Arity,
    launcher_only: bool,
    help: &'static str,
}

const fn flag(name: &'static str, arity: Arity, help: &'static str) -> FlagSpec {
    FlagSpec {
        name,
        arity,
        launcher_only: false,
        help,
    }
}

const FLAGS: &[FlagSpec] = &[
    flag("-help", Arity::Switch, "print this help and exit"),
    FlagSpec {
        name: "-remote",
        arity: Arity::Single,
        launcher_only: true,
        help: "ssh host of the cluster head node (default: grid)",
    },
    flag("-port", Arity::Single, "notebook server port (default: 7777)"),
    flag("-@", Arity::Single, "qsub defaults file (default: ~/.run_jupyter.qsub_option_defaults)"),
    flag("-o", Arity::Single, "log file or directory for the notebook server output"),
    flag("-N", Arity::Single, "base job name (default: jupyter)"),
    flag("-cwd", Arity::Switch, "qsub: run in the current working directory"),
    flag("-V", Arity::Switch, "qsub: export the whole environment"),
    flag("-notify", Arity::Switch, "qsub: send warning signals before suspend/kill"),
    flag("-clear", Arity::Switch, "qsub: drop options read from default files"),
    flag("-verify", Arity::Switch, "qsub: verify the request without submitting"),
    flag("-A", Arity::Single, "qsub: account string"),
    flag("-a", Arity::Single, "qsub: earliest start time"),
    flag("-b", Arity::Single, "qsub: binary command (y|n)"),
    flag("-c", Arity::Single, "qsub: checkpoint interval"),
    flag("-ckpt", Arity::Single, "qsub: checkpoint environment"),
    flag("-dl", Arity::Single, "qsub: deadline"),
    flag("-e", Arity::Single, "qsub: stderr path"),
    flag("-i", Arity::Single, "qsub: stdin path"),
    flag("-j", Arity::Single, "qsub: merge stderr into stdout (y|n)"),
    flag("-js", Arity::Single, "qsub: job share"),
    flag("-m", Arity::Single, "qsub: mail events"),
    flag("-M", Arity::Single, "qsub: mail address"),
    flag("-now", Arity::Single, "qsub: immediate scheduling (y|n)"),
    flag("-P", Arity::Single, "qsub: project"),
    flag("-p", Arity::Single, "qsub: priority"),
    flag("-r", Arity::Single, "qsub: rerunnable (y|n)"),
    flag("-R", Arity::Single, "qsub: reservation (y|n)"),
    flag("-S", Arity::Single, "qsub: interpreting shell"),
    flag("-shell", Arity::Single, "qsub: start through a shell (y|n)"),
    flag("-wd", Arity::Single, "qsub: working directory"),
    flag("-w", Arity::Single, "qsub: verification level"),
    flag("-l", Arity::CommaList, "qsub: resource request, e.g. h_rt=9:0:0 (repeatable)"),
    flag("-q", Arity::CommaList, "qsub: queue list (repeatable)"),
    flag("-v", Arity::CommaList, "qsub: environment variables (repeatable)"),
    flag("-ac", Arity::CommaList, "qsub: add context variables (repeatable)"),
    flag("-sc", Arity::CommaList, "qsub: set context variables (repeatable)"),
    flag("-hold_jid", Arity::CommaList, "qsub: job dependencies (repeatable)"),
    flag("-masterq", Arity::CommaList, "qsub: master queue list (repeatable)"),
    flag("-pe", Arity::SpaceJoined(2), "qsub: parallel environment, e.g. -pe smp 4"),
];

fn lookup(name: &str, program: Program) -> Option<&'static FlagSpec> {
    FLAGS
        .iter()
        .find(|spec| spec.name == name && (!spec.launcher_only || program == Program::Launcher))
}

/// Arity of a known qsub flag.
pub fn arity_of(name: &str) -> Option<Arity> {
    lookup(name, Program::Launcher).map(|spec| spec.arity)
}

/// One flag with its joined value and the argv tokens it was given as.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    flag: String,
    value: String,
    tokens: Vec<String>,
}

impl Entry {
    fn new(flag: &str, value: &str) -> Self {
        let tokens = match arity_of(flag) {
            Some(Arity::Switch) => Vec::new(),
            Some(Arity::SpaceJoined(_)) => value.split_whitespace().map(str::to_string).collect(),
            _ => vec![value.to_string()],
        };
        Self {
            flag: flag.to_string(),
            value: value.to_string(),
            tokens,
        }
    }
}

/// Ordered option list with an index for lookups.
///
/// Entries are only ever appended; changing a flag's value rewrites the entry
/// in place so the order of first appearance is preserved. Multi-token flags
/// keep the tokens they were given so they serialize back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flag: &str) -> Option<&str> {
        self.index
            .get(flag)
            .map(|&i| self.entries[i].value.as_str())
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.index.contains_key(flag)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn put(&mut self, entry: Entry) {
        match self.index.get(&entry.flag) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.flag.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Set a flag, replacing any earlier value. A space-joined value is split
    /// on whitespace when serialized; use [`JobOptions::set_tokens`] to keep
    /// blank or space-containing tokens.
    pub fn set(&mut self, flag: &str, value: &str) {
        self.put(Entry::new(flag, value));
    }

    /// Set a multi-token flag from its argv tokens, replacing any earlier value.
    pub fn set_tokens<S: AsRef<str>>(&mut self, flag: &str, tokens: &[S]) {
        let tokens: Vec<String> = tokens.iter().map(|t| t.as_ref().to_string()).collect();
        self.put(Entry {
            flag: flag.to_string(),
            value: tokens.join(" "),
            tokens,
        });
    }

    /// Add a value to a comma-joined list flag.
    pub fn append_list(&mut self, flag: &str, value: &str) {
        let joined = match self.get(flag) {
            Some("") | None => value.to_string(),
            Some(current) => format!("{current},{value}"),
        };
        self.set(flag, &joined);
    }

    /// Record a value according to the flag's arity.
    pub fn insert(&mut self, flag: &str, value: &str) {
        match arity_of(flag) {
            Some(Arity::CommaList) => self.append_list(flag, value),
            _ => self.set(flag, value),
        }
    }

    /// Copy every entry of `other` over this set, in `other`'s order.
    pub fn merge(&mut self, other: &JobOptions) {
        for entry in &other.entries {
            match arity_of(&entry.flag) {
                Some(Arity::CommaList) => self.append_list(&entry.flag, &entry.value),
                _ => self.put(entry.clone()),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.flag.as_str(), entry.value.as_str()))
    }

    /// Serialize into argv tokens, each flag followed by the tokens it holds.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.entries.len() * 2);
        for entry in &self.entries {
            args.push(entry.flag.clone());
            args.extend(entry.tokens.iter().cloned());
        }
        args
    }
}

/// Flags given on one command line, split into tool settings and qsub
/// pass-through options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub help: bool,
    pub port: u16,
    pub base_name: String,
    pub defaults_file: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub remote: String,
    /// Explicit scheduler flags, in command-line order.
    pub qsub: JobOptions,
    /// Arguments that looked blank.
    pub warnings: Vec<String>,
}

impl Default for Invocation {
    fn default() -> Self {
        Self {
            help: false,
            port: DEFAULT_PORT,
            base_name: DEFAULT_BASE_NAME.to_string(),
            defaults_file: None,
            output: None,
            remote: DEFAULT_REMOTE.to_string(),
            qsub: JobOptions::new(),
            warnings: Vec::new(),
        }
    }
}

impl Invocation {
    /// Arguments that reproduce this invocation for the submitter.
    /// `-remote` and `-help` stay local.
    pub fn submitter_args(&self) -> Vec<String> {
        let mut args = vec!["-port".to_string(), self.port.to_string()];
        if self.base_name != DEFAULT_BASE_NAME {
            args.push("-N".to_string());
            args.push(self.base_name.clone());
        }
        if let Some(path) = &self.defaults_file {
            args.push("-@".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        if let Some(path) = &self.output {
            args.push("-o".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        args.extend(self.qsub.to_args());
        args
    }
}

/// Parse command-line tokens for `program`.
pub fn parse_args<S: AsRef<str>>(tokens: &[S], program: Program) -> Result<Invocation> {
    let mut inv = Invocation::default();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i].as_ref();
        let spec = lookup(token, program).ok_or_else(|| {
            if token.starts_with('-') {
                Error::usage(format!("unknown option {token}"))
            } else {
                Error::usage(format!("unexpected argument {token:?}"))
            }
        })?;
        i += 1;

        let wanted = match spec.arity {
            Arity::Switch => 0,
            Arity::Single | Arity::CommaList => 1,
            Arity::SpaceJoined(n) => n,
        };
        if i + wanted > tokens.len() {
            return Err(Error::usage(format!(
                "option {} requires {} argument{}",
                spec.name,
                wanted,
                if wanted == 1 { "" } else { "s" }
            )));
        }
        let values: Vec<&str> = tokens[i..i + wanted].iter().map(|t| t.as_ref()).collect();
        i += wanted;

        for value in &values {
            if value.trim().is_empty() {
                tracing::warn!(option = spec.name, "argument looks blank");
                inv.warnings
                    .push(format!("argument to {} looks blank", spec.name));
            }
        }
        let value = values.join(" ");

        match spec.name {
            "-help" => inv.help = true,
            "-port" => inv.port = parse_port(&value)?,
            "-remote" => inv.remote = value,
            "-N" => inv.base_name = value,
            "-@" => inv.defaults_file = Some(PathBuf::from(value)),
            "-o" => inv.output = Some(PathBuf::from(value)),
            name => match spec.arity {
                Arity::CommaList => inv.qsub.append_list(name, &value),
                Arity::SpaceJoined(_) => inv.qsub.set_tokens(name, &values),
                _ => inv.qsub.set(name, &value),
            },
        }
    }

    Ok(inv)
}

fn parse_port(value: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::usage(format!("invalid port {value:?}"))),
    }
}

/// Usage text listing every flag `program` accepts.
pub fn usage(program: Program) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Usage: {} [options] [qsub options]", program.name());
    let _ = writeln!(text);
    match program {
        Program::Submitter => {
            let _ = writeln!(
                text,
                "Submit a Jupyter server job (unless one with the same settings is\n\
                 already queued) and print JOB_ID, PORT, NODE and URL once it is up."
            );
        }
        Program::Launcher => {
            let _ = writeln!(
                text,
                "Start a Jupyter server on the cluster through the remote host and\n\
                 open an ssh session that forwards the server port to this machine."
            );
        }
    }
    let _ = writeln!(text);
    let _ = writeln!(text, "Options:");
    for spec in FLAGS
        .iter()
        .filter(|spec| !spec.launcher_only || program == Program::Launcher)
    {
        let arg = match spec.arity {
            Arity::Switch => "",
            Arity::Single | Arity::CommaList => " <value>",
            Arity::SpaceJoined(_) => " <name> <slots>",
        };
        let _ = writeln!(text, "  {:<24}{}", format!("{}{}", spec.name, arg), spec.help);
    }
    let _ = writeln!(text);
    let _ = writeln!(text, "Exit codes: 0 ok, 1 error, 2 job not ready yet (retry later)");
    text
}
