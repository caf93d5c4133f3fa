//! Installed job descriptors.
//!
//! Every job installed on the agent comes with `<jobs-dir>/<name>.json5`:
//!
//! ```json5
//! {
//!     general: {
//!         job_version: "2.1",
//!         command: "/usr/bin/env python3 /opt/openbach/agent/jobs/fping/fping.py",
//!         command_stop: null,
//!         persistent: true,
//!         need_privileges: false,
//!     },
//!     arguments: {
//!         required: [ { name: "destination_ip", count: 1 } ],
//!         optional: [ { name: "count", flag: "-c", count: 1 } ],
//!     },
//! }
//! ```

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use openbach_shared::errors::{OpenbachError, OpenbachResult};

/// Extension of job descriptor files.
pub const DESCRIPTOR_EXTENSION: &str = "json5";

/// Everything the scheduler needs to launch and stop a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub name: String,
    pub version: JobVersion,
    pub command: Vec<String>,
    pub command_stop: Vec<String>,
    pub persistent: bool,
    pub need_privileges: bool,
    /// Minimum number of arguments.
    pub required: usize,
    /// Whether more than `required` arguments are accepted.
    pub optional: bool,
}

impl JobDescriptor {
    /// Check an argument list against the declared arity.
    pub fn check_arity(&self, arguments: &[String]) -> OpenbachResult<()> {
        if arguments.len() < self.required {
            return Err(OpenbachError::bad_request(format!(
                "Job {} requires at least {} arguments",
                self.name, self.required
            )));
        }
        if !self.optional && arguments.len() > self.required {
            return Err(OpenbachError::bad_request(format!(
                "Job {} does not require more than {} arguments",
                self.name, self.required
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    general: GeneralSection,
    #[serde(default)]
    arguments: ArgumentSection,
}

#[derive(Debug, Deserialize)]
struct GeneralSection {
    job_version: Value,
    command: CommandLine,
    #[serde(default)]
    command_stop: Option<CommandLine>,
    persistent: bool,
    #[serde(default)]
    need_privileges: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Words(Vec<String>),
    Line(String),
}

impl CommandLine {
    fn into_words(self) -> OpenbachResult<Vec<String>> {
        match self {
            CommandLine::Words(words) => Ok(words),
            CommandLine::Line(line) => split_command_line(&line),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ArgumentSection {
    #[serde(default)]
    required: Option<Vec<ArgumentSpec>>,
    #[serde(default)]
    optional: Option<Vec<Value>>,
    #[serde(default)]
    subcommand: Option<Vec<SubcommandGroup>>,
}

#[derive(Debug, Deserialize)]
struct ArgumentSpec {
    #[serde(default)]
    name: Option<String>,
    count: Option<ArgumentCount>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArgumentCount {
    Exact(u32),
    Pattern(String),
}

#[derive(Debug, Deserialize)]
struct SubcommandGroup {
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    choices: Vec<ArgumentSection>,
}

/// Count the required arguments of a section and whether extra ones are allowed.
fn count_arguments(section: &ArgumentSection) -> Result<(usize, bool), String> {
    let mut required_count = 0usize;
    let mut optional_found = section.optional.is_some();

    for argument in section.required.iter().flatten() {
        let label = argument.name.as_deref().unwrap_or("?");
        let count = argument
            .count
            .as_ref()
            .ok_or_else(|| format!("missing 'count' for required argument '{}'", label))?;
        required_count += match count {
            ArgumentCount::Exact(n) => *n as usize,
            ArgumentCount::Pattern(pattern) => match pattern.as_str() {
                "+" => 1,
                "*" => {
                    optional_found = true;
                    0
                }
                other => {
                    let lower = other.split('-').next().unwrap_or(other);
                    lower.trim().parse::<usize>().map_err(|_| {
                        format!("invalid count '{}' for required argument '{}'", other, label)
                    })?
                }
            },
        };
    }

    for group in section.subcommand.iter().flatten() {
        if group.optional {
            optional_found = true;
            continue;
        }
        let counts = group
            .choices
            .iter()
            .map(count_arguments)
            .collect::<Result<Vec<_>, _>>()?;
        let minimum = counts.iter().map(|(required, _)| *required).min();
        let maximum = counts.iter().map(|(required, _)| *required).max();
        let (Some(minimum), Some(maximum)) = (minimum, maximum) else {
            return Err("mandatory subcommand group without choices".to_string());
        };
        required_count += 1 + minimum;
        optional_found =
            optional_found || minimum != maximum || counts.iter().any(|(_, optional)| *optional);
    }

    Ok((required_count, optional_found))
}

/// Path of the descriptor file of `name` in `jobs_dir`.
pub fn descriptor_path(jobs_dir: &Path, name: &str) -> PathBuf {
    jobs_dir.join(format!("{}.{}", name, DESCRIPTOR_EXTENSION))
}

/// Parse a descriptor from its JSON5 content.
pub fn parse_descriptor(name: &str, content: &str) -> OpenbachResult<JobDescriptor> {
    let filename = format!("{}.{}", name, DESCRIPTOR_EXTENSION);
    let file: DescriptorFile = json5::from_str(content).map_err(|e| {
        OpenbachError::bad_request(format!("Conf file {} not well formed: {}", filename, e))
    })?;

    let (required, optional) = count_arguments(&file.arguments).map_err(|e| {
        OpenbachError::bad_request(format!(
            "Conf file {} has an invalid 'arguments' section for job {}: {}",
            filename, name, e
        ))
    })?;

    let version = match &file.general.job_version {
        Value::String(text) => JobVersion::parse(text),
        Value::Number(number) => JobVersion::parse(&number.to_string()),
        other => {
            return Err(OpenbachError::bad_request(format!(
                "Conf file {} has an invalid job_version {} for job {}",
                filename, other, name
            )));
        }
    };

    let command = file.general.command.into_words()?;
    if command.is_empty() {
        return Err(OpenbachError::bad_request(format!(
            "Conf file {} has an empty 'command' entry for job {}",
            filename, name
        )));
    }
    let command_stop = match file.general.command_stop {
        Some(line) => line.into_words()?,
        None => Vec::new(),
    };

    Ok(JobDescriptor {
        name: name.to_string(),
        version,
        command,
        command_stop,
        persistent: file.general.persistent,
        need_privileges: file.general.need_privileges.unwrap_or(false),
        required,
        optional,
    })
}

/// Read the descriptor of `name` from `jobs_dir`.
pub fn read_descriptor(jobs_dir: &Path, name: &str) -> OpenbachResult<JobDescriptor> {
    let path = descriptor_path(jobs_dir, name);
    let content = std::fs::read_to_string(&path).map_err(|e| {
        OpenbachError::bad_request(format!(
            "Conf file {}.{} does not exist or is unreadable: {}",
            name, DESCRIPTOR_EXTENSION, e
        ))
    })?;
    parse_descriptor(name, &content)
}

/// Names of every descriptor found in `jobs_dir`.
pub fn list_descriptors(jobs_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(jobs_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Dotted job version, compared numerically component by component.
#[derive(Debug, Clone)]
pub struct JobVersion {
    raw: String,
    parts: Vec<u64>,
}

impl JobVersion {
    pub fn parse(raw: &str) -> Self {
        let parts = raw
            .split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect();
        Self {
            raw: raw.to_string(),
            parts,
        }
    }

    fn normalized(&self) -> &[u64] {
        let end = self
            .parts
            .iter()
            .rposition(|part| *part != 0)
            .map_or(0, |index| index + 1);
        &self.parts[..end]
    }
}

impl PartialEq for JobVersion {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for JobVersion {}

impl PartialOrd for JobVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(other.normalized())
    }
}

impl std::fmt::Display for JobVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split a command line into words, honoring single quotes, double quotes
/// and backslash escapes the way a POSIX shell would.
pub fn split_command_line(line: &str) -> OpenbachResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(unbalanced(line)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(unbalanced(line)),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(unbalanced(line)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unbalanced(line: &str) -> OpenbachError {
    OpenbachError::bad_request(format!("Unbalanced quotes in command '{}'", line))
}
