//! Flag-schema driven command builder.
//!
//! Turns a flat `flag -> value` request into an argument vector for the
//! external tool. The set of known flags, which of them are required, and
//! the umbrella relationships between them are data ([`FlagSchema`]), so new
//! flags never require touching the algorithm.
//!
//! The result is a [`CommandLine`] (program + argv). It is executed without a
//! shell, so submitted values are never interpreted as shell syntax.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Allowed shape of a submitted flag name.
pub const FLAG_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9-]*$";

static FLAG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(FLAG_NAME_PATTERN).expect("valid regex"));

/// Flags the management-cluster deployment cannot run without.
const MANAGEMENT_REQUIRED_FLAGS: &[&str] = &[
    "cluster-name",
    "control-plane-endpoint-ip",
    "control-plane-prism-element-cluster",
    "control-plane-subnets",
    "control-plane-vm-image",
    "csi-storage-container",
    "endpoint",
    "kubernetes-service-load-balancer-ip-range",
    "registry-password",
    "registry-url",
    "registry-username",
    "vm-image",
    "worker-prism-element-cluster",
    "worker-subnets",
    "worker-vm-image",
];

/// Known optional flags of the management-cluster deployment.
const MANAGEMENT_OPTIONAL_FLAGS: &[&str] = &[
    "control-plane-cores-per-vcpu",
    "control-plane-disk-size",
    "control-plane-endpoint-port",
    "control-plane-memory",
    "control-plane-pc-project",
    "control-plane-vcpus",
    "control-plane-replicas",
    "kubernetes-pod-network-cidr",
    "kubernetes-service-cidr",
    "kubernetes-version",
    "namespace",
    "registry-cacert",
    "registry-mirror-cacert",
    "registry-mirror-password",
    "registry-mirror-url",
    "registry-mirror-username",
    "ssh-public-key-file",
    "ssh-username",
    "timeout",
    "worker-cores-per-vcpu",
    "worker-disk-size",
    "worker-memory",
    "worker-pc-categories",
    "worker-pc-project",
    "worker-replicas",
    "worker-vcpus",
];

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// One flag known to the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

/// A flag that stands in for several more specific ones.
///
/// Supplying `name` satisfies every flag in `covers`; supplying every flag in
/// `covers` satisfies `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UmbrellaFlag {
    pub name: String,
    pub covers: Vec<String>,
}

/// Declarative description of the external command and its flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSchema {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the submitted flags.
    #[serde(default)]
    pub base_args: Vec<String>,
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
    #[serde(default)]
    pub umbrellas: Vec<UmbrellaFlag>,
    /// Unconditional flags appended after the submitted ones.
    #[serde(default)]
    pub trailing_flags: Vec<String>,
}

impl FlagSchema {
    /// Schema for `nkp create cluster nutanix` self-managed deployments.
    pub fn management_cluster() -> Self {
        let required = MANAGEMENT_REQUIRED_FLAGS.iter().map(|name| FlagSpec {
            name: (*name).to_string(),
            required: true,
        });
        let optional = MANAGEMENT_OPTIONAL_FLAGS.iter().map(|name| FlagSpec {
            name: (*name).to_string(),
            required: false,
        });

        Self {
            program: "nkp".into(),
            base_args: vec!["create".into(), "cluster".into(), "nutanix".into()],
            flags: required.chain(optional).collect(),
            umbrellas: vec![UmbrellaFlag {
                name: "vm-image".into(),
                covers: vec!["control-plane-vm-image".into(), "worker-vm-image".into()],
            }],
            trailing_flags: vec!["--insecure".into(), "--self-managed".into()],
        }
    }

    /// Parse a schema from JSON and check it is usable.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let schema: Self = serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("Invalid flag schema: {e}")))?;
        schema.check()?;
        Ok(schema)
    }

    /// Load a schema from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Validation(format!(
                "Cannot read flag schema {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&json)
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.program.trim().is_empty() {
            return Err(CoreError::Validation(
                "Flag schema program must not be empty".into(),
            ));
        }
        if let Some(u) = self.umbrellas.iter().find(|u| u.covers.is_empty()) {
            return Err(CoreError::Validation(format!(
                "Umbrella flag '{}' must cover at least one flag",
                u.name
            )));
        }
        Ok(())
    }

    /// Names of all required flags, in schema order.
    pub fn required_flags(&self) -> impl Iterator<Item = &str> {
        self.flags
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
    }

    /// Every required flag not satisfied by `params`, after umbrella rules.
    ///
    /// A flag whose value is `null` counts as absent.
    pub fn missing_flags(&self, params: &Map<String, Value>) -> Vec<String> {
        let present = |name: &str| params.get(name).is_some_and(|v| !v.is_null());

        let mut missing: Vec<&str> = self.required_flags().filter(|f| !present(f)).collect();

        for umbrella in &self.umbrellas {
            if present(&umbrella.name) {
                missing.retain(|m| !umbrella.covers.iter().any(|c| c == m));
            } else if umbrella.covers.iter().all(|c| present(c)) {
                missing.retain(|m| *m != umbrella.name);
            }
        }

        missing.into_iter().map(str::to_string).collect()
    }

    /// Validate `params` and render the command line.
    ///
    /// Submitted flags are rendered as `--key=value` in the order given,
    /// `true` as a bare `--key`, while `false` and `null` are left out.
    pub fn build(&self, params: &Map<String, Value>) -> Result<CommandLine, ValidationError> {
        let missing = self.missing_flags(params);
        let mut invalid = Vec::new();
        let mut args = self.base_args.clone();

        for (key, value) in params {
            if !FLAG_NAME_RE.is_match(key) {
                invalid.push(InvalidFlag::new(
                    key,
                    "flag names may only contain letters, digits and '-'",
                ));
                continue;
            }
            match value {
                Value::Null | Value::Bool(false) => {}
                Value::Bool(true) => args.push(format!("--{key}")),
                Value::Number(n) => args.push(format!("--{key}={n}")),
                Value::String(s) if s.contains('\0') => {
                    invalid.push(InvalidFlag::new(key, "value must not contain NUL bytes"));
                }
                Value::String(s) => args.push(format!("--{key}={s}")),
                Value::Array(_) | Value::Object(_) => {
                    invalid.push(InvalidFlag::new(
                        key,
                        "value must be a string, number or boolean",
                    ));
                }
            }
        }

        if !missing.is_empty() || !invalid.is_empty() {
            return Err(ValidationError { missing, invalid });
        }

        args.extend(self.trailing_flags.iter().cloned());
        Ok(CommandLine::new(self.program.clone(), args))
    }
}

impl Default for FlagSchema {
    fn default() -> Self {
        Self::management_cluster()
    }
}

// ---------------------------------------------------------------------------
// Validation error
// ---------------------------------------------------------------------------

/// A submitted flag that was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidFlag {
    pub name: String,
    pub reason: String,
}

impl InvalidFlag {
    fn new(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Submitted parameters cannot be turned into a command.
///
/// Lists every missing required flag and every invalid flag, never just the
/// first problem found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub missing: Vec<String>,
    pub invalid: Vec<InvalidFlag>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("Missing required flags: {}", self.missing.join(" ")));
        }
        if !self.invalid.is_empty() {
            let invalid: Vec<String> = self
                .invalid
                .iter()
                .map(|i| format!("{} ({})", i.name, i.reason))
                .collect();
            parts.push(format!("Invalid flags: {}", invalid.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// An executable plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// A [`tokio::process::Command`] for this command line. No shell is
    /// involved; each argument reaches the program verbatim.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Renders the command with POSIX single quoting where needed, so the
/// stored string can be pasted into a shell to reproduce the run.
impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:,@%+".contains(c));
    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
