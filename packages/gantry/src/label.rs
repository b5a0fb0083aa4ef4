//! Build labels.

use std::str::FromStr;

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Canonical identifier of a build target: a package path plus a name.
///
/// Labels are totally ordered (package first, then name) so that iteration
/// over label-keyed collections is deterministic.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("//{package}:{name}")]
pub struct BuildLabel {
    /// Package path, relative to the repo root. May be empty for the root
    /// package.
    pub package: String,

    /// Target name within the package.
    pub name: String,
}

impl BuildLabel {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    /// Parse a label of the form `//pkg:name`, `//pkg` (name defaults to the
    /// last package component) or `:name` (relative to `current_package`).
    pub fn parse(s: &str, current_package: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix(':') {
            if name.is_empty() {
                bail!("empty target name in label {s:?}");
            }
            return Ok(Self::new(current_package, name));
        }
        let rest = match s.strip_prefix("//") {
            Some(rest) => rest,
            None => bail!("label {s:?} must start with // or :"),
        };
        match rest.split_once(':') {
            Some((package, name)) => {
                if name.is_empty() {
                    bail!("empty target name in label {s:?}");
                }
                Ok(Self::new(package, name))
            }
            None => {
                let name = match rest.rsplit('/').next() {
                    Some(name) if !name.is_empty() => name,
                    _ => bail!("label {s:?} has no target name"),
                };
                Ok(Self::new(rest, name))
            }
        }
    }
}

impl FromStr for BuildLabel {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, "").with_context(|| format!("parse label {s:?}"))
    }
}
