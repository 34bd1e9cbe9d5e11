//! Version consistency validation
//!
//! Compares the checked-in expected-version declaration (`name:tag` per line)
//! with the image tags the deployment overlay actually pins. Every finding is
//! collected before reporting so one run shows the full correction set.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use deckhand_common::yaml::{self, normalize_line_endings};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::render::overlay::ImageOverride;
use crate::{Error, Result};

/// Name of the overlay file that carries the image tag assignments
pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// One `name:tag` line of the declaration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredVersion {
    /// Component name
    pub name: String,
    /// Tag the release expects
    pub tag: String,
    /// 1-based line number in the declaration file
    pub line: usize,
}

/// The release's expected versions, in file order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionDeclaration {
    /// Entries in declaration order
    pub entries: Vec<DeclaredVersion>,
}

impl VersionDeclaration {
    /// Read and parse a declaration file
    pub fn load(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::declaration(&display, format!("cannot read file: {}", e)))?;
        Self::parse(&display, &content)
    }

    /// Parse declaration text. `source` only labels error messages.
    ///
    /// Blank lines and `#` comments are ignored; a trailing ` # ...` comment
    /// on an entry line is stripped.
    pub fn parse(source: &str, content: &str) -> Result<Self> {
        let content = normalize_line_endings(content);
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = match raw.find(" #").or_else(|| raw.find("\t#")) {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, tag)) = line.split_once(':') else {
                return Err(Error::declaration(
                    source,
                    format!("line {}: expected name:tag, got '{}'", line_no, line),
                ));
            };
            let (name, tag) = (name.trim(), tag.trim());

            if name.is_empty() || tag.is_empty() {
                return Err(Error::declaration(
                    source,
                    format!("line {}: empty name or tag in '{}'", line_no, line),
                ));
            }
            if name.contains(char::is_whitespace) || tag.contains(char::is_whitespace) {
                return Err(Error::declaration(
                    source,
                    format!("line {}: whitespace inside '{}'", line_no, line),
                ));
            }
            if !seen.insert(name.to_string()) {
                return Err(Error::declaration(
                    source,
                    format!("line {}: component '{}' declared twice", line_no, name),
                ));
            }

            entries.push(DeclaredVersion {
                name: name.to_string(),
                tag: tag.to_string(),
                line: line_no,
            });
        }

        if entries.is_empty() {
            return Err(Error::declaration(source, "no component versions declared"));
        }

        Ok(Self { entries })
    }
}

/// The `images:` list of a kustomization, with tags kept as written
#[derive(Debug, Default, Deserialize)]
struct OverlayImages {
    #[serde(default)]
    images: Vec<ImageOverride>,
}

/// Tags pinned by the overlay, keyed by component name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverlayTagMap {
    /// component name -> declared tag
    pub tags: BTreeMap<String, String>,
    /// components whose image entry is present but commented out
    pub commented_out: BTreeSet<String>,
}

impl OverlayTagMap {
    /// Read the tag assignments from `<overlay_dir>/kustomization.yaml`
    pub fn load(overlay_dir: &Path) -> Result<Self> {
        let path = overlay_dir.join(KUSTOMIZATION_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::declaration(path.display().to_string(), format!("cannot read overlay: {}", e))
        })?;
        Self::parse(&path.display().to_string(), &content)
    }

    /// Parse tag assignments from kustomization text.
    ///
    /// Component names are the last path segment of `images[].name`; entries
    /// without `newTag` are not tag assignments.
    pub fn parse(source: &str, content: &str) -> Result<Self> {
        let content = normalize_line_endings(content);
        let invalid =
            |e: yaml::YamlError| Error::declaration(source, format!("invalid overlay YAML: {}", e));
        let images = if yaml::parse_yaml(&content).map_err(invalid)?.is_null() {
            Vec::new()
        } else {
            yaml::from_yaml_str::<OverlayImages>(&content)
                .map_err(invalid)?
                .images
        };

        let tags: BTreeMap<String, String> = images
            .into_iter()
            .filter_map(|image| {
                let tag = image.new_tag?;
                Some((component_name(&image.name).to_string(), tag))
            })
            .collect();

        let commented_out = commented_image_names(&content)
            .into_iter()
            .filter(|name| !tags.contains_key(name))
            .collect();

        Ok(Self { tags, commented_out })
    }
}

/// Last path segment of an image repository (`registry/team/svc-a` -> `svc-a`)
pub fn component_name(image: &str) -> &str {
    image.rsplit('/').next().unwrap_or(image)
}

/// Names from lines shaped like `# - name: registry/svc-a`
fn commented_image_names(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix('#'))
        .map(|rest| rest.trim_start())
        .map(|rest| rest.strip_prefix('-').map(str::trim_start).unwrap_or(rest))
        .filter_map(|rest| rest.strip_prefix("name:"))
        .map(|name| name.trim().trim_matches('"').trim_matches('\''))
        .filter(|name| !name.is_empty())
        .map(|name| component_name(name).to_string())
        .collect()
}

/// How absent overlay entries may be explained
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExclusionPolicy {
    /// Components intentionally left out of this overlay
    pub explicit: BTreeSet<String>,
    /// Also treat commented-out image entries as intentional exclusions
    pub infer_from_comments: bool,
}

/// Overall validation verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ValidationStatus {
    /// Every declared component matches
    Pass,
    /// Only warnings (exclusions, or failures downgraded by override)
    Warn,
    /// Hard mismatches or unexplained omissions
    Fail,
}

/// Declared and overlay tags disagree
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    /// Component name
    pub name: String,
    /// Tag from the declaration
    pub expected: String,
    /// Tag pinned by the overlay
    pub declared: String,
}

/// A declared component the overlay does not pin
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Omission {
    /// Component name
    pub name: String,
    /// Tag from the declaration
    pub expected: String,
}

/// Why an absent component was accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExclusionReason {
    /// Named in the explicit exclusion list
    Explicit,
    /// Inferred from a commented-out overlay entry
    CommentedOut,
}

/// An absent component accepted as intentionally excluded
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    /// Component name
    pub name: String,
    /// Tag from the declaration
    pub expected: String,
    /// How the exclusion was established
    pub reason: ExclusionReason,
}

/// Result of comparing a declaration with an overlay
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Components whose tags differ
    pub mismatches: Vec<Mismatch>,
    /// Declared components absent from the overlay without explanation
    pub missing_in_overlay: Vec<Omission>,
    /// Declared components absent from the overlay by intent
    pub excluded: Vec<Exclusion>,
    /// Whether hard failures were downgraded to warnings
    pub overridden: bool,
    /// Overall verdict
    pub status: ValidationStatus,
}

impl ValidationReport {
    /// Mismatches plus unexplained omissions
    pub fn hard_findings(&self) -> usize {
        self.mismatches.len() + self.missing_in_overlay.len()
    }

    /// `Err(Consistency)` when the verdict is [`ValidationStatus::Fail`]
    pub fn ensure_passed(&self) -> Result<()> {
        match self.status {
            ValidationStatus::Fail => Err(Error::Consistency {
                findings: self.hard_findings(),
            }),
            _ => Ok(()),
        }
    }

    /// Human-readable report, one finding per line
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.mismatches.is_empty() {
            out.push_str("Tag mismatches:\n");
            for m in &self.mismatches {
                out.push_str(&format!(
                    "  - {}: expected={} declared={}\n",
                    m.name, m.expected, m.declared
                ));
            }
        }

        if !self.missing_in_overlay.is_empty() {
            out.push_str("Missing from overlay:\n");
            for o in &self.missing_in_overlay {
                out.push_str(&format!("  - {}: expected={}\n", o.name, o.expected));
            }
        }

        if !self.excluded.is_empty() {
            out.push_str("Excluded (warning only):\n");
            for e in &self.excluded {
                let why = match e.reason {
                    ExclusionReason::Explicit => "explicit exclusion",
                    ExclusionReason::CommentedOut => "commented out in overlay",
                };
                out.push_str(&format!("  - {}: expected={} ({})\n", e.name, e.expected, why));
            }
        }

        let verdict = match (self.status, self.overridden) {
            (ValidationStatus::Pass, _) => "Version check passed".to_string(),
            (ValidationStatus::Warn, true) => format!(
                "Version check has {} finding(s), downgraded to warnings by override",
                self.hard_findings()
            ),
            (ValidationStatus::Warn, false) => "Version check passed with warnings".to_string(),
            (ValidationStatus::Fail, _) => format!(
                "Version check failed with {} finding(s)",
                self.hard_findings()
            ),
        };
        out.push_str(&verdict);
        out.push('\n');
        out
    }
}

/// Compare every declared component with the overlay.
///
/// `allow_override` downgrades hard failures to warnings; the comparison
/// itself always runs.
pub fn validate(
    declaration: &VersionDeclaration,
    overlay: &OverlayTagMap,
    policy: &ExclusionPolicy,
    allow_override: bool,
) -> ValidationReport {
    let mut mismatches = Vec::new();
    let mut missing_in_overlay = Vec::new();
    let mut excluded = Vec::new();

    for entry in &declaration.entries {
        match overlay.tags.get(&entry.name) {
            Some(tag) if *tag == entry.tag => {}
            Some(tag) => mismatches.push(Mismatch {
                name: entry.name.clone(),
                expected: entry.tag.clone(),
                declared: tag.clone(),
            }),
            None if policy.explicit.contains(&entry.name) => excluded.push(Exclusion {
                name: entry.name.clone(),
                expected: entry.tag.clone(),
                reason: ExclusionReason::Explicit,
            }),
            None if policy.infer_from_comments && overlay.commented_out.contains(&entry.name) => {
                warn!(
                    component = %entry.name,
                    "treating commented-out overlay entry as an intentional exclusion"
                );
                excluded.push(Exclusion {
                    name: entry.name.clone(),
                    expected: entry.tag.clone(),
                    reason: ExclusionReason::CommentedOut,
                });
            }
            None => missing_in_overlay.push(Omission {
                name: entry.name.clone(),
                expected: entry.tag.clone(),
            }),
        }
    }

    let hard = !mismatches.is_empty() || !missing_in_overlay.is_empty();
    let status = match (hard, allow_override, excluded.is_empty()) {
        (true, false, _) => ValidationStatus::Fail,
        (true, true, _) => ValidationStatus::Warn,
        (false, _, false) => ValidationStatus::Warn,
        (false, _, true) => ValidationStatus::Pass,
    };

    ValidationReport {
        mismatches,
        missing_in_overlay,
        excluded,
        overridden: hard && allow_override,
        status,
    }
}

/// Load the declaration and overlay from disk and compare them.
pub fn check(
    versions_file: &Path,
    overlay_dir: &Path,
    policy: &ExclusionPolicy,
    allow_override: bool,
) -> Result<ValidationReport> {
    let declaration = VersionDeclaration::load(versions_file)?;
    let overlay = OverlayTagMap::load(overlay_dir)?;
    Ok(validate(&declaration, &overlay, policy, allow_override))
}
