//! combine.rs
//!
//! Merges accepted unit translations into one Rust program and writes the
//! result directory. Also owns the single-file assembly and Cargo package
//! layout the verifier builds from.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::detectors::ast::{defines_main, top_level_items, ItemClass};
use crate::detectors::units::{order_units, PlanError};
use crate::error::CombineError;
use crate::orchestrator::SessionReport;
use crate::state::{Phase, TerminalStatus, TranslationUnit};

pub const PACKAGE_NAME: &str = "translated";
const CRATE_ATTRIBUTES: &str = "#![allow(dead_code, unused, non_snake_case, non_camel_case_types, non_upper_case_globals)]";

#[derive(Debug, Clone)]
pub struct CombinedArtifact {
    pub phase: Phase,
    pub code: String,
    /// Unit ids in emission order.
    pub unit_order: Vec<String>,
}

/* ============================================================
   Combination
   ============================================================ */

/// Fail-closed merge of every unit's accepted `phase` translation.
pub fn combine(reports: &[SessionReport], phase: Phase) -> Result<CombinedArtifact, CombineError> {
    let known: HashSet<&str> = reports.iter().map(|r| r.unit.id.as_str()).collect();

    for r in reports {
        if let Some(missing) = r.unit.dependencies.iter().find(|d| !known.contains(d.as_str())) {
            return Err(CombineError::UnresolvedReference {
                from: r.unit.id.clone(),
                to: missing.clone(),
            });
        }
    }

    let incomplete: Vec<String> = reports
        .iter()
        .filter(|r| r.status != TerminalStatus::Succeeded || r.accepted(phase).is_none())
        .map(|r| r.unit.id.clone())
        .collect();
    if !incomplete.is_empty() {
        return Err(CombineError::IncompleteTranslation(incomplete));
    }

    let mut units: Vec<TranslationUnit> = reports.iter().map(|r| r.unit.clone()).collect();
    order_units(&mut units).map_err(|e| match e {
        PlanError::Cyclic(ids) => CombineError::Cycle(ids),
        other => CombineError::Cycle(vec![format!("{:?}", other)]),
    })?;

    // Dependencies before dependents; the entry unit always last. Stable,
    // so the dependency order survives.
    units.sort_by_key(|u| u.entry);

    let by_id: HashMap<&str, &SessionReport> =
        reports.iter().map(|r| (r.unit.id.as_str(), r)).collect();

    let mut parts = Vec::with_capacity(units.len());
    for u in &units {
        if let Some(code) = by_id.get(u.id.as_str()).and_then(|r| r.accepted(phase)) {
            parts.push(code.code.as_str());
        }
    }

    let code = assemble(&parts, false);
    debug!(phase = %phase, units = units.len(), bytes = code.len(), "combined");

    Ok(CombinedArtifact {
        phase,
        code,
        unit_order: units.into_iter().map(|u| u.id).collect(),
    })
}

/// Concatenate Rust fragments into one file. Inner attributes and `use`
/// lines are hoisted; repeated items (same kind and name, or same text)
/// keep their first occurrence. With `stub_main`, a missing `fn main` is
/// added so the file builds as a binary.
pub fn assemble(parts: &[&str], stub_main: bool) -> String {
    let mut attrs: Vec<String> = vec![CRATE_ATTRIBUTES.to_string()];
    let mut uses: Vec<String> = Vec::new();
    let mut items: Vec<String> = Vec::new();

    let mut seen_named: HashSet<(String, String)> = HashSet::new();
    let mut seen_text: HashSet<String> = HashSet::new();

    for part in parts {
        let Some(parsed) = top_level_items(part) else {
            items.push(part.trim().to_string());
            continue;
        };

        for item in parsed {
            match item.class {
                ItemClass::InnerAttribute => {
                    if !attrs.contains(&item.text) {
                        attrs.push(item.text);
                    }
                }
                ItemClass::Use | ItemClass::ExternCrate => {
                    if !uses.contains(&item.text) {
                        uses.push(item.text);
                    }
                }
                ItemClass::Item => {
                    let fresh = match &item.name {
                        Some(name) => seen_named.insert((item.kind.clone(), name.clone())),
                        None => seen_text.insert(item.text.clone()),
                    };
                    if fresh {
                        items.push(item.text);
                    }
                }
            }
        }
    }

    let mut out = attrs.join("\n");
    out.push_str("\n\n");
    if !uses.is_empty() {
        out.push_str(&uses.join("\n"));
        out.push_str("\n\n");
    }
    out.push_str(&items.join("\n\n"));
    out.push('\n');

    if stub_main && !defines_main(&out) {
        out.push_str("\nfn main() {}\n");
    }

    out
}

/* ============================================================
   Cargo package layout
   ============================================================ */

pub fn manifest(edition: &str, code: &str) -> String {
    let mut m = format!(
        "[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"{}\"\n\n[workspace]\n\n[dependencies]\n",
        PACKAGE_NAME, edition
    );
    if code.contains("libc::") {
        m.push_str("libc = \"0.2\"\n");
    }
    m
}

/// Write `Cargo.toml` + `src/main.rs` under `dir`, replacing old sources.
pub fn write_package(dir: &Path, code: &str, edition: &str) -> std::io::Result<PathBuf> {
    let src = dir.join("src");
    fs::create_dir_all(&src)?;
    fs::write(dir.join("Cargo.toml"), manifest(edition, code))?;

    let main = src.join("main.rs");
    fs::write(&main, code)?;
    Ok(main)
}

/// Every `.rs` file of a package's `src/` tree.
pub fn package_sources(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir.join("src"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map(|x| x == "rs").unwrap_or(false))
        .map(|e| e.into_path())
        .collect()
}

/// `translated_code_<phase>/` and `combined_<phase>.rs` under `result_dir`.
pub fn write_artifact(
    artifact: &CombinedArtifact,
    result_dir: &Path,
    edition: &str,
) -> Result<PathBuf, CombineError> {
    let pkg = result_dir.join(format!("translated_code_{}", artifact.phase));
    write_package(&pkg, &artifact.code, edition)?;

    let single = result_dir.join(format!("combined_{}.rs", artifact.phase));
    fs::write(&single, &artifact.code)?;

    info!(
        phase = %artifact.phase,
        package = %pkg.display(),
        units = artifact.unit_order.len(),
        "wrote combined translation"
    );
    Ok(pkg)
}
