//! detectors/units.rs
//!
//! Splits a C program into translation units: one per named type, one for
//! globals and macros, one per function. Dependencies are derived from the
//! identifiers each unit mentions.

use std::collections::{BTreeSet, HashMap, HashSet};

use tree_sitter::Node;

use super::ast::{node_text, parse_c, walk};
use crate::state::{TranslationUnit, UnitKind};

pub const GLOBALS_ID: &str = "globals";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    Unparsable,
    NoEntryPoint,
    /// Mutually dependent units; callers fall back to one program unit.
    Cyclic(Vec<String>),
}

struct Piece {
    id: String,
    kind: UnitKind,
    names: Vec<String>,
    text: String,
    signature: Option<String>,
    mentions: HashSet<String>,
}

/// Decompose `source` into units in dependency order (leaves first).
pub fn decompose(source: &str) -> Result<Vec<TranslationUnit>, PlanError> {
    let tree = parse_c(source).ok_or(PlanError::Unparsable)?;
    let root = tree.root_node();

    let mut includes = Vec::new();
    let mut globals = Vec::new();
    let mut global_names = Vec::new();
    let mut pieces: Vec<Piece> = Vec::new();

    let mut cursor = root.walk();
    for node in root.children(&mut cursor) {
        match node.kind() {
            "preproc_include" => includes.push(node_text(node, source).trim().to_string()),

            "preproc_def" | "preproc_function_def" => {
                if let Some(n) = node.child_by_field_name("name") {
                    global_names.push(node_text(n, source).to_string());
                }
                globals.push(node_text(node, source).trim().to_string());
            }

            "declaration" => {
                // Prototypes are dropped; definitions carry the signature.
                if declares_function(node) {
                    continue;
                }
                global_names.extend(declared_names(node, source));
                globals.push(node_text(node, source).trim().to_string());
            }

            "struct_specifier" | "enum_specifier" | "union_specifier"
                if node.child_by_field_name("body").is_none() => {}

            "type_definition" | "struct_specifier" | "enum_specifier" | "union_specifier" => {
                let names = type_names(node, source);
                let Some(first) = names.first().cloned() else {
                    continue;
                };
                let mut text = node_text(node, source).trim().to_string();
                if !text.ends_with(';') {
                    text.push(';');
                }
                let id = format!("type:{}", first);

                // `struct X {..};` followed by `typedef struct X X;`
                if let Some(existing) = pieces.iter_mut().find(|p| p.id == id) {
                    existing.text.push('\n');
                    existing.text.push_str(&text);
                    existing.names.extend(names);
                    existing.mentions.extend(mentions(node, source));
                    continue;
                }

                pieces.push(Piece {
                    id,
                    kind: UnitKind::Type,
                    names,
                    text,
                    signature: None,
                    mentions: mentions(node, source),
                });
            }

            "function_definition" => {
                let Some(name) = function_name(node, source) else {
                    continue;
                };
                let signature = node
                    .child_by_field_name("body")
                    .map(|b| source[node.start_byte()..b.start_byte()].trim().to_string());
                pieces.push(Piece {
                    id: format!("fn:{}", name),
                    kind: UnitKind::Function,
                    names: vec![name],
                    text: node_text(node, source).trim().to_string(),
                    signature,
                    mentions: mentions(node, source),
                });
            }

            _ => {}
        }
    }

    if !pieces.iter().any(|p| p.id == "fn:main") {
        return Err(PlanError::NoEntryPoint);
    }

    if !globals.is_empty() {
        let text = globals.join("\n");
        let mut m = HashSet::new();
        for g in &globals {
            if let Some(t) = parse_c(g) {
                m.extend(mentions(t.root_node(), g));
            }
        }
        pieces.insert(
            0,
            Piece {
                id: GLOBALS_ID.into(),
                kind: UnitKind::Type,
                names: global_names,
                text,
                signature: None,
                mentions: m,
            },
        );
    }

    let owner: HashMap<&str, &str> = pieces
        .iter()
        .flat_map(|p| p.names.iter().map(move |n| (n.as_str(), p.id.as_str())))
        .collect();

    let header = includes.join("\n");

    let mut units: Vec<TranslationUnit> = pieces
        .iter()
        .map(|p| {
            let deps: BTreeSet<String> = p
                .mentions
                .iter()
                .filter_map(|m| owner.get(m.as_str()))
                .filter(|id| **id != p.id)
                .map(|id| id.to_string())
                .collect();

            let source = if header.is_empty() {
                p.text.clone()
            } else {
                format!("{}\n\n{}", header, p.text)
            };

            TranslationUnit {
                id: p.id.clone(),
                kind: p.kind,
                source,
                signature: p.signature.clone(),
                dependencies: deps.into_iter().collect(),
                entry: p.id == "fn:main",
            }
        })
        .collect();

    order_units(&mut units)?;
    Ok(units)
}

/// Stable topological sort; keeps source order among independent units.
pub fn order_units(units: &mut Vec<TranslationUnit>) -> Result<(), PlanError> {
    let mut done: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(units.len());
    let mut remaining: Vec<TranslationUnit> = std::mem::take(units);

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut next = Vec::new();

        for unit in remaining {
            if unit.dependencies.iter().all(|d| done.contains(d)) {
                ordered.push(unit);
            } else {
                next.push(unit);
            }
        }

        for u in &ordered[ordered.len() - (before - next.len())..] {
            done.insert(u.id.clone());
        }

        if next.len() == before {
            return Err(PlanError::Cyclic(next.into_iter().map(|u| u.id).collect()));
        }
        remaining = next;
    }

    *units = ordered;
    Ok(())
}

/// Group ordered units into layers whose members only depend on earlier
/// layers. Members of one layer can be translated concurrently.
pub fn layers(units: &[TranslationUnit]) -> Vec<Vec<usize>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<Vec<usize>> = Vec::new();

    for (i, u) in units.iter().enumerate() {
        let d = u
            .dependencies
            .iter()
            .filter_map(|dep| depth.get(dep.as_str()))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(u.id.as_str(), d);

        if out.len() <= d {
            out.resize_with(d + 1, Vec::new);
        }
        out[d].push(i);
    }

    out
}

/* ============================================================
   Helpers
   ============================================================ */

fn declares_function(node: Node) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children_by_field_name("declarator", &mut cursor)
        .any(is_function_declarator);
    found
}

fn is_function_declarator(node: Node) -> bool {
    match node.kind() {
        "function_declarator" => true,
        "pointer_declarator" => node
            .child_by_field_name("declarator")
            .map(is_function_declarator)
            .unwrap_or(false),
        _ => false,
    }
}

fn declared_names(node: Node, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = node.walk();
    for child in node.children_by_field_name("declarator", &mut cursor) {
        if let Some(id) = innermost_identifier(child, source) {
            names.push(id);
        }
    }
    names
}

fn innermost_identifier(node: Node, source: &str) -> Option<String> {
    if node.kind() == "identifier" {
        return Some(node_text(node, source).to_string());
    }
    let inner = node.child_by_field_name("declarator")?;
    innermost_identifier(inner, source)
}

fn function_name(node: Node, source: &str) -> Option<String> {
    innermost_identifier(node.child_by_field_name("declarator")?, source)
}

fn type_names(node: Node, source: &str) -> Vec<String> {
    let mut names = Vec::new();

    match node.kind() {
        "type_definition" => {
            let mut cursor = node.walk();
            for d in node.children_by_field_name("declarator", &mut cursor) {
                if d.kind() == "type_identifier" {
                    names.push(node_text(d, source).to_string());
                }
            }
            if let Some(inner) = node.child_by_field_name("type") {
                if let Some(n) = inner.child_by_field_name("name") {
                    names.push(node_text(n, source).to_string());
                }
            }
        }
        _ => {
            if let Some(n) = node.child_by_field_name("name") {
                names.push(node_text(n, source).to_string());
            }
        }
    }

    if node.kind() == "enum_specifier" || has_enum(node) {
        names.extend(enumerators(node, source));
    }

    names
}

fn has_enum(node: Node) -> bool {
    node.child_by_field_name("type")
        .map(|t| t.kind() == "enum_specifier")
        .unwrap_or(false)
}

fn enumerators(node: Node, source: &str) -> Vec<String> {
    let mut out = Vec::new();
    walk(node, &mut |n| {
        if n.kind() == "enumerator" {
            if let Some(name) = n.child_by_field_name("name") {
                out.push(node_text(name, source).to_string());
            }
        }
    });
    out
}

fn mentions(node: Node, source: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    walk(node, &mut |n| {
        if matches!(n.kind(), "identifier" | "type_identifier" | "field_identifier") {
            out.insert(node_text(n, source).to_string());
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"
#include <stdio.h>
#define LIMIT 10

typedef struct Point { int x; int y; } Point;

int total = 0;

int add(int a, int b);

int add(int a, int b) {
    return a + b;
}

int norm(Point p) {
    return add(p.x, p.y) + LIMIT;
}

int main(void) {
    Point p = {1, 2};
    total = norm(p);
    printf("%d\n", total);
    return 0;
}
"#;

    #[test]
    fn decomposes_types_globals_and_functions() {
        let units = decompose(PROGRAM).unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();

        assert!(ids.contains(&"globals"));
        assert!(ids.contains(&"type:Point"));
        assert!(ids.contains(&"fn:add"));
        assert!(ids.contains(&"fn:norm"));
        assert_eq!(*ids.last().unwrap(), "fn:main");

        let main = units.iter().find(|u| u.id == "fn:main").unwrap();
        assert!(main.entry);
        assert!(main.dependencies.contains(&"fn:norm".to_string()));
        assert!(main.dependencies.contains(&"globals".to_string()));
        assert!(main.source.starts_with("#include <stdio.h>"));
    }

    #[test]
    fn dependencies_precede_dependents() {
        let units = decompose(PROGRAM).unwrap();
        let pos = |id: &str| units.iter().position(|u| u.id == id).unwrap();

        assert!(pos("fn:add") < pos("fn:norm"));
        assert!(pos("type:Point") < pos("fn:norm"));
        assert!(pos("fn:norm") < pos("fn:main"));
    }

    #[test]
    fn prototypes_are_not_units() {
        let units = decompose(PROGRAM).unwrap();
        assert_eq!(units.iter().filter(|u| u.id == "fn:add").count(), 1);
        let globals = units.iter().find(|u| u.id == "globals").unwrap();
        assert!(!globals.source.contains("int add(int a, int b);"));
    }

    #[test]
    fn mutual_recursion_is_cyclic() {
        let src = "int odd(int n);\nint even(int n) { return n == 0 ? 1 : odd(n - 1); }\nint odd(int n) { return n == 0 ? 0 : even(n - 1); }\nint main(void) { return even(4); }\n";
        assert!(matches!(decompose(src), Err(PlanError::Cyclic(_))));
    }

    #[test]
    fn missing_main_is_rejected() {
        assert_eq!(decompose("int f(void) { return 1; }"), Err(PlanError::NoEntryPoint));
    }

    #[test]
    fn layers_group_independent_units() {
        let units = decompose(PROGRAM).unwrap();
        let layers = layers(&units);
        let first: Vec<&str> = layers[0].iter().map(|i| units[*i].id.as_str()).collect();
        assert!(first.contains(&"fn:add"));
        assert!(first.contains(&"type:Point"));
        assert_eq!(layers.last().unwrap().len(), 1);
    }
}
