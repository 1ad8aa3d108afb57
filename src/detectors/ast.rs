//! detectors/ast.rs
//!
//! tree-sitter helpers for C sources and Rust translations.

use std::cell::RefCell;

use tree_sitter::{Node, Parser, Tree};

thread_local! {
    static C_PARSER: RefCell<Option<Parser>> = RefCell::new(make_parser(&tree_sitter_c::language()));
    static RS_PARSER: RefCell<Option<Parser>> = RefCell::new(make_parser(&tree_sitter_rust::language()));
}

fn make_parser(language: &tree_sitter::Language) -> Option<Parser> {
    let mut p = Parser::new();
    p.set_language(language).ok()?;
    Some(p)
}

pub fn parse_c(source: &str) -> Option<Tree> {
    C_PARSER.with(|p| p.borrow_mut().as_mut()?.parse(source, None))
}

pub fn parse_rust(source: &str) -> Option<Tree> {
    RS_PARSER.with(|p| p.borrow_mut().as_mut()?.parse(source, None))
}

pub fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// Depth-first visit of every node under `root`, named or not.
pub fn walk<'a>(root: Node<'a>, visit: &mut impl FnMut(Node<'a>)) {
    let mut cursor = root.walk();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        visit(node);
        let children: Vec<Node<'a>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
}

/* ============================================================
   Rust: unsafe detection
   ============================================================ */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeSite {
    /// 1-based line.
    pub line: usize,
    /// Enclosing construct, e.g. `unsafe_block`, `function_modifiers`.
    pub context: String,
}

/// Every `unsafe` keyword token. Comments and string literals never match.
pub fn find_unsafe(source: &str) -> Option<Vec<UnsafeSite>> {
    let tree = parse_rust(source)?;
    let mut sites = Vec::new();

    walk(tree.root_node(), &mut |node| {
        if !node.is_named() && node.kind() == "unsafe" {
            let context = node
                .parent()
                .map(|p| p.kind().to_string())
                .unwrap_or_else(|| "source_file".into());
            sites.push(UnsafeSite {
                line: node.start_position().row + 1,
                context,
            });
        }
    });

    Some(sites)
}

/* ============================================================
   Rust: top-level items
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemClass {
    /// `#![...]`, hoisted to the top of a combined file.
    InnerAttribute,
    Use,
    ExternCrate,
    Item,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RustItem {
    pub class: ItemClass,
    /// Tree-sitter kind of the item node, e.g. `function_item`.
    pub kind: String,
    pub name: Option<String>,
    /// Full text including leading attributes and doc comments.
    pub text: String,
}

/// Split a Rust file into top-level items, keeping attributes and
/// comments attached to the item that follows them.
pub fn top_level_items(source: &str) -> Option<Vec<RustItem>> {
    let tree = parse_rust(source)?;
    let root = tree.root_node();

    let mut items = Vec::new();
    let mut pending_start: Option<usize> = None;
    let mut cursor = root.walk();

    for node in root.children(&mut cursor) {
        match node.kind() {
            "attribute_item" | "line_comment" | "block_comment" => {
                pending_start.get_or_insert(node.start_byte());
                continue;
            }
            _ => {}
        }

        let start = pending_start.take().unwrap_or(node.start_byte());
        let text = source[start..node.end_byte()].trim().to_string();

        let class = match node.kind() {
            "inner_attribute_item" => ItemClass::InnerAttribute,
            "use_declaration" => ItemClass::Use,
            "extern_crate_declaration" => ItemClass::ExternCrate,
            _ => ItemClass::Item,
        };

        let name = node
            .child_by_field_name("name")
            .map(|n| node_text(n, source).to_string());

        items.push(RustItem {
            class,
            kind: node.kind().to_string(),
            name,
            text,
        });
    }

    // Trailing comments with no item after them.
    if let Some(start) = pending_start {
        let tail = source[start..].trim();
        if !tail.is_empty() {
            items.push(RustItem {
                class: ItemClass::Item,
                kind: "comment".into(),
                name: None,
                text: tail.to_string(),
            });
        }
    }

    Some(items)
}

pub fn defines_main(source: &str) -> bool {
    top_level_items(source)
        .map(|items| {
            items
                .iter()
                .any(|i| i.kind == "function_item" && i.name.as_deref() == Some("main"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_unsafe_block_and_fn_but_not_comments() {
        let src = r#"
// unsafe in a comment
fn main() {
    let s = "unsafe";
    unsafe { libc::puts(s.as_ptr() as *const i8); }
}

unsafe fn raw() {}
"#;
        let sites = find_unsafe(src).unwrap();
        let lines: Vec<usize> = sites.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![5, 8]);
    }

    #[test]
    fn safe_code_has_no_sites() {
        let sites = find_unsafe("fn main() { println!(\"{}\", 1 + 1); }").unwrap();
        assert!(sites.is_empty());
    }

    #[test]
    fn items_keep_leading_attributes() {
        let src = "#![allow(dead_code)]\nuse std::io;\n\n/// A point.\n#[derive(Debug)]\nstruct P { x: i32 }\n\nfn main() {}\n";
        let items = top_level_items(src).unwrap();

        assert_eq!(items.len(), 4);
        assert_eq!(items[0].class, ItemClass::InnerAttribute);
        assert_eq!(items[1].class, ItemClass::Use);
        assert_eq!(items[2].name.as_deref(), Some("P"));
        assert!(items[2].text.starts_with("/// A point."));
        assert!(items[2].text.contains("#[derive(Debug)]"));
        assert!(defines_main(src));
    }

    #[test]
    fn c_parser_is_available() {
        let tree = parse_c("int main(void) { return 0; }").unwrap();
        assert_eq!(tree.root_node().kind(), "translation_unit");
    }
}
