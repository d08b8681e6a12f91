//! Python structural extractor for the trace builder.
//!
//! Extracts top-level functions, async functions, classes, and one level of
//! methods, plus import edges, from Python sources using tree-sitter.
//!
//! ## Relevant tree-sitter-python node kinds
//!
//! - `function_definition` (an `async` token child marks async defs)
//! - `class_definition`
//! - `decorated_definition` -> wraps a definition with `decorator` children
//! - `import_statement`, `import_from_statement` (`relative_import` module)
//! - first `expression_statement > string` of a body -> docstring

use std::collections::BTreeMap;
use std::path::Path;

use crate::ids::{stable_edge_id, stable_external_module_id, stable_file_node_id, stable_symbol_node_id};
use crate::types::{Span, TraceEdge, TraceEdgeKind, TraceNode, TraceNodeKind};

/// Maximum docstring length carried into node metadata.
const DOCSTRING_CAP: usize = 500;

/// Result of analyzing one Python file.
pub struct PythonAnalysis {
    /// Symbol nodes extracted from the file.
    pub nodes: Vec<TraceNode>,
    /// Contains and imports edges originating at the file.
    pub edges: Vec<TraceEdge>,
}

/// Analyze a Python source file.
///
/// `file_path` is the repo-relative POSIX path; `repo_root` is used to
/// resolve imports to sibling files. Returns an error string when the file
/// cannot be parsed at all.
pub fn analyze(file_path: &str, source: &str, repo_root: &Path) -> Result<PythonAnalysis, String> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| format!("failed to load python grammar: {e}"))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| "parser returned no tree".to_string())?;
    if tree.root_node().has_error() {
        return Err("syntax error".to_string());
    }

    let mut analyzer = Analyzer {
        file_path,
        source: source.as_bytes(),
        repo_root,
        file_node_id: stable_file_node_id(file_path),
        nodes: Vec::new(),
        edges: Vec::new(),
    };

    let root = tree.root_node();
    analyzer.extract_symbols(root);
    analyzer.extract_imports(root);

    Ok(PythonAnalysis { nodes: analyzer.nodes, edges: analyzer.edges })
}

struct Analyzer<'a> {
    file_path: &'a str,
    source: &'a [u8],
    repo_root: &'a Path,
    file_node_id: String,
    nodes: Vec<TraceNode>,
    edges: Vec<TraceEdge>,
}

impl Analyzer<'_> {
    fn text(&self, node: tree_sitter::Node<'_>) -> &str {
        node.utf8_text(self.source).unwrap_or("")
    }

    // -- symbols ----------------------------------------------------------

    fn extract_symbols(&mut self, module: tree_sitter::Node<'_>) {
        let mut cursor = module.walk();
        for child in module.children(&mut cursor) {
            self.extract_definition(child, None, &[]);
        }
    }

    /// Handle a (possibly decorated) top-level or class-body definition.
    fn extract_definition(
        &mut self,
        node: tree_sitter::Node<'_>,
        parent_qualname: Option<&str>,
        decorators: &[String],
    ) {
        match node.kind() {
            "function_definition" => {
                self.add_function(node, parent_qualname, decorators);
            }
            "class_definition" if parent_qualname.is_none() => {
                self.add_class(node, decorators);
            }
            "decorated_definition" => {
                let decs = self.decorator_names(node);
                if let Some(inner) = node.child_by_field_name("definition") {
                    self.extract_definition(inner, parent_qualname, &decs);
                }
            }
            _ => {}
        }
    }

    fn add_function(
        &mut self,
        node: tree_sitter::Node<'_>,
        parent_qualname: Option<&str>,
        decorators: &[String],
    ) {
        let Some(name_node) = node.child_by_field_name("name") else { return };
        let name = self.text(name_node).to_string();
        let qualname = match parent_qualname {
            Some(parent) => format!("{parent}.{name}"),
            None => name.clone(),
        };

        let is_async = is_async_def(node);
        let symbol_type = match (is_async, parent_qualname.is_some()) {
            (true, true) => "async_method",
            (false, true) => "method",
            (true, false) => "async_function",
            (false, false) => "function",
        };

        let start_line = node.start_position().row as u32 + 1;
        let end_line = node.end_position().row as u32 + 1;

        let mut metadata = BTreeMap::new();
        metadata.insert("symbol_type".to_string(), serde_json::json!(symbol_type));
        metadata.insert("qualname".to_string(), serde_json::json!(qualname));
        metadata.insert("is_async".to_string(), serde_json::json!(is_async));
        metadata.insert("is_public".to_string(), serde_json::json!(!name.starts_with('_')));
        if !decorators.is_empty() {
            metadata.insert("decorators".to_string(), serde_json::json!(decorators));
        }
        if let Some(doc) = self.docstring_of(node) {
            metadata.insert("docstring".to_string(), serde_json::json!(doc));
        }

        self.push_symbol(&qualname, &name, start_line, end_line, metadata);
    }

    fn add_class(&mut self, node: tree_sitter::Node<'_>, decorators: &[String]) {
        let Some(name_node) = node.child_by_field_name("name") else { return };
        let name = self.text(name_node).to_string();
        let qualname = name.clone();

        let start_line = node.start_position().row as u32 + 1;
        let end_line = node.end_position().row as u32 + 1;

        let mut metadata = BTreeMap::new();
        metadata.insert("symbol_type".to_string(), serde_json::json!("class"));
        metadata.insert("qualname".to_string(), serde_json::json!(qualname));
        metadata.insert("is_public".to_string(), serde_json::json!(!name.starts_with('_')));
        if !decorators.is_empty() {
            metadata.insert("decorators".to_string(), serde_json::json!(decorators));
        }
        if let Some(doc) = self.docstring_of(node) {
            metadata.insert("docstring".to_string(), serde_json::json!(doc));
        }

        self.push_symbol(&qualname, &name, start_line, end_line, metadata);

        // Methods one level inside the class body.
        if let Some(body) = node.child_by_field_name("body") {
            let mut cursor = body.walk();
            for child in body.children(&mut cursor) {
                match child.kind() {
                    "function_definition" => self.add_function(child, Some(&qualname), &[]),
                    "decorated_definition" => {
                        let decs = self.decorator_names(child);
                        if let Some(inner) = child.child_by_field_name("definition") {
                            if inner.kind() == "function_definition" {
                                self.add_function(inner, Some(&qualname), &decs);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn push_symbol(
        &mut self,
        qualname: &str,
        name: &str,
        start_line: u32,
        end_line: u32,
        metadata: BTreeMap<String, serde_json::Value>,
    ) {
        let node_id = stable_symbol_node_id(qualname, self.file_path, start_line);
        self.nodes.push(TraceNode {
            id: node_id.clone(),
            kind: TraceNodeKind::Symbol,
            name: name.to_string(),
            file_path: self.file_path.to_string(),
            span: Some(Span { start_line, end_line }),
            language: Some("python".to_string()),
            metadata,
        });

        let edge_id = stable_edge_id("contains", &self.file_node_id, &node_id, "");
        self.edges.push(TraceEdge {
            id: edge_id,
            kind: TraceEdgeKind::Contains,
            source: self.file_node_id.clone(),
            target: node_id,
            metadata: BTreeMap::from([("confidence".to_string(), serde_json::json!(1.0))]),
        });
    }

    fn decorator_names(&self, decorated: tree_sitter::Node<'_>) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = decorated.walk();
        for child in decorated.children(&mut cursor) {
            if child.kind() == "decorator" {
                if let Some(expr) = child.named_child(0) {
                    names.push(self.dotted_name_of(expr));
                }
            }
        }
        names
    }

    /// Dotted name of a decorator expression (`name`, `a.b`, `a.b(...)`).
    fn dotted_name_of(&self, node: tree_sitter::Node<'_>) -> String {
        match node.kind() {
            "identifier" => self.text(node).to_string(),
            "attribute" => {
                let object = node
                    .child_by_field_name("object")
                    .map(|n| self.dotted_name_of(n))
                    .unwrap_or_else(|| "?".to_string());
                let attr = node
                    .child_by_field_name("attribute")
                    .map(|n| self.text(n).to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("{object}.{attr}")
            }
            "call" => node
                .child_by_field_name("function")
                .map(|n| self.dotted_name_of(n))
                .unwrap_or_else(|| "?".to_string()),
            _ => "?".to_string(),
        }
    }

    fn docstring_of(&self, def: tree_sitter::Node<'_>) -> Option<String> {
        let body = def.child_by_field_name("body")?;
        let first = body.named_child(0)?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let string_node = first.named_child(0)?;
        if string_node.kind() != "string" {
            return None;
        }

        let raw = self.text(string_node);
        let doc = strip_string_quotes(raw);
        if doc.is_empty() {
            return None;
        }
        if doc.chars().count() > DOCSTRING_CAP {
            let truncated: String = doc.chars().take(DOCSTRING_CAP - 3).collect();
            Some(format!("{truncated}..."))
        } else {
            Some(doc.to_string())
        }
    }

    // -- imports ----------------------------------------------------------

    fn extract_imports(&mut self, node: tree_sitter::Node<'_>) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                "import_statement" => self.handle_import(child),
                "import_from_statement" => self.handle_import_from(child),
                _ => self.extract_imports(child),
            }
        }
    }

    /// `import foo`, `import foo.bar`, `import foo as f`
    fn handle_import(&mut self, node: tree_sitter::Node<'_>) {
        let line = node.start_position().row as u32 + 1;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            let module = match child.kind() {
                "dotted_name" => self.text(child).to_string(),
                "aliased_import" => child
                    .child_by_field_name("name")
                    .map(|n| self.text(n).to_string())
                    .unwrap_or_default(),
                _ => continue,
            };
            if !module.is_empty() {
                self.add_absolute_import(&module, line);
            }
        }
    }

    /// `from foo import bar`, `from . import x`, `from ..pkg import y`
    fn handle_import_from(&mut self, node: tree_sitter::Node<'_>) {
        let line = node.start_position().row as u32 + 1;
        let Some(module_node) = node.child_by_field_name("module_name") else { return };

        if module_node.kind() == "relative_import" {
            let mut level = 0usize;
            let mut module = String::new();
            let mut cursor = module_node.walk();
            for child in module_node.children(&mut cursor) {
                match child.kind() {
                    "import_prefix" => level = self.text(child).matches('.').count(),
                    "dotted_name" => module = self.text(child).to_string(),
                    _ => {}
                }
            }
            if level > 0 {
                self.add_relative_import(&module, level, line);
            }
        } else {
            let module = self.text(module_node).to_string();
            if !module.is_empty() {
                self.add_absolute_import(&module, line);
            }
        }
    }

    fn add_absolute_import(&mut self, module: &str, line: u32) {
        let disambiguator = format!("{module}:{line}");
        if let Some(resolved) = self.resolve_absolute(module) {
            let target_id = stable_file_node_id(&resolved);
            self.edges.push(TraceEdge {
                id: stable_edge_id("imports", &self.file_node_id, &target_id, &disambiguator),
                kind: TraceEdgeKind::Imports,
                source: self.file_node_id.clone(),
                target: target_id,
                metadata: BTreeMap::from([
                    ("confidence".to_string(), serde_json::json!(1.0)),
                    ("import".to_string(), serde_json::json!(module)),
                    ("line".to_string(), serde_json::json!(line)),
                ]),
            });
        } else {
            let target_id = stable_external_module_id(module);
            self.edges.push(TraceEdge {
                id: stable_edge_id("imports", &self.file_node_id, &target_id, &disambiguator),
                kind: TraceEdgeKind::Imports,
                source: self.file_node_id.clone(),
                target: target_id,
                metadata: BTreeMap::from([
                    ("confidence".to_string(), serde_json::json!(0.5)),
                    ("import".to_string(), serde_json::json!(module)),
                    ("line".to_string(), serde_json::json!(line)),
                    ("external".to_string(), serde_json::json!(true)),
                ]),
            });
        }
    }

    fn add_relative_import(&mut self, module: &str, level: usize, line: u32) {
        // Start from the file's directory, then walk level-1 parents.
        let mut dir: Vec<&str> = self.file_path.split('/').collect();
        dir.pop(); // drop the filename
        for _ in 0..level.saturating_sub(1) {
            dir.pop();
        }

        let mut target = dir.join("/");
        if !module.is_empty() {
            let suffix = module.split('.').collect::<Vec<_>>().join("/");
            if target.is_empty() {
                target = suffix;
            } else {
                target = format!("{target}/{suffix}");
            }
        }

        let candidates = if target.is_empty() {
            vec!["__init__.py".to_string()]
        } else {
            vec![format!("{target}.py"), format!("{target}/__init__.py")]
        };

        let resolved = candidates.into_iter().find(|c| self.repo_root.join(c).exists());
        let Some(resolved) = resolved else { return };

        let import_str = format!("{}{module}", ".".repeat(level));
        let disambiguator = format!("{import_str}:{line}");
        let target_id = stable_file_node_id(&resolved);
        self.edges.push(TraceEdge {
            id: stable_edge_id("imports", &self.file_node_id, &target_id, &disambiguator),
            kind: TraceEdgeKind::Imports,
            source: self.file_node_id.clone(),
            target: target_id,
            metadata: BTreeMap::from([
                ("confidence".to_string(), serde_json::json!(1.0)),
                ("import".to_string(), serde_json::json!(import_str)),
                ("line".to_string(), serde_json::json!(line)),
                ("relative".to_string(), serde_json::json!(true)),
            ]),
        });
    }

    fn resolve_absolute(&self, module: &str) -> Option<String> {
        let base = module.split('.').collect::<Vec<_>>().join("/");
        let candidates = [format!("{base}.py"), format!("{base}/__init__.py")];
        candidates.into_iter().find(|c| self.repo_root.join(c).exists())
    }
}

fn is_async_def(node: tree_sitter::Node<'_>) -> bool {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "async" {
            return true;
        }
        if child.kind() == "def" {
            break;
        }
    }
    false
}

/// Strip string prefixes and quote delimiters from a Python string literal.
fn strip_string_quotes(raw: &str) -> &str {
    let s = raw.trim_start_matches(|c: char| matches!(c, 'r' | 'R' | 'b' | 'B' | 'u' | 'U' | 'f' | 'F'));
    for quote in ["\"\"\"", "'''"] {
        if s.len() >= 6 && s.starts_with(quote) && s.ends_with(quote) {
            return s[3..s.len() - 3].trim();
        }
    }
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].trim();
        }
    }
    s.trim()
}
