//! Nix expression subset: lexer, parser, and package extraction.
//!
//! Only the shape of a package expression is recovered. Nothing is
//! evaluated: variable references are followed one level, conditional
//! inputs are collected from both branches, and anything else is left
//! opaque.

pub mod lexer;
pub mod parser;

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::harvest::traits::{FormatError, FormatExtract, PackageFormat};
use crate::model::dedup_preserving_order;

pub use parser::{Binding, NixNode};

/// Leading identifier segments that never name a package.
const IGNORED_ROOTS: &[&str] = &["stdenv", "lib", "builtins", "fetchurl", "fetchgit"];

/// Trailing selectors naming an output or an override, not a package.
const OUTPUT_SUFFIXES: &[&str] = &[
    "dev",
    "out",
    "bin",
    "man",
    "override",
    "overrideAttrs",
    "overridePythonAttrs",
    "withPackages",
];

/// Functions whose last argument is a conditionally included input.
const CONDITIONAL_FNS: &[&str] = &[
    "lib.optional",
    "lib.optionals",
    "optional",
    "optionals",
    "lib.lists.optional",
    "lib.lists.optionals",
];

const MAX_REFERENCE_DEPTH: usize = 1;

/// A parsed Nix document.
#[derive(Debug, Clone, PartialEq)]
pub struct NixExpression {
    nodes: Vec<NixNode>,
}

impl NixExpression {
    pub fn parse(src: &str) -> Result<Self, FormatError> {
        Ok(Self {
            nodes: parser::parse(src)?,
        })
    }

    pub fn nodes(&self) -> &[NixNode] {
        &self.nodes
    }

    /// Finds the value bound at the attribute path `path`, searching the
    /// tree breadth-first so that shallower bindings win.
    ///
    /// Both `meta.description = ...;` and `meta = { description = ...; };`
    /// match `["meta", "description"]`.
    pub fn find_path(&self, path: &[&str]) -> Option<&NixNode> {
        let mut queue: VecDeque<&NixNode> = self.nodes.iter().collect();
        while let Some(node) = queue.pop_front() {
            if let Some(found) = lookup(node, path) {
                return Some(found);
            }
            queue.extend(node.children());
        }
        None
    }

    /// Every node of the tree, pre-order.
    fn walk(&self) -> Vec<&NixNode> {
        let mut out = Vec::new();
        let mut stack: Vec<&NixNode> = self.nodes.iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children().into_iter().rev());
        }
        out
    }

    /// Resolves `node` to a string: literals directly, identifiers through
    /// the binding of the same name.
    fn string_value(&self, node: &NixNode, depth: usize) -> Option<String> {
        match node {
            NixNode::Str(s) => Some(s.clone()),
            NixNode::Ident(name) if depth < 3 => {
                let target = self.find_path(&[name.as_str()])?;
                if target == node {
                    return None;
                }
                self.string_value(target, depth + 1)
            }
            _ => None,
        }
    }

    fn string_at(&self, path: &[&str]) -> Option<String> {
        self.find_path(path)
            .and_then(|node| self.string_value(node, 0))
            .filter(|s| !s.trim().is_empty())
    }
}

fn lookup<'n>(node: &'n NixNode, path: &[&str]) -> Option<&'n NixNode> {
    if let NixNode::With { body, .. } = node {
        return lookup(body, path);
    }
    for binding in node.bindings() {
        let bpath = &binding.path;
        if bpath.len() > path.len() || !bpath.iter().zip(path).all(|(a, b)| a == b) {
            continue;
        }
        if bpath.len() == path.len() {
            return Some(&binding.value);
        }
        if let Some(found) = lookup(&binding.value, &path[bpath.len()..]) {
            return Some(found);
        }
    }
    None
}

/// Reduces an identifier such as `pkgs.glib.dev` to the package name
/// (`glib`). Returns `None` for identifiers that are not packages.
pub fn package_name(ident: &str) -> Option<String> {
    let mut segments: Vec<&str> = ident.split('.').filter(|s| !s.is_empty()).collect();
    if segments
        .first()
        .map_or(true, |root| IGNORED_ROOTS.contains(root))
    {
        return None;
    }
    while segments.len() > 1
        && segments
            .last()
            .map_or(false, |last| OUTPUT_SUFFIXES.contains(last))
    {
        segments.pop();
    }
    let name = segments.last()?;
    if name.starts_with("${") || name.chars().any(char::is_whitespace) {
        return None;
    }
    Some(name.to_string())
}

/// Heuristic confidence in an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseQuality {
    High,
    Medium,
    Low,
}

/// `src = fetchFromGitHub { ... }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSource {
    pub fetcher: String,
    /// String-valued attributes only (owner, repo, rev, url, hash, ...).
    pub attributes: BTreeMap<String, String>,
}

/// Package information recovered from a Nix expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NixPackage {
    pub pname: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub build_inputs: Vec<String>,
    pub native_build_inputs: Vec<String>,
    pub propagated_build_inputs: Vec<String>,
    pub check_inputs: Vec<String>,
    pub src: Option<FetchSource>,
    pub imports: Vec<String>,
    /// Inputs included only under some condition (also present in the
    /// input list they were found in).
    pub conditional_inputs: Vec<String>,
    /// References that could not be followed.
    pub unresolved: Vec<String>,
    pub parse_quality: ParseQuality,
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct Inputs {
    names: Vec<String>,
    conditional: Vec<String>,
    unresolved: Vec<String>,
}

impl Inputs {
    fn push(&mut self, name: String, conditional: bool) {
        if conditional {
            self.conditional.push(name.clone());
        }
        self.names.push(name);
    }
}

impl NixPackage {
    pub fn from_expression(expr: &NixExpression) -> Self {
        let mut conditional = Vec::new();
        let mut unresolved = Vec::new();
        let mut inputs_at = |names: &[&str]| {
            let mut inputs = Inputs::default();
            for name in names {
                if let Some(node) = expr.find_path(&[*name]) {
                    collect_inputs(expr, node, false, 0, &mut inputs);
                }
            }
            conditional.extend(inputs.conditional);
            unresolved.extend(inputs.unresolved);
            dedup_preserving_order(inputs.names)
        };

        let build_inputs = inputs_at(&["buildInputs"]);
        let native_build_inputs = inputs_at(&["nativeBuildInputs"]);
        let propagated_build_inputs = inputs_at(&["propagatedBuildInputs"]);
        let check_inputs = inputs_at(&["checkInputs", "nativeCheckInputs"]);

        let (imports, variable_calls) = collect_imports(expr);

        let mut package = NixPackage {
            pname: expr.string_at(&["pname"]).or_else(|| expr.string_at(&["name"])),
            version: expr.string_at(&["version"]),
            description: expr.string_at(&["meta", "description"]),
            build_inputs,
            native_build_inputs,
            propagated_build_inputs,
            check_inputs,
            src: expr.find_path(&["src"]).and_then(fetch_source),
            imports,
            conditional_inputs: dedup_preserving_order(conditional),
            unresolved: dedup_preserving_order(unresolved),
            parse_quality: ParseQuality::Low,
            warnings: Vec::new(),
        };
        package.assess_quality(variable_calls);

        debug!(
            pname = ?package.pname,
            deps = package.dependency_count(),
            quality = ?package.parse_quality,
            warnings = package.warnings.len(),
            "Extracted Nix package"
        );
        package
    }

    fn dependency_count(&self) -> usize {
        self.build_inputs.len()
            + self.native_build_inputs.len()
            + self.propagated_build_inputs.len()
            + self.check_inputs.len()
    }

    fn assess_quality(&mut self, variable_calls: usize) {
        if !self.conditional_inputs.is_empty() {
            self.warnings.push(format!(
                "{} conditional inputs collected from all branches",
                self.conditional_inputs.len()
            ));
        }
        if !self.unresolved.is_empty() {
            self.warnings.push(format!(
                "Unresolved input references: {}",
                self.unresolved.join(", ")
            ));
        }

        self.parse_quality = if !self.imports.is_empty() {
            self.warnings.push(format!(
                "Found {} imports; external dependencies may be missing",
                self.imports.len()
            ));
            ParseQuality::Medium
        } else if variable_calls > 0 {
            self.warnings
                .push("callPackage with a variable argument; dependencies may be incomplete".to_string());
            ParseQuality::Low
        } else if self.dependency_count() == 0 {
            self.warnings
                .push("No dependencies found; package may be empty or unparsed".to_string());
            ParseQuality::Low
        } else if self.conditional_inputs.len() > 3 || !self.unresolved.is_empty() {
            ParseQuality::Medium
        } else {
            ParseQuality::High
        };
    }

    /// Source-neutral summary: build dependencies are `buildInputs` then
    /// `nativeBuildInputs`; runtime dependencies are `propagatedBuildInputs`.
    pub fn into_extract(self) -> FormatExtract {
        let mut raw = BTreeMap::new();
        let mut put = |key: &str, value: serde_json::Value| {
            raw.insert(key.to_string(), value);
        };
        put("check_inputs", serde_json::json!(self.check_inputs));
        put("conditional_inputs", serde_json::json!(self.conditional_inputs));
        put("imports", serde_json::json!(self.imports));
        put("unresolved", serde_json::json!(self.unresolved));
        put("parse_quality", serde_json::json!(self.parse_quality));
        put("warnings", serde_json::json!(self.warnings));
        if let Some(src) = &self.src {
            put("src", serde_json::json!(src));
        }

        let mut build_dependencies = self.build_inputs;
        build_dependencies.extend(self.native_build_inputs);

        FormatExtract {
            name: self.pname,
            version: self.version,
            description: self.description,
            dependencies: self.propagated_build_inputs,
            build_dependencies: dedup_preserving_order(build_dependencies),
            optional_dependencies: Vec::new(),
            frameworks: Vec::new(),
            raw,
        }
    }
}

fn collect_inputs(
    expr: &NixExpression,
    node: &NixNode,
    conditional: bool,
    depth: usize,
    out: &mut Inputs,
) {
    match node {
        NixNode::List(items) => {
            for item in items {
                collect_element(item, conditional, out);
            }
        }
        NixNode::BinOp { op: "++", lhs, rhs } => {
            collect_inputs(expr, lhs, conditional, depth, out);
            collect_inputs(expr, rhs, conditional, depth, out);
        }
        NixNode::With { body, .. } | NixNode::Let { body, .. } => {
            collect_inputs(expr, body, conditional, depth, out)
        }
        NixNode::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_inputs(expr, then_branch, true, depth, out);
            collect_inputs(expr, else_branch, true, depth, out);
        }
        NixNode::Call { function, args } => match function.as_ref() {
            NixNode::Ident(name) if CONDITIONAL_FNS.contains(&name.as_str()) => {
                if let Some(last) = args.last() {
                    if matches!(last, NixNode::List(_) | NixNode::BinOp { .. } | NixNode::With { .. }) {
                        collect_inputs(expr, last, true, depth, out);
                    } else {
                        collect_element(last, true, out);
                    }
                }
            }
            _ => {}
        },
        NixNode::Ident(name) => {
            let target = expr.find_path(&[name.as_str()]);
            match target {
                Some(target) if depth < MAX_REFERENCE_DEPTH && target != node => {
                    collect_inputs(expr, target, conditional, depth + 1, out)
                }
                _ => out.unresolved.push(name.clone()),
            }
        }
        _ => {}
    }
}

fn collect_element(item: &NixNode, conditional: bool, out: &mut Inputs) {
    match item {
        NixNode::Str(s) if !s.trim().is_empty() => out.push(s.trim().to_string(), conditional),
        NixNode::Ident(name) => {
            if let Some(pkg) = package_name(name) {
                out.push(pkg, conditional);
            }
        }
        // (foo.override { ... }) and (python3.withPackages (ps: ...))
        NixNode::Call { function, .. } => {
            if let NixNode::Ident(name) = function.as_ref() {
                if let Some(pkg) = package_name(name) {
                    out.push(pkg, conditional);
                }
            }
        }
        _ => {}
    }
}

fn fetch_source(node: &NixNode) -> Option<FetchSource> {
    let NixNode::Call { function, args } = node else {
        return None;
    };
    let NixNode::Ident(fetcher) = function.as_ref() else {
        return None;
    };
    let fetcher = fetcher.rsplit('.').next().unwrap_or(fetcher).to_string();
    let attributes = args
        .iter()
        .flat_map(|arg| arg.bindings())
        .filter_map(|b| match &b.value {
            NixNode::Str(s) => Some((b.path.join("."), s.clone())),
            _ => None,
        })
        .collect();
    Some(FetchSource {
        fetcher,
        attributes,
    })
}

/// Returns the relative paths imported through `import` or `callPackage`,
/// and the number of `callPackage` calls on a variable.
fn collect_imports(expr: &NixExpression) -> (Vec<String>, usize) {
    let mut imports = Vec::new();
    let mut variable_calls = 0;
    for node in expr.walk() {
        let NixNode::Call { function, args } = node else {
            continue;
        };
        let NixNode::Ident(name) = function.as_ref() else {
            continue;
        };
        let is_call_package = name == "callPackage" || name.ends_with(".callPackage");
        if name != "import" && !is_call_package {
            continue;
        }
        match args.first() {
            Some(NixNode::Path(p)) if p.starts_with('.') => imports.push(p.clone()),
            Some(NixNode::Ident(_)) if is_call_package => variable_calls += 1,
            _ => {}
        }
    }
    (dedup_preserving_order(imports), variable_calls)
}

/// [`PackageFormat`] for `*.nix` package expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixFormat;

impl PackageFormat for NixFormat {
    fn name(&self) -> &str {
        "nix"
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension().map_or(false, |ext| ext == "nix")
    }

    fn extract(&self, text: &str) -> Result<FormatExtract, FormatError> {
        let expr = NixExpression::parse(text)?;
        Ok(NixPackage::from_expression(&expr).into_extract())
    }
}
