//! PKGBUILD recipe scanner.
//!
//! A PKGBUILD is a bash script, but package metadata lives in plain
//! variable assignments. The scanner recovers those assignments (scalars
//! and arrays, with quoting and substitution of already-assigned
//! variables) and keeps every construct that would need a real shell
//! verbatim in [`Recipe::opaque`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::harvest::traits::{FormatError, FormatExtract, PackageFormat};
use crate::model::dedup_preserving_order;

/// Value of one recipe variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipeValue {
    Scalar(String),
    Array(Vec<String>),
}

impl RecipeValue {
    /// `$name` semantics: the scalar, or the first array element.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            RecipeValue::Scalar(s) => Some(s),
            RecipeValue::Array(items) => items.first().map(String::as_str),
        }
    }

    /// `${name[@]}` semantics: every element, a scalar being one element.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            RecipeValue::Scalar(s) => vec![s.clone()],
            RecipeValue::Array(items) => items.clone(),
        }
    }
}

/// Flat result of scanning a PKGBUILD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    vars: BTreeMap<String, RecipeValue>,
    opaque: Vec<String>,
    unresolved: Vec<String>,
}

impl Recipe {
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        Scanner::new(text).run()
    }

    pub fn get(&self, name: &str) -> Option<&RecipeValue> {
        self.vars.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(RecipeValue::as_scalar)
    }

    pub fn array(&self, name: &str) -> Vec<String> {
        self.get(name).map(RecipeValue::to_vec).unwrap_or_default()
    }

    pub fn variables(&self) -> &BTreeMap<String, RecipeValue> {
        &self.vars
    }

    /// Functions, conditionals, loops and commands, verbatim.
    pub fn opaque(&self) -> &[String] {
        &self.opaque
    }

    /// Variable references that could not be substituted.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// Result of reading one shell word.
enum Word {
    Text(String),
    /// A bare `${name[@]}` of a known array expands to several words.
    Many(Vec<String>),
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    /// Set when the current statement contains a command substitution.
    needs_shell: bool,
    recipe: Recipe,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Characters that end an unquoted word.
fn is_word_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, ';' | '|' | '&' | '<' | '>' | '(' | ')')
}

const BLOCK_KEYWORDS: &[&str] = &["if", "case", "for", "while", "until", "select", "function"];

impl Scanner {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            needs_shell: false,
            recipe: Recipe::default(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn text(&self, start: usize) -> String {
        self.chars[start..self.pos].iter().collect::<String>().trim().to_string()
    }

    fn malformed(line: usize, reason: &str) -> FormatError {
        FormatError::MalformedRecipe {
            line,
            reason: reason.to_string(),
        }
    }

    fn run(mut self) -> Result<Recipe, FormatError> {
        loop {
            self.skip_separators();
            if self.peek().is_none() {
                break;
            }
            let before = self.pos;
            self.statement()?;
            if self.pos == before {
                self.bump();
            }
        }
        self.recipe.unresolved = dedup_preserving_order(std::mem::take(&mut self.recipe.unresolved));
        Ok(self.recipe)
    }

    /// Skips whitespace, newlines, `;`, comments and line continuations.
    fn skip_separators(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                c if c.is_whitespace() || c == ';' => {
                    self.bump();
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                '#' => self.skip_comment(),
                _ => break,
            }
        }
    }

    /// Skips horizontal whitespace and line continuations.
    fn skip_blanks(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn statement(&mut self) -> Result<(), FormatError> {
        let start = self.pos;
        let start_line = self.line;

        if let Some((name, append)) = self.assignment_head() {
            return self.assignment(start, start_line, name, append);
        }

        let first = self.peek_lenient_word();
        let is_block = BLOCK_KEYWORDS.contains(&first.as_str())
            || first == "{"
            || first.ends_with("()")
            || first.ends_with("(){")
            || self.function_parens_follow(&first);
        if is_block {
            self.skip_block();
        } else {
            self.skip_command();
        }
        let text = self.text(start);
        if !text.is_empty() {
            debug!(line = start_line, "Keeping shell construct opaque");
            self.recipe.opaque.push(text);
        }
        Ok(())
    }

    /// `name=` or `name+=` at the current position; consumes it on match.
    fn assignment_head(&mut self) -> Option<(String, bool)> {
        let c = self.peek()?;
        if !is_ident_start(c) {
            return None;
        }
        let mut end = self.pos;
        while self.chars.get(end).copied().map_or(false, is_ident_char) {
            end += 1;
        }
        let append = self.chars.get(end) == Some(&'+');
        let eq = if append { end + 1 } else { end };
        if self.chars.get(eq) != Some(&'=') {
            return None;
        }
        let name: String = self.chars[self.pos..end].iter().collect();
        self.pos = eq + 1;
        Some((name, append))
    }

    fn assignment(
        &mut self,
        start: usize,
        start_line: usize,
        name: String,
        append: bool,
    ) -> Result<(), FormatError> {
        self.needs_shell = false;
        let value = if self.peek() == Some('(') {
            self.bump();
            RecipeValue::Array(self.array_body(start_line)?)
        } else {
            let scalar = match self.peek() {
                None => String::new(),
                Some(c) if is_word_break(c) => String::new(),
                Some(_) => match self.read_word()? {
                    Word::Text(text) => text,
                    Word::Many(items) => items.join(" "),
                },
            };
            RecipeValue::Scalar(scalar)
        };

        let value = match (append, self.recipe.vars.remove(&name)) {
            (true, Some(RecipeValue::Scalar(mut prev))) => match value {
                RecipeValue::Scalar(s) => {
                    prev.push_str(&s);
                    RecipeValue::Scalar(prev)
                }
                RecipeValue::Array(items) => {
                    let mut all = vec![prev];
                    all.extend(items);
                    RecipeValue::Array(all)
                }
            },
            (true, Some(RecipeValue::Array(mut prev))) => {
                prev.extend(value.to_vec());
                RecipeValue::Array(prev)
            }
            _ => value,
        };
        self.recipe.vars.insert(name, value);

        // `VAR=x command ...` runs a command; keep the whole line.
        self.skip_blanks();
        let trailing_command = !matches!(self.peek(), None | Some('\n') | Some(';') | Some('#'));
        if trailing_command {
            self.skip_command();
        }
        if trailing_command || self.needs_shell {
            let text = self.text(start);
            self.recipe.opaque.push(text);
        }
        Ok(())
    }

    fn array_body(&mut self, start_line: usize) -> Result<Vec<String>, FormatError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(Self::malformed(start_line, "unterminated array")),
                Some(')') => {
                    self.bump();
                    return Ok(items);
                }
                Some('#') => self.skip_comment(),
                Some('\\') if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some(_) => {
                    let before = self.pos;
                    let word = self.read_word()?;
                    if self.pos == before {
                        // A break character such as `;` or `|` is not an element.
                        self.bump();
                        continue;
                    }
                    match word {
                        Word::Text(text) => items.push(text),
                        Word::Many(expanded) => items.extend(expanded),
                    }
                }
            }
        }
    }

    /// Reads one word, applying quote removal and substitution.
    fn read_word(&mut self) -> Result<Word, FormatError> {
        let mut out = String::new();
        let mut many = None;
        while let Some(c) = self.peek() {
            if is_word_break(c) {
                break;
            }
            match c {
                '\'' => {
                    let line = self.line;
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return Err(Self::malformed(line, "unterminated single quote")),
                            Some('\'') => break,
                            Some(ch) => out.push(ch),
                        }
                    }
                }
                '"' => {
                    let line = self.line;
                    self.bump();
                    self.double_quoted(line, &mut out)?;
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') | None => {}
                        Some(ch) => out.push(ch),
                    }
                }
                '`' => {
                    let line = self.line;
                    out.push_str(&self.backticks(line)?);
                }
                '$' => {
                    let word_start = out.is_empty();
                    if let Some(items) = self.dollar(&mut out)? {
                        let ends_word = self.peek().map_or(true, is_word_break);
                        if word_start && ends_word {
                            many = Some(items);
                        } else {
                            out.push_str(&items.join(" "));
                        }
                    }
                }
                _ => {
                    self.bump();
                    out.push(c);
                }
            }
        }
        Ok(match many {
            Some(items) => Word::Many(items),
            None => Word::Text(out),
        })
    }

    fn double_quoted(&mut self, line: usize, out: &mut String) -> Result<(), FormatError> {
        loop {
            match self.peek() {
                None => return Err(Self::malformed(line, "unterminated double quote")),
                Some('"') => {
                    self.bump();
                    return Ok(());
                }
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        Some(ch @ ('"' | '\\' | '$' | '`')) => out.push(ch),
                        Some('\n') => {}
                        Some(ch) => {
                            out.push('\\');
                            out.push(ch);
                        }
                        None => return Err(Self::malformed(line, "unterminated double quote")),
                    }
                }
                Some('`') => {
                    let bt_line = self.line;
                    let text = self.backticks(bt_line)?;
                    out.push_str(&text);
                }
                Some('$') => {
                    if let Some(items) = self.dollar(out)? {
                        out.push_str(&items.join(" "));
                    }
                }
                Some(ch) => {
                    self.bump();
                    out.push(ch);
                }
            }
        }
    }

    fn backticks(&mut self, line: usize) -> Result<String, FormatError> {
        self.needs_shell = true;
        let start = self.pos;
        self.bump();
        loop {
            match self.bump() {
                None => return Err(Self::malformed(line, "unterminated command substitution")),
                Some('\\') => {
                    self.bump();
                }
                Some('`') => break,
                Some(_) => {}
            }
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// Handles `$...` at the current position. Scalar results are appended
    /// to `out`; `${name[@]}` of a known array is returned as elements.
    fn dollar(&mut self, out: &mut String) -> Result<Option<Vec<String>>, FormatError> {
        let line = self.line;
        let start = self.pos;
        self.bump();
        match self.peek() {
            Some('(') => {
                let mut depth = 0usize;
                loop {
                    match self.bump() {
                        None => return Err(Self::malformed(line, "unterminated command substitution")),
                        Some('(') => depth += 1,
                        Some(')') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Some(_) => {}
                    }
                }
                out.extend(&self.chars[start..self.pos]);
                self.needs_shell = true;
                Ok(None)
            }
            Some('{') => {
                self.bump();
                let inner_start = self.pos;
                let mut depth = 1usize;
                loop {
                    match self.peek() {
                        None => return Err(Self::malformed(line, "unterminated parameter expansion")),
                        Some('{') => depth += 1,
                        Some('}') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    self.bump();
                }
                let inner: String = self.chars[inner_start..self.pos].iter().collect();
                self.bump();
                let verbatim: String = self.chars[start..self.pos].iter().collect();
                Ok(self.expand(&inner, &verbatim, out))
            }
            Some(c) if is_ident_start(c) => {
                let name_start = self.pos;
                while self.peek().map_or(false, is_ident_char) {
                    self.bump();
                }
                let name: String = self.chars[name_start..self.pos].iter().collect();
                match self.recipe.vars.get(&name).and_then(RecipeValue::as_scalar) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.extend(&self.chars[start..self.pos]);
                        self.recipe.unresolved.push(name);
                    }
                }
                Ok(None)
            }
            _ => {
                out.push('$');
                Ok(None)
            }
        }
    }

    /// Expands the body of `${...}`; unsupported forms stay verbatim.
    fn expand(&mut self, inner: &str, verbatim: &str, out: &mut String) -> Option<Vec<String>> {
        let (name, index) = match inner.split_once('[') {
            Some((name, rest)) => match rest.strip_suffix(']') {
                Some(index) => (name, Some(index)),
                None => (inner, None),
            },
            None => (inner, None),
        };
        let simple = !name.is_empty()
            && name.chars().next().map_or(false, is_ident_start)
            && name.chars().all(is_ident_char);
        let value = if simple { self.recipe.vars.get(name) } else { None };

        match (value, index) {
            (Some(value), None) => {
                out.push_str(value.as_scalar().unwrap_or_default());
                None
            }
            (Some(value), Some("@" | "*")) => Some(value.to_vec()),
            (Some(value), Some(i)) => match i.parse::<usize>().ok().and_then(|i| value.to_vec().get(i).cloned()) {
                Some(item) => {
                    out.push_str(&item);
                    None
                }
                None => {
                    out.push_str(verbatim);
                    self.recipe.unresolved.push(inner.to_string());
                    None
                }
            },
            (None, _) => {
                out.push_str(verbatim);
                let label = if simple { name.to_string() } else { inner.to_string() };
                self.recipe.unresolved.push(label);
                None
            }
        }
    }

    /// The next word as plain text, without consuming anything.
    fn peek_lenient_word(&self) -> String {
        self.chars[self.pos..]
            .iter()
            .take_while(|c| !c.is_whitespace() && **c != ';')
            .collect()
    }

    /// `name ()` with the parentheses separated by blanks.
    fn function_parens_follow(&self, first: &str) -> bool {
        if first.is_empty() || !first.chars().all(|c| is_ident_char(c) || c == '-') {
            return false;
        }
        let rest = &self.chars[self.pos + first.chars().count()..];
        let mut it = rest.iter().skip_while(|c| **c == ' ' || **c == '\t');
        it.next() == Some(&'(') && it.next() == Some(&')')
    }

    /// Reads a word for block scanning: quotes are honoured but an
    /// unterminated quote simply runs to the end of input.
    fn lenient_word(&mut self) -> String {
        let mut word = String::new();
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            match quote {
                Some(q) => {
                    if c == '\\' && q == '"' {
                        self.bump();
                        self.bump();
                        continue;
                    }
                    if c == q {
                        quote = None;
                    }
                }
                None => {
                    if c.is_whitespace() || c == ';' {
                        break;
                    }
                    if c == '\\' {
                        self.bump();
                        self.bump();
                        continue;
                    }
                    if c == '\'' || c == '"' {
                        quote = Some(c);
                    }
                }
            }
            self.bump();
            word.push(c);
        }
        word
    }

    /// Skips a function body or compound command up to its closing
    /// keyword. Unbalanced blocks run to the end of input.
    fn skip_block(&mut self) {
        let mut stack: Vec<&'static str> = Vec::new();
        let mut opened = false;
        loop {
            self.skip_separators();
            if self.peek().is_none() {
                return;
            }
            let before = self.pos;
            let word = self.lenient_word();
            if self.pos == before {
                self.bump();
                continue;
            }
            let closer = match word.as_str() {
                "if" => Some("fi"),
                "case" => Some("esac"),
                "for" | "while" | "until" | "select" => Some("done"),
                "{" => Some("}"),
                w if w.ends_with('{') && !w.contains('$') => Some("}"),
                _ => None,
            };
            if let Some(closer) = closer {
                stack.push(closer);
                opened = true;
                continue;
            }
            if matches!(word.as_str(), "fi" | "esac" | "done" | "}") {
                stack.pop();
                if opened && stack.is_empty() {
                    return;
                }
            }
        }
    }

    /// Skips to the end of the current command line.
    fn skip_command(&mut self) {
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None => match c {
                    '\n' | ';' => return,
                    '\\' => {
                        self.bump();
                    }
                    '\'' | '"' => quote = Some(c),
                    '#' if self.pos == 0 || self.chars[self.pos - 1].is_whitespace() => {
                        self.skip_comment();
                        return;
                    }
                    _ => {}
                },
            }
            self.bump();
        }
    }
}

// ============================================================================
// Package mapping
// ============================================================================

/// Reduces `glib2>=2.70` (or `python: for scripts`) to `glib2`.
pub fn strip_constraint(entry: &str) -> &str {
    let entry = entry.split(':').next().unwrap_or(entry);
    let end = entry.find(['<', '>', '=']).unwrap_or(entry.len());
    entry[..end].trim()
}

fn names(items: &[String]) -> Vec<String> {
    dedup_preserving_order(
        items
            .iter()
            .map(|item| strip_constraint(item))
            .filter(|name| !name.is_empty())
            .map(str::to_string),
    )
}

/// Well-known PKGBUILD variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkgbuildPackage {
    pub pkgname: Option<String>,
    pub pkgbase: Option<String>,
    pub pkgver: Option<String>,
    pub pkgrel: Option<String>,
    pub epoch: Option<String>,
    pub pkgdesc: Option<String>,
    pub url: Option<String>,
    pub license: Vec<String>,
    pub arch: Vec<String>,
    pub depends: Vec<String>,
    pub makedepends: Vec<String>,
    pub checkdepends: Vec<String>,
    pub optdepends: Vec<String>,
    pub provides: Vec<String>,
    pub conflicts: Vec<String>,
    pub opaque: Vec<String>,
    pub unresolved: Vec<String>,
}

impl PkgbuildPackage {
    pub fn from_recipe(recipe: &Recipe) -> Self {
        let scalar = |name: &str| {
            recipe
                .scalar(name)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        // depends plus architecture-specific depends_x86_64 and friends
        let with_arch = |name: &str| {
            let prefix = format!("{}_", name);
            let mut all = recipe.array(name);
            for (key, value) in recipe.variables() {
                if key.starts_with(&prefix) {
                    all.extend(value.to_vec());
                }
            }
            all
        };

        Self {
            pkgname: scalar("pkgname"),
            pkgbase: scalar("pkgbase"),
            pkgver: scalar("pkgver"),
            pkgrel: scalar("pkgrel"),
            epoch: scalar("epoch"),
            pkgdesc: scalar("pkgdesc"),
            url: scalar("url"),
            license: recipe.array("license"),
            arch: recipe.array("arch"),
            depends: with_arch("depends"),
            makedepends: with_arch("makedepends"),
            checkdepends: with_arch("checkdepends"),
            optdepends: with_arch("optdepends"),
            provides: recipe.array("provides"),
            conflicts: recipe.array("conflicts"),
            opaque: recipe.opaque().to_vec(),
            unresolved: recipe.unresolved().to_vec(),
        }
    }

    /// `pkgver`, or `[epoch:]pkgver-pkgrel` when `pkgrel` is present.
    pub fn version(&self) -> Option<String> {
        let pkgver = self.pkgver.as_deref()?;
        let mut version = String::new();
        if let Some(epoch) = self.epoch.as_deref().filter(|e| *e != "0") {
            version.push_str(epoch);
            version.push(':');
        }
        version.push_str(pkgver);
        if let Some(pkgrel) = &self.pkgrel {
            version.push('-');
            version.push_str(pkgrel);
        }
        Some(version)
    }

    pub fn into_extract(self) -> FormatExtract {
        let mut raw = BTreeMap::new();
        let mut put = |key: &str, value: serde_json::Value| {
            raw.insert(key.to_string(), value);
        };
        put("depends", serde_json::json!(self.depends));
        put("makedepends", serde_json::json!(self.makedepends));
        put("checkdepends", serde_json::json!(self.checkdepends));
        put("optdepends", serde_json::json!(self.optdepends));
        if !self.license.is_empty() {
            put("license", serde_json::json!(self.license));
        }
        if !self.arch.is_empty() {
            put("arch", serde_json::json!(self.arch));
        }
        if !self.provides.is_empty() {
            put("provides", serde_json::json!(self.provides));
        }
        if !self.conflicts.is_empty() {
            put("conflicts", serde_json::json!(self.conflicts));
        }
        if let Some(url) = &self.url {
            put("url", serde_json::json!(url));
        }
        if let Some(pkgbase) = &self.pkgbase {
            put("pkgbase", serde_json::json!(pkgbase));
        }
        if !self.opaque.is_empty() {
            put("opaque", serde_json::json!(self.opaque));
        }
        if !self.unresolved.is_empty() {
            put("unresolved", serde_json::json!(self.unresolved));
        }

        let mut build = self.makedepends.clone();
        build.extend(self.checkdepends.iter().cloned());

        FormatExtract {
            version: self.version(),
            name: self.pkgname.or(self.pkgbase),
            description: self.pkgdesc,
            dependencies: names(&self.depends),
            build_dependencies: names(&build),
            optional_dependencies: names(&self.optdepends),
            frameworks: Vec::new(),
            raw,
        }
    }
}

/// [`PackageFormat`] for Arch `PKGBUILD` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct PkgbuildFormat;

impl PackageFormat for PkgbuildFormat {
    fn name(&self) -> &str {
        "pkgbuild"
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.file_name().map_or(false, |name| name == "PKGBUILD")
    }

    fn extract(&self, text: &str) -> Result<FormatExtract, FormatError> {
        let recipe = Recipe::parse(text)?;
        Ok(PkgbuildPackage::from_recipe(&recipe).into_extract())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_recipe() {
        let extract = PkgbuildFormat
            .extract("pkgname=firefox\npkgver=128.0\ndepends=(glib gtk3 dbus)\n# comment\nmakedepends=('cmake' \"pkg-config\")")
            .unwrap();
        assert_eq!(extract.name.as_deref(), Some("firefox"));
        assert_eq!(extract.version.as_deref(), Some("128.0"));
        assert_eq!(extract.dependencies, vec!["glib", "gtk3", "dbus"]);
        assert_eq!(extract.build_dependencies, vec!["cmake", "pkg-config"]);
    }

    #[test]
    fn test_unterminated_array() {
        let err = Recipe::parse("pkgname=x\ndepends=(glib\n  gtk3\n").unwrap_err();
        assert_eq!(
            err,
            FormatError::MalformedRecipe {
                line: 2,
                reason: "unterminated array".to_string()
            }
        );
    }

    #[test]
    fn test_unterminated_quote() {
        let err = Recipe::parse("pkgname=x\npkgdesc=\"never closed\n").unwrap_err();
        assert!(matches!(err, FormatError::MalformedRecipe { line: 2, .. }));
    }

    #[test]
    fn test_multiline_array_with_comments_and_constraints() {
        let recipe = Recipe::parse(
            "depends=(\n  'glib2>=2.70'  # core\n  \"gtk3\"\n  # 'disabled'\n  libnotify\n)\n",
        )
        .unwrap();
        assert_eq!(recipe.array("depends"), vec!["glib2>=2.70", "gtk3", "libnotify"]);
        let pkg = PkgbuildPackage::from_recipe(&recipe);
        assert_eq!(pkg.into_extract().dependencies, vec!["glib2", "gtk3", "libnotify"]);
    }

    #[test]
    fn test_operators_inside_array_are_not_elements() {
        let recipe = Recipe::parse("depends=(glib2; gtk3 | libnotify & ;;)\n").unwrap();
        assert_eq!(recipe.array("depends"), vec!["glib2", "gtk3", "libnotify"]);
        let extract = PkgbuildFormat.extract("pkgname=x\nmakedepends=(cmake;)").unwrap();
        assert_eq!(extract.build_dependencies, vec!["cmake"]);
    }

    #[test]
    fn test_substitution() {
        let recipe = Recipe::parse(
            "pkgname=foo\n_base=bar\ndepends=(\"$pkgname-libs\" \"${_base}-data\")\nsource=(\"$url/x.tar\")",
        )
        .unwrap();
        assert_eq!(recipe.array("depends"), vec!["foo-libs", "bar-data"]);
        assert_eq!(recipe.array("source"), vec!["$url/x.tar"]);
        assert_eq!(recipe.unresolved(), ["url"]);
    }

    #[test]
    fn test_forward_reference_stays_verbatim() {
        let recipe = Recipe::parse("pkgdesc=\"tool v${pkgver}\"\npkgver=1.0").unwrap();
        assert_eq!(recipe.scalar("pkgdesc"), Some("tool v${pkgver}"));
        assert_eq!(recipe.scalar("pkgver"), Some("1.0"));
        assert_eq!(recipe.unresolved(), ["pkgver"]);
    }

    #[test]
    fn test_single_quotes_do_not_substitute() {
        let recipe = Recipe::parse("pkgname=a\nx='$pkgname'").unwrap();
        assert_eq!(recipe.scalar("x"), Some("$pkgname"));
    }

    #[test]
    fn test_array_expansion_and_append() {
        let recipe = Recipe::parse(
            "_common=(glib gtk3)\ndepends=(${_common[@]} dbus)\ndepends+=('libx11')\npkgrel=1\npkgrel+=0",
        )
        .unwrap();
        assert_eq!(recipe.array("depends"), vec!["glib", "gtk3", "dbus", "libx11"]);
        assert_eq!(recipe.scalar("pkgrel"), Some("10"));
    }

    #[test]
    fn test_functions_and_conditionals_are_opaque() {
        let recipe = Recipe::parse(
            r#"pkgname=demo
pkgver=2.1
if [[ $CARCH == x86_64 ]]; then
  depends=(lib32)
fi
build() {
  cd "$srcdir/$pkgname-$pkgver"
  if [ -f configure ]; then ./configure; fi
  make
}
package() { make DESTDIR="$pkgdir" install; }
pkgrel=3
"#,
        )
        .unwrap();
        assert_eq!(recipe.scalar("pkgrel"), Some("3"));
        assert!(recipe.get("depends").is_none());
        assert_eq!(recipe.opaque().len(), 3);
        assert!(recipe.opaque()[1].starts_with("build() {"));
        assert!(recipe.opaque()[1].ends_with('}'));
    }

    #[test]
    fn test_command_substitution_is_kept_verbatim() {
        let recipe = Recipe::parse("pkgver=$(git describe --tags)\npkgname=x").unwrap();
        assert_eq!(recipe.scalar("pkgver"), Some("$(git describe --tags)"));
        assert_eq!(recipe.scalar("pkgname"), Some("x"));
        assert_eq!(recipe.opaque(), ["pkgver=$(git describe --tags)"]);
    }

    #[test]
    fn test_continuation_and_semicolons() {
        let recipe = Recipe::parse("pkgname=a; pkgver=1 \\\n\nmakedepends=(cmake \\\n  ninja)").unwrap();
        assert_eq!(recipe.scalar("pkgver"), Some("1"));
        assert_eq!(recipe.array("makedepends"), vec!["cmake", "ninja"]);
    }

    #[test]
    fn test_version_with_epoch_and_pkgrel() {
        let recipe = Recipe::parse("pkgname=(foo foo-docs)\npkgver=1.2\npkgrel=4\nepoch=2").unwrap();
        let pkg = PkgbuildPackage::from_recipe(&recipe);
        assert_eq!(pkg.pkgname.as_deref(), Some("foo"));
        assert_eq!(pkg.version().as_deref(), Some("2:1.2-4"));
    }

    #[test]
    fn test_optdepends_and_checkdepends() {
        let extract = PkgbuildFormat
            .extract(
                "pkgname=x\nmakedepends=(meson)\ncheckdepends=('python-pytest')\noptdepends=('python: for scripts' 'git>=2: vcs support')\ndepends_x86_64=(lib32-glibc)",
            )
            .unwrap();
        assert_eq!(extract.build_dependencies, vec!["meson", "python-pytest"]);
        assert_eq!(extract.optional_dependencies, vec!["python", "git"]);
        assert_eq!(extract.dependencies, vec!["lib32-glibc"]);
        assert_eq!(extract.raw["optdepends"][0], "python: for scripts");
    }

    #[test]
    fn test_strip_constraint() {
        assert_eq!(strip_constraint("glib2>=2.70"), "glib2");
        assert_eq!(strip_constraint("foo=1:2.0"), "foo");
        assert_eq!(strip_constraint("bar<3"), "bar");
        assert_eq!(strip_constraint("plain"), "plain");
    }

    #[test]
    fn test_can_handle() {
        assert!(PkgbuildFormat.can_handle(Path::new("aur/firefox/PKGBUILD")));
        assert!(!PkgbuildFormat.can_handle(Path::new("default.nix")));
    }
}
