//! Static checks on submitted Python source
//!
//! Nothing is spawned until the source passes. The scanner is lexical: it
//! tracks strings, comments and brackets closely enough to find names,
//! attribute accesses and import statements, but it does not parse Python.

use geoforge_common::{errors::AppError, Result};
use serde::Serialize;
use std::collections::HashSet;

/// Modules user code may not import, matched on the top-level package
pub const DENIED_MODULES: &[&str] = &[
    // network
    "socket", "_socket", "ssl", "_ssl", "http", "urllib", "urllib3", "requests", "httpx",
    "aiohttp", "ftplib", "smtplib", "poplib", "imaplib", "nntplib", "telnetlib",
    "socketserver", "xmlrpc", "websocket", "websockets", "paramiko", "asyncio", "selectors",
    "select",
    // process control
    "subprocess", "_posixsubprocess", "multiprocessing", "concurrent", "pty", "pexpect",
    "signal", "resource", "posix", "nt",
    // foreign function interfaces
    "ctypes", "_ctypes", "cffi", "mmap",
    // import machinery and code loading
    "importlib", "imp", "pkgutil", "runpy", "zipimport", "builtins", "marshal", "pickle",
    "_pickle", "shelve", "code", "codeop",
    // live object graphs and raw file objects
    "gc", "inspect", "_io",
];

/// Builtins that reach dynamic code execution or the interpreter's namespaces
pub const DENIED_BUILTINS: &[&str] = &[
    "eval", "exec", "compile", "__import__", "globals", "locals", "vars", "breakpoint", "input",
    "__builtins__", "getattr", "setattr", "delattr",
];

/// Introspection attributes used to climb out of a restricted namespace
pub const ESCAPE_ATTRIBUTES: &[&str] = &[
    "__subclasses__", "__globals__", "__code__", "__closure__", "__builtins__", "__bases__",
    "__base__", "__mro__", "__getattribute__", "__reduce__", "__reduce_ex__", "__loader__",
    "__spec__", "f_globals", "f_locals", "f_builtins", "f_back", "gi_frame", "cr_frame",
    "ag_frame", "tb_frame", "co_code", "__dict__", "__self__", "__func__", "__wrapped__",
    "__objclass__", "__getattr__", "__setattr__", "__delattr__",
    // modules re-exported by other modules
    "os", "sys", "modules", "builtins", "FileIO",
];

/// Underscore attributes of the namedtuple API
const NAMEDTUPLE_ATTRIBUTES: &[&str] = &["_asdict", "_replace", "_fields", "_field_defaults", "_make"];

/// `os` functions that start or signal processes
pub const PROCESS_CALLS: &[&str] = &[
    "system", "popen", "fork", "forkpty", "kill", "killpg", "posix_spawn", "posix_spawnp",
    "startfile", "plock", "setuid", "setgid", "seteuid", "setegid", "setreuid", "setregid",
    "setresuid", "setresgid", "setsid", "setpgid", "fexecve",
];

/// Low-level `os` calls that open, list, move or delete files by path or descriptor
pub const FILE_CALLS: &[&str] = &[
    "open", "read", "write", "pread", "pwrite", "readv", "writev", "sendfile", "fdopen",
    "listdir", "scandir", "walk", "fwalk", "remove", "unlink", "rmdir", "removedirs", "rename",
    "renames", "replace", "chmod", "lchmod", "chown", "lchown", "link", "symlink", "readlink",
    "truncate", "ftruncate", "chdir", "fchdir", "chroot", "mkfifo", "mknod", "dup", "dup2",
    "pipe", "pipe2", "utime", "memfd_create",
];

fn is_process_call(name: &str) -> bool {
    name.starts_with("exec") || name.starts_with("spawn") || PROCESS_CALLS.contains(&name)
}

/// Finding for a call of `os.<name>`, if it is refused
fn os_call(name: &str) -> Option<FindingKind> {
    if is_process_call(name) {
        Some(FindingKind::ProcessCall)
    } else if FILE_CALLS.contains(&name) {
        Some(FindingKind::FileAccess)
    } else {
        None
    }
}

fn is_private_attribute(name: &str) -> bool {
    name.starts_with('_') && !name.starts_with("__") && !NAMEDTUPLE_ATTRIBUTES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    EmptyCode,
    Syntax,
    Indentation,
    DeniedImport,
    DeniedBuiltin,
    EscapeAttribute,
    PrivateAttribute,
    ProcessCall,
    FileAccess,
}

/// One reason the source was refused
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub line: usize,
    pub message: String,
}

impl Finding {
    fn new(kind: FindingKind, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
        }
    }
}

/// Check `code` before execution.
///
/// Oversized source is a request error; everything else is reported as
/// findings, empty when the code may run.
pub fn validate(code: &str, max_bytes: usize) -> Result<Vec<Finding>> {
    if code.len() > max_bytes {
        return Err(AppError::PayloadTooLarge {
            size: code.len(),
            limit: max_bytes,
        });
    }
    if code.trim().is_empty() {
        return Ok(vec![Finding::new(FindingKind::EmptyCode, 1, "no code to execute")]);
    }
    if code.contains('\0') {
        return Ok(vec![Finding::new(FindingKind::Syntax, 1, "source contains NUL bytes")]);
    }

    let mut scanner = Scanner::new(code, 1);
    scanner.scan();
    let Scanner {
        tokens,
        mut findings,
        strings,
        ..
    } = scanner;

    for (line, body) in &strings {
        for attr in ESCAPE_ATTRIBUTES.iter().filter(|a| a.starts_with("__")) {
            if body.contains(attr) {
                findings.push(Finding::new(
                    FindingKind::EscapeAttribute,
                    *line,
                    format!("string literal names '{attr}'"),
                ));
            }
        }
    }

    findings.extend(check_tokens(&tokens));

    let mut seen = HashSet::new();
    findings.retain(|f| seen.insert(f.clone()));
    findings.sort_by_key(|f| f.line);
    Ok(findings)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Op(char),
    Newline,
    Literal,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

impl Token {
    fn name(&self) -> Option<&str> {
        match &self.tok {
            Tok::Name(n) => Some(n),
            _ => None,
        }
    }

    fn is_op(&self, c: char) -> bool {
        self.tok == Tok::Op(c)
    }
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    brackets: Vec<(char, usize)>,
    line_start: bool,
    tab_indent: Option<usize>,
    space_indent: Option<usize>,
    tokens: Vec<Token>,
    findings: Vec<Finding>,
    /// Bodies of string literals with their starting line
    strings: Vec<(usize, String)>,
}

impl Scanner {
    fn new(code: &str, line: usize) -> Self {
        Self {
            chars: code.chars().collect(),
            pos: 0,
            line,
            brackets: Vec::new(),
            line_start: true,
            tab_indent: None,
            space_indent: None,
            tokens: Vec::new(),
            findings: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token { tok, line: self.line });
    }

    fn syntax(&mut self, line: usize, message: impl Into<String>) {
        self.findings.push(Finding::new(FindingKind::Syntax, line, message));
    }

    fn scan(&mut self) {
        while self.pos < self.chars.len() {
            if self.line_start {
                self.line_start = false;
                self.indentation();
                continue;
            }

            let c = self.chars[self.pos];
            match c {
                '#' => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\n' => {
                    if self.brackets.is_empty() {
                        self.push(Tok::Newline);
                        self.line_start = true;
                    }
                    self.pos += 1;
                    self.line += 1;
                }
                ';' => {
                    self.push(Tok::Newline);
                    self.pos += 1;
                }
                '\'' | '"' => self.string(""),
                '(' | '[' | '{' => {
                    self.brackets.push((c, self.line));
                    self.push(Tok::Op(c));
                    self.pos += 1;
                }
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match self.brackets.last() {
                        Some((open, _)) if *open == expected => {
                            self.brackets.pop();
                        }
                        _ => {
                            let line = self.line;
                            self.syntax(line, format!("unmatched '{c}'"));
                        }
                    }
                    self.push(Tok::Op(c));
                    self.pos += 1;
                }
                c if c.is_ascii_digit() || (c == '.' && self.peek(1).is_some_and(|n| n.is_ascii_digit())) => {
                    while self
                        .peek(0)
                        .is_some_and(|n| n.is_alphanumeric() || n == '.' || n == '_')
                    {
                        self.pos += 1;
                    }
                    self.push(Tok::Literal);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = self.pos;
                    while self.peek(0).is_some_and(|n| n.is_alphanumeric() || n == '_') {
                        self.pos += 1;
                    }
                    let word: String = self.chars[start..self.pos].iter().collect();
                    if matches!(self.peek(0), Some('\'') | Some('"')) && is_string_prefix(&word) {
                        self.string(&word.to_ascii_lowercase());
                    } else {
                        self.push(Tok::Name(word));
                    }
                }
                c if c.is_whitespace() => self.pos += 1,
                c => {
                    self.push(Tok::Op(c));
                    self.pos += 1;
                }
            }
        }

        for (open, line) in std::mem::take(&mut self.brackets) {
            self.syntax(line, format!("'{open}' is never closed"));
        }
        if let (Some(tab), Some(space)) = (self.tab_indent, self.space_indent) {
            self.findings.push(Finding::new(
                FindingKind::Indentation,
                tab.max(space),
                format!("inconsistent indentation: tabs on line {tab}, spaces on line {space}"),
            ));
        }
    }

    /// Record the indentation characters of a logical line
    fn indentation(&mut self) {
        let start = self.pos;
        while matches!(self.peek(0), Some(' ') | Some('\t') | Some('\x0c')) {
            self.pos += 1;
        }
        // Blank and comment-only lines carry no indentation
        if matches!(self.peek(0), None | Some('\n') | Some('#') | Some('\r')) {
            return;
        }
        let indent = &self.chars[start..self.pos];
        let tabs = indent.contains(&'\t');
        let spaces = indent.contains(&' ');
        if tabs && spaces {
            let line = self.line;
            self.findings.push(Finding::new(
                FindingKind::Indentation,
                line,
                "indentation mixes tabs and spaces",
            ));
        }
        if tabs && self.tab_indent.is_none() {
            self.tab_indent = Some(self.line);
        }
        if spaces && self.space_indent.is_none() {
            self.space_indent = Some(self.line);
        }
    }

    fn string(&mut self, prefix: &str) {
        let quote = self.chars[self.pos];
        let start_line = self.line;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut body = String::new();
        let mut closed = false;
        while let Some(c) = self.peek(0) {
            if c == '\\' {
                body.push(c);
                if let Some(next) = self.peek(1) {
                    if next == '\n' {
                        self.line += 1;
                    }
                    body.push(next);
                }
                self.pos += 2;
                continue;
            }
            if c == quote {
                if !triple {
                    self.pos += 1;
                    closed = true;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    closed = true;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    break;
                }
                self.line += 1;
            }
            body.push(c);
            self.pos += 1;
        }

        if !closed {
            let message = if triple {
                "unterminated triple-quoted string literal"
            } else {
                "unterminated string literal"
            };
            self.syntax(start_line, message);
        }

        if prefix.contains('f') {
            self.format_fields(&body, start_line);
        }
        self.strings.push((start_line, body));
        self.push(Tok::Literal);
    }

    /// Scan the replacement fields of an f-string as code
    fn format_fields(&mut self, body: &str, line: usize) {
        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '{' {
                if chars.get(i + 1) == Some(&'{') {
                    i += 2;
                    continue;
                }
                let mut depth = 1;
                let start = i + 1;
                i += 1;
                while i < chars.len() && depth > 0 {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                let end = if depth == 0 { i - 1 } else { i };
                let field: String = chars[start..end].iter().collect();
                let mut inner = Scanner::new(&field, line);
                inner.line_start = false;
                inner.scan();
                self.tokens.extend(inner.tokens);
                self.tokens.push(Token {
                    tok: Tok::Newline,
                    line,
                });
                self.strings.extend(inner.strings);
            } else {
                i += 1;
            }
        }
    }
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "b" | "u" | "f" | "rb" | "br" | "fr" | "rf"
    )
}

fn denied_module(module: &str) -> bool {
    let root = module.split('.').next().unwrap_or(module);
    DENIED_MODULES.contains(&root)
}

/// Read a dotted name starting at `i`; returns the name and the next index
fn dotted(tokens: &[Token], mut i: usize) -> (String, usize) {
    let mut name = String::new();
    while let Some(part) = tokens.get(i).and_then(Token::name) {
        name.push_str(part);
        if tokens.get(i + 1).is_some_and(|t| t.is_op('.')) {
            name.push('.');
            i += 2;
        } else {
            i += 1;
            break;
        }
    }
    (name, i)
}

fn check_tokens(tokens: &[Token]) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut os_names: HashSet<String> = ["os".to_string()].into_iter().collect();

    let statement_start = |i: usize| {
        i == 0 || matches!(tokens[i - 1].tok, Tok::Newline) || tokens[i - 1].is_op(':')
    };

    for (i, token) in tokens.iter().enumerate() {
        let line = token.line;
        let Some(name) = token.name() else { continue };

        match name {
            "import" if statement_start(i) => {
                let mut j = i + 1;
                loop {
                    let (module, next) = dotted(tokens, j);
                    j = next;
                    let mut bound = module.split('.').next().unwrap_or_default().to_string();
                    if tokens.get(j).and_then(Token::name) == Some("as") {
                        if let Some(alias) = tokens.get(j + 1).and_then(Token::name) {
                            bound = alias.to_string();
                        }
                        j += 2;
                    }
                    if denied_module(&module) {
                        findings.push(Finding::new(
                            FindingKind::DeniedImport,
                            line,
                            format!("import of '{module}' is not allowed"),
                        ));
                    } else if module == "os" {
                        os_names.insert(bound);
                    }
                    if tokens.get(j).is_some_and(|t| t.is_op(',')) {
                        j += 1;
                    } else {
                        break;
                    }
                }
            }
            "from" if statement_start(i) => {
                let mut j = i + 1;
                while tokens.get(j).is_some_and(|t| t.is_op('.')) {
                    j += 1;
                }
                let (module, next) = dotted(tokens, j);
                if denied_module(&module) {
                    findings.push(Finding::new(
                        FindingKind::DeniedImport,
                        line,
                        format!("import from '{module}' is not allowed"),
                    ));
                    continue;
                }
                if module != "os" {
                    continue;
                }
                let mut j = next + 1;
                while let Some(t) = tokens.get(j) {
                    if matches!(t.tok, Tok::Newline) {
                        break;
                    }
                    if t.is_op('*') {
                        findings.push(Finding::new(
                            FindingKind::ProcessCall,
                            line,
                            "wildcard import from 'os' is not allowed",
                        ));
                    } else if let Some(imported) = t.name() {
                        let after_as = j > 0 && tokens[j - 1].name() == Some("as");
                        if let Some(kind) = os_call(imported).filter(|_| !after_as) {
                            findings.push(Finding::new(kind, line, format!("'os.{imported}' is not allowed")));
                        }
                    }
                    j += 1;
                }
            }
            // `alias = os` makes `alias` an owner of os calls too
            _ if statement_start(i)
                && tokens.get(i + 1).is_some_and(|t| t.is_op('='))
                && tokens
                    .get(i + 2)
                    .and_then(Token::name)
                    .is_some_and(|source| os_names.contains(source))
                && tokens.get(i + 3).map_or(true, |t| matches!(t.tok, Tok::Newline)) =>
            {
                os_names.insert(name.to_string());
            }
            _ => {}
        }

        let after_dot = i > 0 && tokens[i - 1].is_op('.');

        if !after_dot && DENIED_BUILTINS.contains(&name) {
            findings.push(Finding::new(
                FindingKind::DeniedBuiltin,
                line,
                format!("use of '{name}' is not allowed"),
            ));
        }

        if ESCAPE_ATTRIBUTES.contains(&name) && (after_dot || name.starts_with("__")) {
            findings.push(Finding::new(
                FindingKind::EscapeAttribute,
                line,
                format!("access to '{name}' is not allowed"),
            ));
        }

        if after_dot && is_private_attribute(name) {
            findings.push(Finding::new(
                FindingKind::PrivateAttribute,
                line,
                format!("access to private attribute '{name}' is not allowed"),
            ));
        }

        if let Some(kind) = os_call(name).filter(|_| after_dot) {
            let owner = i.checked_sub(2).and_then(|k| tokens[k].name());
            let owner_is_attr = i >= 3 && tokens[i - 3].is_op('.');
            if let Some(owner) = owner.filter(|o| os_names.contains(*o) && !owner_is_attr) {
                findings.push(Finding::new(kind, line, format!("'{owner}.{name}' is not allowed")));
            }
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 100 * 1024;

    fn kinds(code: &str) -> Vec<FindingKind> {
        validate(code, LIMIT).unwrap().into_iter().map(|f| f.kind).collect()
    }

    #[test]
    fn test_clean_analysis_code_passes() {
        let code = r#"
import math
import json
from statistics import mean

points = [(52.52, 13.40), (48.85, 2.35)]
lats = [p[0] for p in points]
print(json.dumps({"mean_lat": mean(lats), "pi": math.pi}))

def area(r):
    """Circle area, with a # that is not a comment."""
    return math.pi * r ** 2
"#;
        assert_eq!(validate(code, LIMIT).unwrap(), vec![]);
    }

    #[test]
    fn test_empty_and_oversized() {
        assert_eq!(kinds("   \n\t\n"), vec![FindingKind::EmptyCode]);
        let big = "x = 1\n".repeat(10);
        assert!(matches!(
            validate(&big, 8),
            Err(AppError::PayloadTooLarge { size: 60, limit: 8 })
        ));
    }

    #[test]
    fn test_network_imports_are_denied() {
        assert_eq!(kinds("import socket"), vec![FindingKind::DeniedImport]);
        assert_eq!(kinds("import os, urllib.request as u"), vec![FindingKind::DeniedImport]);
        assert_eq!(kinds("from http.client import HTTPConnection"), vec![FindingKind::DeniedImport]);
        assert_eq!(kinds("if True: import requests"), vec![FindingKind::DeniedImport]);
    }

    #[test]
    fn test_denied_builtins_and_escapes() {
        assert_eq!(kinds("eval('1 + 1')"), vec![FindingKind::DeniedBuiltin]);
        assert_eq!(kinds("f = exec"), vec![FindingKind::DeniedBuiltin]);
        // attribute of the same name is fine
        assert!(kinds("df.eval('a + b')").is_empty());

        let found = kinds("().__class__.__bases__[0].__subclasses__()");
        assert_eq!(found, vec![FindingKind::EscapeAttribute, FindingKind::EscapeAttribute]);
        assert_eq!(
            kinds("getattr(f, '__globals__')"),
            vec![FindingKind::EscapeAttribute, FindingKind::DeniedBuiltin]
        );
    }

    #[test]
    fn test_reflective_attribute_builtins_are_denied() {
        assert_eq!(
            kinds("import os\ngetattr(os, 'sys' + 'tem')('id')"),
            vec![FindingKind::DeniedBuiltin]
        );
        assert_eq!(kinds("setattr(obj, 'x', 1)"), vec![FindingKind::DeniedBuiltin]);
        assert_eq!(kinds("delattr(obj, 'x')"), vec![FindingKind::DeniedBuiltin]);
    }

    #[test]
    fn test_private_attributes_are_denied() {
        assert_eq!(kinds("random._os.system('id')"), vec![FindingKind::PrivateAttribute]);
        assert_eq!(kinds("x = json.decoder._scanner"), vec![FindingKind::PrivateAttribute]);
        assert_eq!(kinds("print(mod.__dict__['_os'])"), vec![FindingKind::EscapeAttribute]);
        // the namedtuple API is fine
        assert!(kinds("p = p._replace(lat=1.0)\nprint(p._asdict(), p._fields)").is_empty());
        // leading underscores on plain names are fine
        assert!(kinds("_cache = {}\n_cache['a'] = 1").is_empty());
    }

    #[test]
    fn test_module_reexports_are_denied() {
        assert_eq!(kinds("import posixpath\nposixpath.os.system('id')"), vec![FindingKind::EscapeAttribute]);
        assert_eq!(kinds("import sys\nsys.modules['posix']"), vec![FindingKind::EscapeAttribute]);
        assert_eq!(kinds("import io\nio.FileIO('/etc/passwd')"), vec![FindingKind::EscapeAttribute]);
        assert_eq!(kinds("import gc"), vec![FindingKind::DeniedImport]);
    }

    #[test]
    fn test_low_level_os_file_calls() {
        assert_eq!(
            kinds("import os\nfd = os.open('/etc/passwd', os.O_RDONLY)\nprint(os.read(fd, 100))"),
            vec![FindingKind::FileAccess, FindingKind::FileAccess]
        );
        assert_eq!(kinds("from os import listdir"), vec![FindingKind::FileAccess]);
        assert_eq!(kinds("import os\nos.remove('x')"), vec![FindingKind::FileAccess]);
        // directory creation stays available; it is confined at run time
        assert!(kinds("import os\nos.makedirs('out', exist_ok=True)").is_empty());
        // file objects are not the os module
        assert!(kinds("with open('a.txt') as f:\n    print(f.read())").is_empty());
    }

    #[test]
    fn test_os_aliases_by_assignment() {
        assert_eq!(kinds("import os\nrun = os\nrun.system('id')"), vec![FindingKind::ProcessCall]);
        assert_eq!(kinds("import os as o\nfs = o\nfs.unlink('x')"), vec![FindingKind::FileAccess]);
        // comparisons do not alias
        assert!(kinds("import os\nsame = x == os\nsame.read()").is_empty());
    }

    #[test]
    fn test_fstring_fields_are_scanned() {
        assert_eq!(kinds("print(f\"{eval('2')}\")"), vec![FindingKind::DeniedBuiltin]);
        assert!(kinds("print(f\"{{literal}} {x:.2f}\")").is_empty());
    }

    #[test]
    fn test_os_process_calls() {
        assert_eq!(kinds("import os\nos.system('ls')"), vec![FindingKind::ProcessCall]);
        assert_eq!(kinds("import os as o\no.execv('/bin/sh', [])"), vec![FindingKind::ProcessCall]);
        assert_eq!(kinds("from os import popen"), vec![FindingKind::ProcessCall]);
        assert_eq!(kinds("from os import *"), vec![FindingKind::ProcessCall]);
        assert!(kinds("import os\nprint(os.path.join('a', 'b'))").is_empty());
        assert!(kinds("import os\nos.path.system").is_empty());
    }

    #[test]
    fn test_lexical_errors() {
        let findings = validate("x = 'open\nprint(x)", LIMIT).unwrap();
        assert_eq!(findings[0].kind, FindingKind::Syntax);
        assert_eq!(findings[0].line, 1);

        assert_eq!(kinds("s = \"\"\"never closed\n"), vec![FindingKind::Syntax]);
        assert_eq!(kinds("print((1, 2)"), vec![FindingKind::Syntax]);
        assert_eq!(kinds("x = [1, 2)]"), vec![FindingKind::Syntax]);
        // brackets inside strings do not count
        assert!(kinds("print('(')").is_empty());
    }

    #[test]
    fn test_indentation_consistency() {
        let mixed_file = "if True:\n    a = 1\nif True:\n\tb = 2\n";
        let findings = validate(mixed_file, LIMIT).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Indentation);
        assert_eq!(findings[0].line, 4);

        assert_eq!(kinds("if True:\n \tx = 1\n"), vec![FindingKind::Indentation, FindingKind::Indentation]);
        // continuation lines inside brackets are free-form
        assert!(kinds("x = [\n\t1,\n    2]\n").is_empty());
    }
}
