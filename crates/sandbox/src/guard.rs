//! Static gates run before any evaluation, in order:
//!
//! 1. substring gate over the raw source,
//! 2. structural gate over the parsed tree ([`NodeKind::policy`]),
//! 3. attribute gate over every attribute name in the tree.
//!
//! The attribute gate is also exposed as [`check_attribute`] for names the
//! interpreter resolves from data at run time.

use crate::ast::{ExprKind, Node, NodeKind, Policy, Program, Target};
use crate::error::{Result, SandboxError};
use crate::parser::parse;
use once_cell::sync::Lazy;
use regex::Regex;

struct BannedPattern {
    regex: Regex,
    reason: &'static str,
}

const BANNED_PATTERNS: &[(&str, &str)] = &[
    (r"\b(eval|exec|execfile|compile)\s*\(", "dynamic code evaluation"),
    (r"__import__", "module system access"),
    (r"(?m)^\s*(import|from)\s+[A-Za-z_]", "module system access"),
    (r"\bimportlib\b", "module system access"),
    (r"\b(getattr|setattr|delattr|hasattr)\b", "dynamic attribute access"),
    (r"\b(globals|locals|vars|dir)\s*\(", "namespace introspection"),
    (r"\b(open|input|breakpoint|help|exit|quit)\s*\(", "host I/O"),
    (
        r"\b(os|sys|subprocess|shutil|socket|pathlib|ctypes|builtins|pickle|marshal|signal|threading|multiprocessing|asyncio|urllib|http|requests|io)\s*\.",
        "process, OS or network access",
    ),
    (
        r"__(class|bases|base|subclasses|mro|globals|builtins|code|dict|getattribute|getattr|setattr|reduce|reduce_ex|init|new|loader|spec|closure|func|self|module|qualname|defaults|kwdefaults|traceback|frame)__",
        "reflective internals",
    ),
    (r"\b(memoryview|bytearray|type|object|super|classmethod|staticmethod|property)\s*\(", "type machinery"),
];

static PATTERNS: Lazy<Vec<BannedPattern>> = Lazy::new(|| {
    BANNED_PATTERNS
        .iter()
        .filter_map(|(pattern, reason)| match Regex::new(pattern) {
            Ok(regex) => Some(BannedPattern { regex, reason }),
            Err(err) => {
                log::error!("invalid banned pattern {pattern:?}: {err}");
                None
            }
        })
        .collect()
});

/// Attribute names that reach interpreter internals even without the `_`
/// prefix.
const REFLECTIVE_ATTRIBUTES: &[&str] = &[
    "mro",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "f_code",
    "gi_frame",
    "gi_code",
    "gi_yieldfrom",
    "cr_frame",
    "cr_code",
    "cr_await",
    "ag_frame",
    "ag_code",
    "tb_frame",
    "tb_next",
    "co_code",
    "co_consts",
    "func_globals",
    "func_code",
    "func_closure",
    "im_func",
    "im_self",
    "im_class",
];

/// Gate 1: reject source text naming a dangerous capability.
pub fn check_source(source: &str) -> Result<()> {
    if PATTERNS.len() != BANNED_PATTERNS.len() {
        return Err(SandboxError::configuration("banned pattern table failed to compile"));
    }
    for banned in PATTERNS.iter() {
        if let Some(found) = banned.regex.find(source) {
            return Err(SandboxError::ForbiddenPattern {
                pattern: found.as_str().trim().to_string(),
                reason: banned.reason.to_string(),
            });
        }
    }
    Ok(())
}

/// Gate 2: every node kind must be allowed.
pub fn check_structure(program: &Program) -> Result<()> {
    program.walk(&mut |node: Node<'_>| {
        let kind = node.kind();
        match kind.policy() {
            Policy::Allow => Ok(()),
            Policy::Deny => Err(SandboxError::ForbiddenNode {
                node: kind.name().to_string(),
                line: node.line(),
            }),
        }
    })
}

/// Gate 3 (static half): every attribute name written in the program.
pub fn check_attributes(program: &Program) -> Result<()> {
    program.walk(&mut |node: Node<'_>| {
        let name = match node {
            Node::Expr(expr) => match &expr.kind {
                ExprKind::Attribute { attr, .. } => Some(attr.as_str()),
                _ => None,
            },
            Node::Target(Target::Attribute { attr, .. }, _) => Some(attr.as_str()),
            _ => None,
        };
        match name {
            Some(name) => check_attribute(name).map_err(|e| e.at_line(node.line())),
            None => Ok(()),
        }
    })
}

/// Gate 3: a single attribute name, wherever it came from.
pub fn check_attribute(name: &str) -> Result<()> {
    if name.starts_with('_') || REFLECTIVE_ATTRIBUTES.contains(&name) {
        return Err(SandboxError::ForbiddenAttribute {
            name: name.to_string(),
            line: 0,
        });
    }
    Ok(())
}

/// Run the three static gates and return the parsed program.
pub fn vet(source: &str) -> Result<Program> {
    check_source(source)?;
    let program = parse(source)?;
    check_structure(&program)?;
    check_attributes(&program)?;
    Ok(program)
}

/// Kinds the structural gate rejects, for diagnostics.
pub fn denied_kinds() -> impl Iterator<Item = NodeKind> {
    NodeKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.policy() == Policy::Deny)
}
