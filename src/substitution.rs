//! Placeholder substitution for script templates
//!
//! A template may contain the literal tokens `UNAME`, `PSSWD` and `MNTPOINT`.
//! Substitution is a single left-to-right scan: text that was inserted for one
//! token is never scanned again, so a value that happens to spell another
//! token stays literal. When more than one token could match at the same
//! position, `UNAME` wins over `PSSWD`, which wins over `MNTPOINT`.
//!
//! Every token left in the template text after the scan is unresolved and
//! fails the whole substitution. A script never runs with a placeholder in it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{ProvisionError, Result};

/// Recognized placeholder tokens, in substitution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter, IntoStaticStr)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Token {
    Uname,
    Psswd,
    Mntpoint,
}

impl Token {
    /// All tokens in the fixed substitution order.
    pub const ORDER: [Token; 3] = [Token::Uname, Token::Psswd, Token::Mntpoint];

    /// The literal text of the placeholder.
    pub fn literal(self) -> &'static str {
        self.into()
    }

    /// Environment variable the value is exported under for the child process.
    pub const fn env_var(self) -> &'static str {
        match self {
            Token::Uname => "PROVISION_UNAME",
            Token::Psswd => "PROVISION_PSSWD",
            Token::Mntpoint => "PROVISION_MNTPOINT",
        }
    }

    /// Token literally present at the start of `text`, by priority.
    fn at_start_of(text: &str) -> Option<Token> {
        Token::ORDER
            .into_iter()
            .find(|token| text.starts_with(token.literal()))
    }
}

/// What a token is replaced with.
#[derive(Clone, PartialEq, Eq)]
pub enum Binding {
    Value(String),
    /// Substitute the empty string
    Blank,
}

impl Binding {
    pub fn as_str(&self) -> &str {
        match self {
            Binding::Value(value) => value,
            Binding::Blank => "",
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(_) => f.write_str("Value(<redacted>)"),
            Binding::Blank => f.write_str("Blank"),
        }
    }
}

/// Token bindings for one substitution pass.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    bindings: BTreeMap<Token, Binding>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, token: Token, value: impl Into<String>) -> Self {
        self.set(token, Binding::Value(value.into()));
        self
    }

    pub fn with_blank(mut self, token: Token) -> Self {
        self.set(token, Binding::Blank);
        self
    }

    pub fn set(&mut self, token: Token, binding: Binding) {
        self.bindings.insert(token, binding);
    }

    /// Bind `token` to blank unless it already has a binding.
    pub fn blank_if_unbound(&mut self, token: Token) {
        self.bindings.entry(token).or_insert(Binding::Blank);
    }

    pub fn get(&self, token: Token) -> Option<&Binding> {
        self.bindings.get(&token)
    }
}

impl fmt::Debug for Substitutions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.bindings.iter()).finish()
    }
}

enum Segment<'a> {
    Template(&'a str),
    Inserted(&'a str),
}

/// Resolve every placeholder in `template`.
///
/// # Errors
///
/// `Template` naming each token that appears in the template without a
/// binding.
pub fn substitute(template: &str, substitutions: &Substitutions) -> Result<String> {
    let segments = scan(template, substitutions);

    let unresolved: BTreeSet<Token> = segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Template(text) => Some(*text),
            Segment::Inserted(_) => None,
        })
        .flat_map(tokens_in)
        .collect();

    if !unresolved.is_empty() {
        return Err(ProvisionError::Template {
            unresolved: unresolved.into_iter().collect(),
        });
    }

    Ok(segments
        .into_iter()
        .map(|segment| match segment {
            Segment::Template(text) | Segment::Inserted(text) => text,
        })
        .collect())
}

/// Tokens referenced by `template`, deduplicated, in priority order.
pub fn referenced_tokens(template: &str) -> Vec<Token> {
    tokens_in(template)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn scan<'a>(template: &'a str, substitutions: &'a Substitutions) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut pos = 0;

    while pos < template.len() {
        let rest = &template[pos..];
        if let Some(token) = Token::at_start_of(rest) {
            let len = token.literal().len();
            if let Some(binding) = substitutions.get(token) {
                segments.push(Segment::Template(&template[literal_start..pos]));
                segments.push(Segment::Inserted(binding.as_str()));
                literal_start = pos + len;
            }
            pos += len;
        } else {
            pos += rest.chars().next().map_or(1, char::len_utf8);
        }
    }

    segments.push(Segment::Template(&template[literal_start..]));
    segments
}

fn tokens_in(text: &str) -> impl Iterator<Item = Token> + '_ {
    let mut pos = 0;
    std::iter::from_fn(move || {
        while pos < text.len() {
            let rest = &text[pos..];
            if let Some(token) = Token::at_start_of(rest) {
                pos += token.literal().len();
                return Some(token);
            }
            pos += rest.chars().next().map_or(1, char::len_utf8);
        }
        None
    })
}
