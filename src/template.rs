//! Placeholder interpolation.
//!
//! Supports `${name}` and `$name`, with `$$` as an escaped dollar sign. This is
//! plain substitution, not an expression language.

use crate::error::TemplateError;
use crate::scope::Scope;

/// One lexical piece of a template.
enum Piece<'a> {
    Text(&'a str),
    Dollar,
    Var(&'a str),
}

/// Render `text`, replacing placeholders with values from `scope`.
///
/// # Examples
///
/// ```
/// use cmdspec::{Scope, template};
///
/// let scope: Scope = [("msg", "hi")].into_iter().collect();
/// assert_eq!(template::render("echo ${msg} $$5", &scope).unwrap(), "echo hi $5");
/// assert!(template::render("${other}", &scope).is_err());
/// ```
pub fn render(text: &str, scope: &Scope) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(text.len());
    for piece in parse(text)? {
        match piece {
            Piece::Text(s) => result.push_str(s),
            Piece::Dollar => result.push('$'),
            Piece::Var(name) => {
                let value = scope.get(name).ok_or_else(|| TemplateError::Missing {
                    name: name.to_string(),
                })?;
                result.push_str(value);
            }
        }
    }
    Ok(result)
}

/// Names referenced by the placeholders of `text`, in order of appearance.
pub fn placeholders(text: &str) -> Result<Vec<String>, TemplateError> {
    Ok(parse(text)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Var(name) => Some(name.to_string()),
            _ => None,
        })
        .collect())
}

fn parse(text: &str) -> Result<Vec<Piece<'_>>, TemplateError> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        if start < i {
            pieces.push(Piece::Text(&text[start..i]));
        }
        let invalid = || TemplateError::InvalidPlaceholder {
            text: text.to_string(),
            offset: i,
        };
        match bytes.get(i + 1) {
            Some(b'$') => {
                pieces.push(Piece::Dollar);
                i += 2;
            }
            Some(b'{') => {
                let name_start = i + 2;
                let len = identifier_len(&bytes[name_start..]);
                if len == 0 || bytes.get(name_start + len) != Some(&b'}') {
                    return Err(invalid());
                }
                pieces.push(Piece::Var(&text[name_start..name_start + len]));
                i = name_start + len + 1;
            }
            Some(_) => {
                let name_start = i + 1;
                let len = identifier_len(&bytes[name_start..]);
                if len == 0 {
                    return Err(invalid());
                }
                pieces.push(Piece::Var(&text[name_start..name_start + len]));
                i = name_start + len;
            }
            None => return Err(invalid()),
        }
        start = i;
    }
    if start < bytes.len() {
        pieces.push(Piece::Text(&text[start..]));
    }
    Ok(pieces)
}

fn identifier_len(bytes: &[u8]) -> usize {
    match bytes.first() {
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => bytes
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count(),
        _ => 0,
    }
}
