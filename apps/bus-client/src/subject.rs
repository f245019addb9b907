//! Subject syntax: `.`-separated tokens, `*` matches one token, `>` matches
//! one or more trailing tokens.

use bus_common::id::prefix;

use crate::error::{BusError, Result};

/// Check that `subject` is well formed. Wildcards are only legal when
/// `allow_wildcards` is set (subscriptions); publishes must be literal.
pub fn validate(subject: &str, allow_wildcards: bool) -> Result<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(BusError::invalid_subject(subject));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(BusError::invalid_subject(subject));
        }
        let is_wildcard = *token == "*" || *token == ">";
        if is_wildcard && !allow_wildcards {
            return Err(BusError::invalid_subject(subject));
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(BusError::invalid_subject(subject));
        }
        if !is_wildcard && (token.contains('*') || token.contains('>')) {
            return Err(BusError::invalid_subject(subject));
        }
    }
    Ok(())
}

/// Whether the (possibly wildcarded) `pattern` matches the literal `subject`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Project ids are embedded in subjects, so they may not contain separators
/// or wildcard characters.
pub fn validate_project_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace());
    if valid {
        Ok(())
    } else {
        Err(BusError::invalid_argument(format!("invalid project id {id:?}")))
    }
}

/// Extract the project id from a permission entry shaped like
/// `project.<id>.…`. Entries without a trailing token are not project grants.
pub fn project_id_of(entry: &str) -> Option<&str> {
    let mut tokens = entry.split('.');
    if tokens.next()? != prefix::PROJECT {
        return None;
    }
    let id = tokens.next()?;
    tokens.next()?;
    if id == "*" || id == ">" || id.is_empty() {
        return None;
    }
    Some(id)
}

/// Allow-list entry that grants full access to one project.
pub fn project_grant(project_id: &str) -> String {
    format!("{}.{}.>", prefix::PROJECT, project_id)
}
