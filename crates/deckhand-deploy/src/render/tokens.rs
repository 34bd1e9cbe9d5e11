//! Placeholder token substitution
//!
//! Tokens are `__UPPER_SNAKE__` markers. Substitution is a single left to
//! right pass with exact literal matching, so a substituted value is never
//! rescanned for further tokens. Unknown tokens are rejected on the built text
//! before substitution, so values may themselves look like tokens.

use std::collections::BTreeSet;

use crate::bootstrap::{BootstrapConfig, BootstrapKey};
use crate::{Error, Result};

const TOKEN_DELIMITER: &str = "__";

/// Replace every known token in `text` with its configured value.
pub fn substitute(text: &str, config: &BootstrapConfig) -> String {
    let pairs: Vec<(&str, &str)> = config.substitutions().collect();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(TOKEN_DELIMITER) {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        match pairs.iter().find(|(token, _)| candidate.starts_with(token)) {
            Some((token, value)) => {
                out.push_str(value);
                rest = &candidate[token.len()..];
            }
            None => {
                out.push('_');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Every distinct `__UPPER_SNAKE__` token in `text`, sorted.
pub fn find_tokens(text: &str) -> BTreeSet<String> {
    let bytes = text.as_bytes();
    let mut found = BTreeSet::new();
    let mut i = 0;

    while i + 2 < bytes.len() {
        if &bytes[i..i + 2] != TOKEN_DELIMITER.as_bytes() || !bytes[i + 2].is_ascii_uppercase() {
            i += 1;
            continue;
        }

        let mut end = i + 2;
        while end < bytes.len()
            && (bytes[end].is_ascii_uppercase() || bytes[end].is_ascii_digit() || bytes[end] == b'_')
        {
            end += 1;
        }

        let run = &text[i..end];
        if run.len() > 4 && run.ends_with(TOKEN_DELIMITER) {
            found.insert(run.to_string());
            i = end;
        } else {
            i += 1;
        }
    }

    found
}

/// Fail with every token in `text` that no bootstrap key supplies.
pub fn ensure_known(text: &str) -> Result<()> {
    let tokens: Vec<String> = find_tokens(text)
        .into_iter()
        .filter(|token| !BootstrapKey::ALL.iter().any(|key| key.token() == token))
        .collect();
    if tokens.is_empty() {
        Ok(())
    } else {
        Err(Error::UnresolvedTokens { tokens })
    }
}
