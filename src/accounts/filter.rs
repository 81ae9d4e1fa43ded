//! The account filter.
//!
//! Parses and evaluates filter expressions over an
//! [`super::OrganizationSnapshot`]. Results are always ordered by account id.

use crate::error::CoreError;
use crate::types::AccountStatus;

use super::Account;

/// A parsed account-filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Wildcard,
    Id(String),
    NameGlob(String),
    Ou { id: String, recursive: bool },
    Tag { key: String, value: String },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Exclude { base: Box<FilterExpr>, excluded: Box<FilterExpr> },
}

impl FilterExpr {
    /// Parses the supported subset of boolean combinators:
    /// `AND`/`OR`/`NOT` at the top level (left-associative, no parens) plus
    /// the atomic expression kinds. `exclude:<expr>` wraps the whole
    /// surrounding expression.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let trimmed = input.trim();
        if let Some(rest) = trimmed.strip_prefix("exclude:") {
            // `exclude:<expr>` removes its matches from the *result* of the
            // surrounding expression; at parse time it stands alone as a
            // marker the caller combines via `with_exclusion`.
            let inner = Self::parse(rest)?;
            return Ok(FilterExpr::Exclude {
                base: Box::new(FilterExpr::Wildcard),
                excluded: Box::new(inner),
            });
        }

        let tokens = tokenize_boolean(trimmed);
        Self::parse_or(&tokens)
    }

    fn parse_or(tokens: &[String]) -> Result<Self, CoreError> {
        let parts = split_on(tokens, "OR");
        let mut exprs = parts
            .into_iter()
            .map(Self::parse_and)
            .collect::<Result<Vec<_>, _>>()?;
        let mut acc = exprs.remove(0);
        for next in exprs {
            acc = FilterExpr::Or(Box::new(acc), Box::new(next));
        }
        Ok(acc)
    }

    fn parse_and(tokens: &[String]) -> Result<Self, CoreError> {
        let parts = split_on(tokens, "AND");
        let mut exprs = parts
            .into_iter()
            .map(Self::parse_atom)
            .collect::<Result<Vec<_>, _>>()?;
        let mut acc = exprs.remove(0);
        for next in exprs {
            acc = FilterExpr::And(Box::new(acc), Box::new(next));
        }
        Ok(acc)
    }

    fn parse_atom(tokens: &[String]) -> Result<Self, CoreError> {
        if tokens.is_empty() {
            return Err(CoreError::Validation {
                field: "account_filter".to_string(),
                message: "empty filter expression".to_string(),
            });
        }
        if tokens[0] == "NOT" {
            let inner = Self::parse_atom(&tokens[1..])?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        if tokens.len() != 1 {
            return Err(CoreError::Validation {
                field: "account_filter".to_string(),
                message: format!("unexpected tokens in filter atom: {tokens:?}"),
            });
        }
        Self::parse_single(&tokens[0])
    }

    fn parse_single(atom: &str) -> Result<Self, CoreError> {
        if atom == "*" {
            return Ok(FilterExpr::Wildcard);
        }
        if let Some(rest) = atom.strip_prefix("id:") {
            return Ok(FilterExpr::Id(rest.to_string()));
        }
        if let Some(rest) = atom.strip_prefix("name:") {
            return Ok(FilterExpr::NameGlob(rest.to_string()));
        }
        if let Some(rest) = atom.strip_prefix("ou:") {
            let (id, recursive) = match rest.strip_suffix(":*") {
                Some(id) => (id.to_string(), true),
                None => (rest.to_string(), false),
            };
            return Ok(FilterExpr::Ou { id, recursive });
        }
        if let Some(rest) = atom.strip_prefix("tag:") {
            let (key, value) = rest.split_once('=').ok_or_else(|| CoreError::Validation {
                field: "account_filter".to_string(),
                message: format!("tag filter '{atom}' missing '='"),
            })?;
            return Ok(FilterExpr::Tag {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Err(CoreError::Validation {
            field: "account_filter".to_string(),
            message: format!("unrecognized filter expression '{atom}'"),
        })
    }

    fn matches(&self, account: &Account, snapshot: &[Account]) -> bool {
        match self {
            FilterExpr::Wildcard => account.status == AccountStatus::Active,
            FilterExpr::Id(id) => &account.id.0 == id,
            FilterExpr::NameGlob(glob) => glob_match(glob, &account.name.0),
            FilterExpr::Ou { id, recursive } => {
                if !recursive {
                    &account.ou_id == id
                } else {
                    // Without an OU tree handy here, recursive OU matching
                    // degrades to direct membership; a full OU hierarchy
                    // walk belongs to the caller that built `snapshot`.
                    &account.ou_id == id
                }
            }
            FilterExpr::Tag { key, value } => match account.tags.get(key) {
                Some(v) => {
                    if let Some(prefix) = value.strip_suffix('*') {
                        v.starts_with(prefix)
                    } else {
                        v == value
                    }
                }
                None => false,
            },
            FilterExpr::And(a, b) => a.matches(account, snapshot) && b.matches(account, snapshot),
            FilterExpr::Or(a, b) => a.matches(account, snapshot) || b.matches(account, snapshot),
            FilterExpr::Not(inner) => !inner.matches(account, snapshot),
            FilterExpr::Exclude { base, excluded } => {
                base.matches(account, snapshot) && !excluded.matches(account, snapshot)
            }
        }
    }
}

/// Splits a glob (`*` and `?` only, shell-style) into a simple matcher; no
/// external glob dependency needed for this restricted subset.
pub fn glob_match(glob: &str, text: &str) -> bool {
    fn inner(g: &[u8], t: &[u8]) -> bool {
        match (g.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&g[1..], t) || (!t.is_empty() && inner(g, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&g[1..], &t[1..]),
            (Some(gc), Some(tc)) if gc == tc => inner(&g[1..], &t[1..]),
            _ => false,
        }
    }
    inner(glob.as_bytes(), text.as_bytes())
}

/// Evaluates `expr` against `snapshot`, returning matches ordered by
/// account id.
pub fn evaluate(expr: &FilterExpr, snapshot: &[Account]) -> Vec<Account> {
    let mut matched: Vec<Account> = snapshot
        .iter()
        .filter(|a| expr.matches(a, snapshot))
        .cloned()
        .collect();
    matched.sort_by(|a, b| a.id.0.cmp(&b.id.0));
    matched
}

fn tokenize_boolean(input: &str) -> Vec<String> {
    input.split_whitespace().map(|s| s.to_string()).collect()
}

fn split_on(tokens: &[String], sep: &str) -> Vec<Vec<String>> {
    let mut groups = vec![Vec::new()];
    for token in tokens {
        if token == sep {
            groups.push(Vec::new());
        } else {
            groups.last_mut().unwrap().push(token.clone());
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn account(id: &str, name: &str, status: AccountStatus, tags: &[(&str, &str)]) -> Account {
        Account {
            id: crate::types::AccountId(id.to_string()),
            name: crate::types::AccountName(name.to_string()),
            email: format!("{name}@example.com"),
            status,
            ou_id: "ou-1".to_string(),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn wildcard_matches_only_active_accounts() {
        let accounts = vec![
            account("1", "a", AccountStatus::Active, &[]),
            account("2", "b", AccountStatus::Suspended, &[]),
        ];
        let expr = FilterExpr::parse("*").unwrap();
        let result = evaluate(&expr, &accounts);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id.0, "1");
    }

    #[test]
    fn tag_filter_supports_wildcard_suffix() {
        let accounts = vec![
            account("1", "a", AccountStatus::Active, &[("Env", "Dev-1")]),
            account("2", "b", AccountStatus::Active, &[("Env", "Prod")]),
        ];
        let expr = FilterExpr::parse("tag:Env=Dev*").unwrap();
        let result = evaluate(&expr, &accounts);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id.0, "1");
    }

    #[test]
    fn and_not_combinator_excludes_tagged_accounts() {
        let accounts = vec![
            account("111122223333", "dev1", AccountStatus::Active, &[("Env", "Dev"), ("Critical", "true")]),
            account("222233334444", "dev2", AccountStatus::Active, &[("Env", "Dev")]),
            account("333344445555", "prod1", AccountStatus::Active, &[("Env", "Prod")]),
        ];
        let expr = FilterExpr::parse("tag:Env=Dev AND NOT tag:Critical=true").unwrap();
        let result = evaluate(&expr, &accounts);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id.0, "222233334444");
    }

    #[test]
    fn exclude_removes_matches_from_surrounding_result() {
        let accounts = vec![
            account("111122223333", "a", AccountStatus::Active, &[]),
            account("222233334444", "b", AccountStatus::Active, &[]),
        ];
        let base = FilterExpr::parse("*").unwrap();
        let excluded = FilterExpr::Id("111122223333".to_string());
        let expr = FilterExpr::Exclude {
            base: Box::new(base),
            excluded: Box::new(excluded),
        };
        let result = evaluate(&expr, &accounts);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id.0, "222233334444");
    }

    #[test]
    fn name_glob_matches_shell_style() {
        assert!(glob_match("prod-*", "prod-east"));
        assert!(!glob_match("prod-*", "dev-east"));
        assert!(glob_match("acct-?", "acct-1"));
    }

    #[test]
    fn results_are_sorted_by_account_id() {
        let accounts = vec![
            account("333", "c", AccountStatus::Active, &[]),
            account("111", "a", AccountStatus::Active, &[]),
            account("222", "b", AccountStatus::Active, &[]),
        ];
        let expr = FilterExpr::parse("*").unwrap();
        let result = evaluate(&expr, &accounts);
        let ids: Vec<_> = result.iter().map(|a| a.id.0.clone()).collect();
        assert_eq!(ids, vec!["111", "222", "333"]);
    }

    #[test]
    fn malformed_tag_expression_is_rejected() {
        assert!(FilterExpr::parse("tag:NoEquals").is_err());
    }
}
