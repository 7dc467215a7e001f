//! Activation predicates - `when:` conditions over parameters
//!
//! Grammar:
//! ```text
//! predicate := "true" | "false"
//!            | "empty(" operand ")" | "!empty(" operand ")"
//!            | operand ("==" | "!=") operand
//! operand   := "param." name | "'" literal "'"
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::ParameterSet;

static EMPTY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(!?)\s*empty\(\s*(.+?)\s*\)$").unwrap());

static CMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(param\.\w+|'[^']*')\s*(==|!=)\s*(param\.\w+|'[^']*')$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Param(String),
    Literal(String),
}

impl Operand {
    fn parse(s: &str) -> Option<Self> {
        if let Some(name) = s.strip_prefix("param.") {
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Some(Operand::Param(name.to_string()));
            }
            return None;
        }
        s.strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
            .map(|lit| Operand::Literal(lit.to_string()))
    }

    fn eval(&self, params: &ParameterSet) -> Result<String, String> {
        match self {
            Operand::Literal(s) => Ok(s.clone()),
            Operand::Param(name) => params
                .get_str(name)
                .ok_or_else(|| format!("unknown parameter '{}'", name)),
        }
    }
}

/// Parsed activation predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Const(bool),
    Empty { negated: bool, operand: Operand },
    Compare { lhs: Operand, equal: bool, rhs: Operand },
}

impl Predicate {
    /// Parse a predicate; the error string describes what went wrong
    pub fn parse(source: &str) -> Result<Self, String> {
        let src = source.trim();
        match src {
            "true" => return Ok(Predicate::Const(true)),
            "false" => return Ok(Predicate::Const(false)),
            _ => {}
        }

        if let Some(cap) = EMPTY_RE.captures(src) {
            let operand = Operand::parse(&cap[2])
                .ok_or_else(|| format!("invalid operand '{}'", &cap[2]))?;
            return Ok(Predicate::Empty {
                negated: &cap[1] == "!",
                operand,
            });
        }

        if let Some(cap) = CMP_RE.captures(src) {
            let lhs = Operand::parse(&cap[1]).ok_or_else(|| format!("invalid operand '{}'", &cap[1]))?;
            let rhs = Operand::parse(&cap[3]).ok_or_else(|| format!("invalid operand '{}'", &cap[3]))?;
            return Ok(Predicate::Compare {
                lhs,
                equal: &cap[2] == "==",
                rhs,
            });
        }

        Err(format!("cannot parse predicate '{}'", source))
    }

    /// Evaluate against the resolved parameters
    pub fn eval(&self, params: &ParameterSet) -> Result<bool, String> {
        match self {
            Predicate::Const(b) => Ok(*b),
            Predicate::Empty { negated, operand } => {
                let empty = operand.eval(params)?.is_empty();
                Ok(empty != *negated)
            }
            Predicate::Compare { lhs, equal, rhs } => {
                let same = lhs.eval(params)? == rhs.eval(params)?;
                Ok(same == *equal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params(principal: &str) -> ParameterSet {
        let mut values = BTreeMap::new();
        values.insert("principalId".to_string(), json!(principal));
        values.insert("env".to_string(), json!("dev"));
        ParameterSet::from_values(values)
    }

    fn eval(src: &str, principal: &str) -> Result<bool, String> {
        Predicate::parse(src)?.eval(&params(principal))
    }

    #[test]
    fn not_equal_empty_literal() {
        assert!(!eval("param.principalId != ''", "").unwrap());
        assert!(eval("param.principalId != ''", "1111").unwrap());
    }

    #[test]
    fn empty_functions() {
        assert!(eval("empty(param.principalId)", "").unwrap());
        assert!(!eval("!empty(param.principalId)", "").unwrap());
        assert!(eval("!empty(param.principalId)", "x").unwrap());
    }

    #[test]
    fn equality_between_params_and_literals() {
        assert!(eval("param.env == 'dev'", "").unwrap());
        assert!(eval("'dev' == param.env", "").unwrap());
        assert!(!eval("param.env == param.principalId", "x").unwrap());
    }

    #[test]
    fn constants() {
        assert!(eval("true", "").unwrap());
        assert!(!eval(" false ", "").unwrap());
    }

    #[test]
    fn unknown_parameter_fails() {
        let err = eval("param.missing != ''", "").unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn garbage_fails_to_parse() {
        assert!(Predicate::parse("principalId").is_err());
        assert!(Predicate::parse("param.x > 1").is_err());
        assert!(Predicate::parse("empty(foo)").is_err());
    }
}
