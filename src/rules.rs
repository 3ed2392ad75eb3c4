//! Targeting rule evaluation.
//!
//! A rule set is a list of platform groups. Only groups for the request's
//! platform count; inside a group the alternatives are OR'd and the
//! comparisons of one alternative are AND'd. Groups are evaluated in order and
//! the last matching group decides.

use anyhow::{anyhow, Result};
use std::str::FromStr;

use crate::model::{PlatformRule, RequestMeta, Rule};

/// Comparison operators accepted in stored rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Eq,
    Gt,
    Ge,
}

impl Comparator {
    pub fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
        }
    }
}

impl FromStr for Comparator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            "=" => Ok(Comparator::Eq),
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            other => Err(anyhow!("unexpected comparer: {}", other)),
        }
    }
}

/// Decide whether a request is eligible for a code version.
///
/// Errors mean the stored rule is malformed (unknown field, comparator or an
/// unparsable threshold); they are never folded into `false`.
pub fn evaluate(rules: &[PlatformRule], meta: &RequestMeta) -> Result<bool> {
    let mut eligible = true;

    for group in rules.iter().filter(|group| group.platform == meta.platform) {
        eligible = group.rules.is_empty();
        for alternative in &group.rules {
            let mut all = true;
            for rule in alternative {
                // every comparison is checked so a malformed rule cannot hide
                // behind an earlier false one
                all &= compare(rule, meta)?;
            }
            eligible |= all;
        }
    }

    Ok(eligible)
}

fn compare(rule: &Rule, meta: &RequestMeta) -> Result<bool> {
    let lhs = match rule.field.as_str() {
        "version" => meta.version,
        other => return Err(anyhow!("unrecognized field: {}", other)),
    };
    let comparator: Comparator = rule.compare.parse()?;
    let rhs: i64 = rule.value.trim().parse().map_err(|e| {
        anyhow!(
            "invalid threshold '{}' for field {}: {}",
            rule.value,
            rule.field,
            e
        )
    })?;
    Ok(comparator.holds(lhs, rhs))
}
