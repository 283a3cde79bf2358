//! Scheduling rules: the mutual-exclusion scopes jobs and threads declare.
//!
//! A rule answers two questions about another rule. `contains` says whether
//! the other rule is a sub-scope (nested `begin_rule` calls must stay inside
//! the outer scope). `is_conflicting` says whether the two may never be held
//! concurrently. Both must be reflexive and must reject rules they know
//! nothing about; [`validate_rule`] checks exactly that.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{JobsError, Result};

pub trait SchedulingRule: Send + Sync + fmt::Debug + 'static {
    /// True if `other` is a sub-scope of this rule.
    fn contains(&self, other: &dyn SchedulingRule) -> bool;

    /// True if this rule and `other` must never be held at the same time.
    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a scheduling rule. Identity is pointer identity.
pub type Rule = Arc<dyn SchedulingRule>;

/// True if both references point at the same rule instance.
pub fn same_rule(a: &dyn SchedulingRule, b: &dyn SchedulingRule) -> bool {
    std::ptr::addr_eq(a as *const dyn SchedulingRule, b as *const dyn SchedulingRule)
}

pub(crate) fn rule_eq(a: Option<&Rule>, b: Option<&Rule>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// A missing rule conflicts with nothing.
pub(crate) fn rules_conflict(a: Option<&Rule>, b: Option<&Rule>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_conflicting(b.as_ref()),
        _ => false,
    }
}

/// Reject rules whose predicates are not reflexive or that claim to contain
/// or conflict with an unrelated rule. Composite rules are checked per child.
pub fn validate_rule(rule: &dyn SchedulingRule) -> Result<()> {
    if let Some(multi) = rule.as_any().downcast_ref::<MultiRule>() {
        for child in multi.children() {
            validate_rule(child.as_ref())?;
        }
    }
    let unknown = UnknownRule;
    if !rule.contains(rule) {
        return Err(JobsError::InvalidRule(format!("{rule:?}: contains is not reflexive")));
    }
    if rule.contains(&unknown) {
        return Err(JobsError::InvalidRule(format!("{rule:?}: contains an unrelated rule")));
    }
    if !rule.is_conflicting(rule) {
        return Err(JobsError::InvalidRule(format!("{rule:?}: is_conflicting is not reflexive")));
    }
    if rule.is_conflicting(&unknown) {
        return Err(JobsError::InvalidRule(format!("{rule:?}: conflicts with an unrelated rule")));
    }
    Ok(())
}

/// Probe used by validation; no well-behaved rule knows about it.
#[derive(Debug)]
struct UnknownRule;

impl SchedulingRule for UnknownRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        same_rule(self, other)
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        same_rule(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Concrete rules ──────────────────────────────────────────────────

/// A rule that conflicts only with itself, the classic mutex rule.
#[derive(Debug, Default)]
pub struct ExclusiveRule {
    name: String,
}

impl ExclusiveRule {
    pub fn shared(name: impl Into<String>) -> Rule {
        Arc::new(Self { name: name.into() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SchedulingRule for ExclusiveRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        same_rule(self, other)
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        same_rule(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A hierarchical rule over `/`-separated paths.
///
/// `/a` contains `/a/b`; two path rules conflict when either contains the
/// other, so work on a directory excludes work on anything beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    path: String,
}

impl PathRule {
    pub fn shared(path: impl Into<String>) -> Rule {
        Arc::new(Self::new(path))
    }

    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let trimmed = path.trim_end_matches('/');
        let path = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
        Self { path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_prefix_of(&self, other: &PathRule) -> bool {
        if self.path == "/" {
            return true;
        }
        other.path == self.path
            || (other.path.starts_with(&self.path)
                && other.path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }
}

impl SchedulingRule for PathRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        if same_rule(self, other) {
            return true;
        }
        let any = other.as_any();
        if let Some(path) = any.downcast_ref::<PathRule>() {
            return self.is_prefix_of(path);
        }
        if let Some(multi) = any.downcast_ref::<MultiRule>() {
            return multi.children().iter().all(|c| self.contains(c.as_ref()));
        }
        false
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        if same_rule(self, other) {
            return true;
        }
        let any = other.as_any();
        if let Some(path) = any.downcast_ref::<PathRule>() {
            return self.is_prefix_of(path) || path.is_prefix_of(self);
        }
        if let Some(multi) = any.downcast_ref::<MultiRule>() {
            return multi.children().iter().any(|c| self.is_conflicting(c.as_ref()));
        }
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The union of several rules. Predicates OR across the children.
#[derive(Debug, Clone)]
pub struct MultiRule {
    rules: Vec<Rule>,
}

impl MultiRule {
    /// Combine any number of rules, flattening nested composites.
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut flat = Vec::new();
        for rule in rules {
            Self::flatten_into(&rule, &mut flat);
        }
        Self { rules: flat }
    }

    /// Smallest rule covering both inputs; `None` when both are missing.
    pub fn combine(a: Option<Rule>, b: Option<Rule>) -> Option<Rule> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) => {
                if a.contains(b.as_ref()) {
                    Some(a)
                } else if b.contains(a.as_ref()) {
                    Some(b)
                } else {
                    Some(Arc::new(MultiRule::new([a, b])))
                }
            }
        }
    }

    pub fn children(&self) -> &[Rule] {
        &self.rules
    }

    fn flatten_into(rule: &Rule, out: &mut Vec<Rule>) {
        match rule.as_any().downcast_ref::<MultiRule>() {
            Some(multi) => out.extend(multi.rules.iter().cloned()),
            None => out.push(Arc::clone(rule)),
        }
    }
}

impl SchedulingRule for MultiRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        if same_rule(self, other) {
            return true;
        }
        if let Some(multi) = other.as_any().downcast_ref::<MultiRule>() {
            return multi.rules.iter().all(|theirs| self.contains(theirs.as_ref()));
        }
        self.rules.iter().any(|mine| mine.contains(other))
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        if same_rule(self, other) {
            return true;
        }
        if let Some(multi) = other.as_any().downcast_ref::<MultiRule>() {
            return multi.rules.iter().any(|theirs| self.is_conflicting(theirs.as_ref()));
        }
        self.rules.iter().any(|mine| mine.is_conflicting(other))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
