//! ODRL-shaped structured rules
//!
//! A policy's structured body is three rule lists (permissions, prohibitions,
//! obligations). Rules match on action/target/assignee and gate on a
//! constraint tree of atomic comparisons combined with and/or/xone.

use aegis_core::{ConstraintSpec, DecisionContext, ObligationSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three ODRL rule lists a policy may carry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Rule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prohibitions: Vec<Rule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<Rule>,
}

impl RuleSet {
    /// Whether no rules are present at all
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.prohibitions.is_empty() && self.obligations.is_empty()
    }
}

/// A single rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Action matcher: exact, `prefix*`, `mcp:<method>`, or `tool:<name>`
    pub action: String,

    /// Resource matcher (exact or `prefix*`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Agent matcher (exact or `prefix*`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Constraint tree; an empty list is an unconditional match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,

    /// Duties attached to a permission, surfaced as decision obligations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duties: Vec<ObligationSpec>,

    /// Transformations enforcement applies when this permission grants
    /// access (anonymization, rate limits, geo checks)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<ConstraintSpec>,
}

impl Rule {
    /// A rule matching an action expression with no further conditions
    pub fn for_action(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: None,
            assignee: None,
            constraints: Vec::new(),
            duties: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add a constraint
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Add a duty
    pub fn with_duty(mut self, duty: ObligationSpec) -> Self {
        self.duties.push(duty);
        self
    }

    /// Add an enforcement transformation
    pub fn with_transform(mut self, transform: ConstraintSpec) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Whether action, target, and assignee all match the request
    pub fn applies_to(&self, ctx: &DecisionContext) -> bool {
        action_matches(&self.action, ctx)
            && self
                .target
                .as_deref()
                .map_or(true, |t| pattern_matches(t, &ctx.resource))
            && self
                .assignee
                .as_deref()
                .map_or(true, |a| pattern_matches(a, &ctx.agent_id))
    }

    /// Whether all top-level constraints are satisfied (implicit AND)
    pub fn constraints_satisfied(&self, ctx: &DecisionContext) -> bool {
        self.constraints.iter().all(|c| c.satisfied(ctx))
    }
}

/// Match an action expression against the request.
///
/// `mcp:` pins the MCP method, `tool:` pins the tool name; a bare expression
/// matches either, so a policy can name tools without knowing the method.
pub fn action_matches(expr: &str, ctx: &DecisionContext) -> bool {
    if let Some(method) = expr.strip_prefix("mcp:") {
        return pattern_matches(method, &ctx.action);
    }
    if let Some(tool) = expr.strip_prefix("tool:") {
        return ctx.tool.as_deref().map_or(false, |t| pattern_matches(tool, t));
    }
    pattern_matches(expr, &ctx.action)
        || ctx.tool.as_deref().map_or(false, |t| pattern_matches(expr, t))
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Comparison operators for atomic constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gteq,
    Lt,
    Lteq,
    In,
    HasPart,
    IsA,
    IsAllOf,
    IsAnyOf,
    IsNoneOf,
    IsPartOf,
}

/// A node in the constraint tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Constraint {
    /// Leaf comparison against a context operand
    #[serde(rename_all = "camelCase")]
    Atomic {
        /// Operand name resolved through the decision context
        left_operand: String,

        /// Comparison operator
        operator: Operator,

        /// Literal to compare against
        right_operand: Value,
    },

    /// All sub-constraints must hold
    And { constraints: Vec<Constraint> },

    /// At least one sub-constraint must hold
    Or { constraints: Vec<Constraint> },

    /// Exactly one sub-constraint must hold
    Xone { constraints: Vec<Constraint> },
}

impl Constraint {
    /// Build an atomic constraint
    pub fn atomic(left: impl Into<String>, operator: Operator, right: Value) -> Self {
        Self::Atomic {
            left_operand: left.into(),
            operator,
            right_operand: right,
        }
    }

    /// Evaluate the tree against the context.
    ///
    /// Missing operands make every comparison false except `neq`, which holds
    /// vacuously: an absent value is by definition not equal to the literal.
    pub fn satisfied(&self, ctx: &DecisionContext) -> bool {
        match self {
            Self::Atomic {
                left_operand,
                operator,
                right_operand,
            } => match ctx.attribute(left_operand) {
                Some(left) => compare(&left, *operator, right_operand),
                None => *operator == Operator::Neq,
            },
            Self::And { constraints } => constraints.iter().all(|c| c.satisfied(ctx)),
            Self::Or { constraints } => constraints.iter().any(|c| c.satisfied(ctx)),
            Self::Xone { constraints } => {
                constraints.iter().filter(|c| c.satisfied(ctx)).count() == 1
            }
        }
    }

    /// Short description used in denial reasons
    pub fn describe(&self) -> String {
        match self {
            Self::Atomic {
                left_operand,
                operator,
                right_operand,
            } => format!("{} {:?} {}", left_operand, operator, right_operand),
            Self::And { constraints } => format!("and({})", constraints.len()),
            Self::Or { constraints } => format!("or({})", constraints.len()),
            Self::Xone { constraints } => format!("xone({})", constraints.len()),
        }
    }
}

fn compare(left: &Value, operator: Operator, right: &Value) -> bool {
    match operator {
        Operator::Eq | Operator::IsA => values_equal(left, right),
        Operator::Neq => !values_equal(left, right),
        Operator::Gt => ordering(left, right).map_or(false, |o| o.is_gt()),
        Operator::Gteq => ordering(left, right).map_or(false, |o| o.is_ge()),
        Operator::Lt => ordering(left, right).map_or(false, |o| o.is_lt()),
        Operator::Lteq => ordering(left, right).map_or(false, |o| o.is_le()),
        Operator::In | Operator::IsPartOf | Operator::IsAnyOf => member_of(left, right),
        Operator::IsNoneOf => !member_of(left, right),
        Operator::HasPart => contains(left, right),
        Operator::IsAllOf => match right.as_array() {
            Some(required) => required.iter().all(|r| contains(left, r)),
            None => contains(left, right),
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    left == right
}

/// Numbers compare numerically; strings lexically, which is correct for the
/// zero-padded `HH:MM:SS` and RFC 3339 forms the temporal operands produce.
fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r);
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return Some(l.cmp(r));
    }
    None
}

fn member_of(left: &Value, right: &Value) -> bool {
    match right.as_array() {
        Some(items) => items.iter().any(|item| values_equal(left, item)),
        None => values_equal(left, right),
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
        Value::String(s) => right.as_str().map_or(false, |r| s.contains(r)),
        _ => false,
    }
}
