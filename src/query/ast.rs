use serde::{Deserialize, Serialize};

/// Pseudo-column addressing row labels instead of file data. Supports
/// only `Eq`/`Neq` against a label id or the no-label sentinel.
pub const LABELS_COLUMN: &str = "__labels__";
/// Sentinel value matching rows with an empty label set.
pub const NO_LABEL: &str = "__no_label__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Contains,
    Eq,
    Neq,
    StartsWith,
    Matches,
    NotMatches,
    Gt,
    Lt,
    Between,
}

fn default_enabled() -> bool {
    true
}

/// Leaf predicate over one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLeaf {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
    #[serde(default)]
    pub value2: Option<String>,
    /// Request fuzzy fallback when an exact `Eq` yields zero rows.
    #[serde(default)]
    pub fuzzy: bool,
    #[serde(default)]
    pub fuzzy_distance: Option<u8>,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Disabled leaves are retained in the tree but excluded from
    /// evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl FilterLeaf {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        FilterLeaf {
            column: column.into(),
            operator,
            value: value.into(),
            value2: None,
            fuzzy: false,
            fuzzy_distance: None,
            case_sensitive: false,
            enabled: true,
        }
    }
}

/// Binary tree of and/or combinators over leaf predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Leaf(FilterLeaf),
}

impl FilterExpr {
    pub fn leaf(leaf: FilterLeaf) -> Self {
        FilterExpr::Leaf(leaf)
    }

    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::Or(Box::new(left), Box::new(right))
    }

    /// Leaves in in-order traversal. Leaf indices used in filter
    /// outcomes refer to positions in this ordering.
    pub fn leaves(&self) -> Vec<&FilterLeaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a FilterLeaf>) {
        match self {
            FilterExpr::And(l, r) | FilterExpr::Or(l, r) => {
                l.collect_leaves(out);
                r.collect_leaves(out);
            }
            FilterExpr::Leaf(leaf) => out.push(leaf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            direction: SortDirection::Ascending,
            case_sensitive: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            direction: SortDirection::Descending,
            case_sensitive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub op: AggregateOp,
    /// Required for every op except `Count`.
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRequest {
    pub columns: Vec<String>,
    pub aggregates: Vec<AggregateSpec>,
    /// Group over the current filtered set instead of all rows.
    #[serde(default)]
    pub use_filter: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_are_collected_in_order() {
        let expr = FilterExpr::and(
            FilterExpr::leaf(FilterLeaf::new("a", FilterOperator::Eq, "1")),
            FilterExpr::or(
                FilterExpr::leaf(FilterLeaf::new("b", FilterOperator::Eq, "2")),
                FilterExpr::leaf(FilterLeaf::new("c", FilterOperator::Eq, "3")),
            ),
        );
        let columns: Vec<&str> = expr.leaves().iter().map(|l| l.column.as_str()).collect();
        assert_eq!(columns, vec!["a", "b", "c"]);
    }

    #[test]
    fn leaf_deserializes_with_defaults() {
        let leaf: FilterLeaf =
            serde_json::from_str(r#"{"column":"age","operator":"eq","value":"30"}"#).unwrap();
        assert!(leaf.enabled);
        assert!(!leaf.fuzzy);
        assert_eq!(leaf.value2, None);
    }

    #[test]
    fn expr_round_trips_through_json() {
        let expr = FilterExpr::or(
            FilterExpr::leaf(FilterLeaf::new("x", FilterOperator::Contains, "foo")),
            FilterExpr::leaf(FilterLeaf::new("y", FilterOperator::Gt, "10")),
        );
        let json = serde_json::to_string(&expr).unwrap();
        let back: FilterExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
    }
}
