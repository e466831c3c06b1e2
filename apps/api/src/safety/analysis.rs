//! Structural analysis of a candidate statement.
//!
//! The parser is the authoritative accept/reject step: anything that is not a
//! single read-only query never gets a `StatementShape`. The shape then feeds
//! the limit, join, function and cost checks in `gate.rs`.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, Expr, GroupByExpr, ObjectName, Query, Select, SetExpr, Statement,
    TableFactor, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("failed to parse SQL: {0}")]
    Parse(#[from] ParserError),

    #[error("expected a single statement, found {0}")]
    StatementCount(usize),

    #[error("only SELECT statements are allowed")]
    NotSelect,

    #[error("SELECT INTO is not allowed")]
    SelectInto,

    #[error("row locking clauses are not allowed")]
    Locking,
}

impl ShapeError {
    /// Violation text recorded on the validation result.
    pub fn violation(&self) -> String {
        match self {
            ShapeError::Parse(e) => format!("SQL parsing error: {e}"),
            ShapeError::StatementCount(n) => {
                format!("Only a single statement is allowed (found {n})")
            }
            ShapeError::NotSelect => "Only SELECT statements are allowed".to_string(),
            ShapeError::SelectInto => "SELECT INTO is not allowed".to_string(),
            ShapeError::Locking => "Row locking clauses (FOR UPDATE/SHARE) are not allowed".to_string(),
        }
    }
}

/// What the gate needs to know about an accepted query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementShape {
    /// Distinct base tables referenced in FROM/JOIN clauses, lowercased.
    pub tables: BTreeSet<String>,
    /// Called functions in order of appearance, uppercased. Includes
    /// table-valued functions used as FROM items.
    pub functions: Vec<String>,
    pub has_limit: bool,
    pub has_where: bool,
    pub has_group_by: bool,
    pub has_order_by: bool,
}

impl StatementShape {
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn join_count(&self) -> usize {
        self.tables.len().saturating_sub(1)
    }
}

/// Parses `sql` and returns the single query it contains.
pub fn parse_query(sql: &str) -> Result<Query, ShapeError> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)?;
    if statements.len() != 1 {
        return Err(ShapeError::StatementCount(statements.len()));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(*query),
        _ => Err(ShapeError::NotSelect),
    }
}

/// Parses and analyses `sql` in one step.
pub fn analyze(sql: &str) -> Result<StatementShape, ShapeError> {
    let query = parse_query(sql)?;
    analyze_query(&query)
}

pub fn analyze_query(query: &Query) -> Result<StatementShape, ShapeError> {
    let mut walker = Walker::default();
    walker.query(query)?;

    // Expression-level function calls and subqueries anywhere in the tree.
    if let ControlFlow::Break(err) = visit_expressions(query, |expr| walker.expr(expr)) {
        return Err(err);
    }

    let primary = primary_select(&query.body);
    Ok(StatementShape {
        tables: walker.tables,
        functions: walker.functions,
        has_limit: query.limit.is_some() || query.fetch.is_some(),
        has_where: primary.map(|s| s.selection.is_some()).unwrap_or(false),
        has_group_by: primary.map(|s| has_group_by(&s.group_by)).unwrap_or(false),
        has_order_by: !query.order_by.is_empty(),
    })
}

fn has_group_by(group_by: &GroupByExpr) -> bool {
    match group_by {
        GroupByExpr::All => true,
        GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
    }
}

/// The left-most SELECT of the query body.
fn primary_select(body: &SetExpr) -> Option<&Select> {
    match body {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(query) => primary_select(&query.body),
        SetExpr::SetOperation { left, .. } => primary_select(left),
        _ => None,
    }
}

pub(crate) fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Default)]
struct Walker {
    tables: BTreeSet<String>,
    functions: Vec<String>,
    cte_names: BTreeSet<String>,
}

impl Walker {
    fn query(&mut self, query: &Query) -> Result<(), ShapeError> {
        if !query.locks.is_empty() {
            return Err(ShapeError::Locking);
        }
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
                self.query(&cte.query)?;
            }
        }
        self.set_expr(&query.body)
    }

    fn set_expr(&mut self, body: &SetExpr) -> Result<(), ShapeError> {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    return Err(ShapeError::SelectInto);
                }
                for from in &select.from {
                    self.table_with_joins(from)?;
                }
                Ok(())
            }
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left)?;
                self.set_expr(right)
            }
            _ => Err(ShapeError::NotSelect),
        }
    }

    fn table_with_joins(&mut self, from: &TableWithJoins) -> Result<(), ShapeError> {
        self.table_factor(&from.relation)?;
        for join in &from.joins {
            self.table_factor(&join.relation)?;
        }
        Ok(())
    }

    fn table_factor(&mut self, factor: &TableFactor) -> Result<(), ShapeError> {
        match factor {
            TableFactor::Table { name, args, .. } => {
                let name = object_name(name);
                if args.is_some() {
                    self.functions.push(name.to_uppercase());
                } else {
                    let lowered = name.to_lowercase();
                    if !self.cte_names.contains(&lowered) {
                        self.tables.insert(lowered);
                    }
                }
                Ok(())
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins),
            _ => Ok(()),
        }
    }

    fn expr(&mut self, expr: &Expr) -> ControlFlow<ShapeError> {
        match expr {
            Expr::Function(func) => {
                self.functions.push(object_name(&func.name).to_uppercase());
            }
            Expr::Subquery(subquery)
            | Expr::Exists { subquery, .. }
            | Expr::InSubquery { subquery, .. } => {
                if let Err(err) = self.query(subquery) {
                    return ControlFlow::Break(err);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select_shape() {
        let shape = analyze("SELECT * FROM sales").unwrap();
        assert_eq!(shape.table_count(), 1);
        assert!(shape.tables.contains("sales"));
        assert!(!shape.has_limit);
        assert!(!shape.has_where);
        assert!(shape.functions.is_empty());
    }

    #[test]
    fn test_clauses_detected() {
        let shape = analyze(
            "SELECT region, SUM(amount) FROM sales WHERE amount > 0 GROUP BY region ORDER BY region LIMIT 10",
        )
        .unwrap();
        assert!(shape.has_limit);
        assert!(shape.has_where);
        assert!(shape.has_group_by);
        assert!(shape.has_order_by);
        assert_eq!(shape.functions, vec!["SUM".to_string()]);
    }

    #[test]
    fn test_join_tables_counted_once() {
        let shape = analyze(
            "SELECT * FROM sales s JOIN customers c ON s.customer_id = c.id JOIN sales s2 ON s2.id = s.id",
        )
        .unwrap();
        assert_eq!(shape.table_count(), 2);
        assert_eq!(shape.join_count(), 1);
    }

    #[test]
    fn test_subquery_tables_and_functions_collected() {
        let shape = analyze(
            "SELECT id FROM orders WHERE customer_id IN (SELECT id FROM customers WHERE UPPER(region) = 'EU')",
        )
        .unwrap();
        assert!(shape.tables.contains("orders"));
        assert!(shape.tables.contains("customers"));
        assert_eq!(shape.functions, vec!["UPPER".to_string()]);
    }

    #[test]
    fn test_cte_name_not_counted_as_table() {
        let shape =
            analyze("WITH recent AS (SELECT * FROM sales) SELECT COUNT(*) FROM recent").unwrap();
        assert_eq!(shape.table_count(), 1);
        assert!(shape.tables.contains("sales"));
    }

    #[test]
    fn test_table_valued_function_reported_as_function() {
        let shape = analyze("SELECT * FROM generate_series(1, 10)").unwrap();
        assert_eq!(shape.functions, vec!["GENERATE_SERIES".to_string()]);
        assert_eq!(shape.table_count(), 0);
    }

    #[test]
    fn test_union_accepted() {
        let shape = analyze("SELECT id FROM a UNION SELECT id FROM b").unwrap();
        assert_eq!(shape.table_count(), 2);
    }

    #[test]
    fn test_non_select_rejected() {
        assert!(matches!(
            analyze("DELETE FROM sales"),
            Err(ShapeError::NotSelect)
        ));
        assert!(matches!(
            analyze("VALUES (1), (2)"),
            Err(ShapeError::NotSelect)
        ));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert!(matches!(
            analyze("SELECT 1; SELECT 2"),
            Err(ShapeError::StatementCount(2))
        ));
    }

    #[test]
    fn test_select_into_rejected() {
        assert!(matches!(
            analyze("SELECT * INTO backup FROM sales"),
            Err(ShapeError::SelectInto)
        ));
    }

    #[test]
    fn test_locking_rejected() {
        assert!(matches!(
            analyze("SELECT * FROM sales FOR UPDATE"),
            Err(ShapeError::Locking)
        ));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = analyze("SELEC FROM WHERE").unwrap_err();
        assert!(matches!(err, ShapeError::Parse(_)));
        assert!(err.violation().starts_with("SQL parsing error"));
    }
}
