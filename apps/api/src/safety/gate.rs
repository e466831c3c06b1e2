use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Value};
use thiserror::Error;
use tracing::debug;

use super::analysis::{self, ShapeError, StatementShape};
use super::config::GateConfig;

// ────────────────────────────────────────────────────────────────────────────
// Result / error types
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of running a candidate statement through the gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub is_read_only: bool,
    pub has_limit: bool,
    pub estimated_cost: f64,
    pub safety_score: f64,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum GateError {
    /// The candidate failed validation. The full result is kept for audit.
    #[error("{reason}")]
    Rejected {
        reason: String,
        result: Box<ValidationResult>,
    },

    /// Valid SQL whose safety score is below the execution threshold.
    #[error("query safety score {score:.2} is below the execution threshold")]
    Unsafe {
        score: f64,
        result: Box<ValidationResult>,
    },

    #[error("failed to rewrite SQL: {0}")]
    Structure(#[from] ShapeError),
}

/// SQL that passed the execution check. Only the gate can build one, so a
/// connector taking `&ApprovedSql` never sees unchecked text.
#[derive(Debug, Clone)]
pub struct ApprovedSql {
    sql: String,
}

impl ApprovedSql {
    pub fn as_str(&self) -> &str {
        &self.sql
    }
}

/// A statement rewritten with an explicit row limit, plus its re-validation.
#[derive(Debug, Clone)]
pub struct LimitedSql {
    pub sql: String,
    pub limit: i64,
    pub validation: ValidationResult,
}

// ────────────────────────────────────────────────────────────────────────────
// Gate
// ────────────────────────────────────────────────────────────────────────────

pub struct SafetyGate {
    config: GateConfig,
    blocked: Vec<String>,
    suspicious: Vec<String>,
    allowed_functions: HashSet<String>,
}

impl SafetyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            blocked: uppercased(&config.blocked_keywords),
            suspicious: uppercased(&config.suspicious_patterns),
            allowed_functions: uppercased(&config.allowed_functions).into_iter().collect(),
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Runs every check and returns the result, accepted or not.
    pub fn evaluate(&self, sql: &str) -> ValidationResult {
        self.run(sql).0
    }

    /// Like `evaluate`, but a rejected candidate comes back as an error.
    pub fn validate(&self, sql: &str) -> Result<ValidationResult, GateError> {
        match self.run(sql) {
            (result, None) => Ok(result),
            (result, Some(reason)) => Err(GateError::Rejected {
                reason,
                result: Box::new(result),
            }),
        }
    }

    /// The execution gate: valid, read-only and scored at or above the
    /// configured minimum.
    pub fn is_safe(&self, result: &ValidationResult) -> bool {
        result.is_valid
            && result.is_read_only
            && result.safety_score >= self.config.min_safety_score
    }

    /// Validates `sql` and, when it passes the execution gate, wraps it for
    /// the dispatcher.
    pub fn approve(&self, sql: &str) -> Result<ApprovedSql, GateError> {
        let validation = self.validate(sql)?;
        if !self.is_safe(&validation) {
            return Err(GateError::Unsafe {
                score: validation.safety_score,
                result: Box::new(validation),
            });
        }
        debug!(safety_score = validation.safety_score, "SQL approved for execution");
        Ok(ApprovedSql {
            sql: sql.trim().to_string(),
        })
    }

    /// Clamps `limit` to `(0, max_row_limit]` (anything outside becomes the
    /// maximum), rewrites the LIMIT clause and re-validates the result.
    pub fn enforce_limit(&self, sql: &str, limit: i64) -> Result<LimitedSql, GateError> {
        let limit = if limit <= 0 || limit > self.config.max_row_limit {
            self.config.max_row_limit
        } else {
            limit
        };

        self.validate(sql)?;

        let mut query = analysis::parse_query(sql.trim())?;
        query.limit = Some(Expr::Value(Value::Number(limit.to_string(), false)));
        query.fetch = None;
        let rewritten = query.to_string();

        let validation = self.validate(&rewritten)?;
        debug!(limit, sql = %rewritten, "row limit enforced");

        Ok(LimitedSql {
            sql: rewritten,
            limit,
            validation,
        })
    }

    fn run(&self, sql: &str) -> (ValidationResult, Option<String>) {
        let mut result = ValidationResult::default();

        let sql = sql.trim();
        if sql.is_empty() {
            result.violations.push("Empty query".to_string());
            return (result, Some("empty SQL query".to_string()));
        }

        let upper = sql.to_uppercase();
        let blocked: Vec<String> = self
            .blocked
            .iter()
            .filter_map(|keyword| blocked_violation(&upper, keyword))
            .collect();
        if !blocked.is_empty() {
            result.violations = blocked;
            return (result, Some("SQL contains blocked operations".to_string()));
        }

        let shape = match analysis::analyze(sql) {
            Ok(shape) => shape,
            Err(err) => {
                result.violations.push(err.violation());
                return (result, Some(err.to_string()));
            }
        };

        result.is_read_only = true;
        result.has_limit = shape.has_limit;
        if !shape.has_limit {
            result
                .warnings
                .push("Query should include LIMIT clause for performance".to_string());
        }

        if shape.table_count() > self.config.max_join_tables {
            result.warnings.push(format!(
                "Query joins too many tables ({} > {})",
                shape.table_count(),
                self.config.max_join_tables
            ));
        }

        let unauthorized = self.unauthorized_functions(&shape);
        if !unauthorized.is_empty() {
            result.violations.extend(
                unauthorized
                    .into_iter()
                    .map(|name| format!("Unauthorized function: {name}")),
            );
            return (
                result,
                Some("SQL contains unauthorized functions".to_string()),
            );
        }

        for pattern in &self.suspicious {
            if upper.contains(pattern.as_str()) {
                result
                    .warnings
                    .push(format!("Potentially suspicious pattern detected: {pattern}"));
            }
        }

        result.safety_score = self.score(&result);
        result.estimated_cost = estimate_cost(&shape);
        result.is_valid = result.violations.is_empty();

        (result, None)
    }

    fn unauthorized_functions(&self, shape: &StatementShape) -> Vec<String> {
        let mut seen = HashSet::new();
        shape
            .functions
            .iter()
            .filter(|name| !self.allowed_functions.contains(name.as_str()))
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    fn score(&self, result: &ValidationResult) -> f64 {
        let w = &self.config.weights;
        let mut score = 1.0;
        score -= w.violation_penalty * result.violations.len() as f64;
        score -= w.warning_penalty * result.warnings.len() as f64;
        if result.is_read_only {
            score += w.read_only_bonus;
        }
        if result.has_limit {
            score += w.limit_bonus;
        }
        score.clamp(0.0, 1.0)
    }
}

/// Relative cost hint for display. Not a planner estimate.
fn estimate_cost(shape: &StatementShape) -> f64 {
    let mut cost = 0.01;
    cost += 0.005 * shape.table_count() as f64;
    cost += 0.01 * shape.join_count() as f64;
    if shape.has_where {
        cost += 0.005;
    }
    if shape.has_group_by {
        cost += 0.01;
    }
    if shape.has_order_by {
        cost += 0.005;
    }
    cost
}

/// Names the keyword and, when it sits inside a longer identifier, the
/// identifier it was found in.
fn blocked_violation(upper: &str, keyword: &str) -> Option<String> {
    let pos = upper.find(keyword)?;
    let end = pos + keyword.len();
    let start = upper[..pos]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_word_char(*c))
        .last()
        .map_or(pos, |(i, _)| i);
    let stop = upper[end..]
        .char_indices()
        .find(|(_, c)| !is_word_char(*c))
        .map_or(upper.len(), |(i, _)| end + i);

    let token = &upper[start..stop];
    Some(if token == keyword {
        format!("Blocked keyword detected: {keyword}")
    } else {
        format!("Blocked keyword detected: {keyword} (in {token})")
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn uppercased(items: &[String]) -> Vec<String> {
    items.iter().map(|item| item.to_uppercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SafetyGate {
        SafetyGate::new(GateConfig::default())
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_plain_select_without_limit() {
        let result = gate().evaluate("SELECT * FROM sales");
        assert!(result.is_valid);
        assert!(result.is_read_only);
        assert!(!result.has_limit);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("LIMIT"));
        assert!(result.violations.is_empty());
        // 1.0 - 0.1 + 0.2, clamped
        assert!(approx(result.safety_score, 1.0));
        assert!(approx(result.estimated_cost, 0.015));
    }

    #[test]
    fn test_enforce_limit_appends_clause() {
        let limited = gate().enforce_limit("SELECT * FROM sales", 50).unwrap();
        assert_eq!(limited.sql, "SELECT * FROM sales LIMIT 50");
        assert_eq!(limited.limit, 50);
        assert!(limited.validation.has_limit);
        assert!(limited.validation.warnings.is_empty());
    }

    #[test]
    fn test_enforce_limit_overwrites_existing_limit() {
        let limited = gate()
            .enforce_limit("select id from sales limit 5000", 20)
            .unwrap();
        assert_eq!(limited.sql, "SELECT id FROM sales LIMIT 20");
    }

    #[test]
    fn test_enforce_limit_is_idempotent() {
        let g = gate();
        let once = g
            .enforce_limit("SELECT region, SUM(amount) FROM sales GROUP BY region", 100)
            .unwrap();
        let twice = g.enforce_limit(&once.sql, 100).unwrap();
        assert_eq!(once.sql, twice.sql);
        assert_eq!(once.validation, twice.validation);
    }

    #[test]
    fn test_enforce_limit_clamps_out_of_range() {
        let g = gate();
        assert_eq!(g.enforce_limit("SELECT * FROM sales", 0).unwrap().limit, 10_000);
        assert_eq!(g.enforce_limit("SELECT * FROM sales", -3).unwrap().limit, 10_000);
        assert_eq!(
            g.enforce_limit("SELECT * FROM sales", 50_000).unwrap().limit,
            10_000
        );
        assert_eq!(
            g.enforce_limit("SELECT * FROM sales", 10_000).unwrap().limit,
            10_000
        );
    }

    #[test]
    fn test_enforce_limit_refuses_rejected_sql() {
        let err = gate().enforce_limit("DROP TABLE sales", 10).unwrap_err();
        assert!(matches!(err, GateError::Rejected { .. }));
    }

    #[test]
    fn test_drop_table_rejected() {
        let result = gate().evaluate("DROP TABLE sales");
        assert!(!result.is_valid);
        assert!(result.violations.iter().any(|v| v.contains("DROP")));
    }

    #[test]
    fn test_unknown_function_named_in_violation() {
        let g = gate();
        let result = g.evaluate("SELECT EXEC_SOMETHING() FROM sales LIMIT 10");
        assert!(!result.is_valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.contains("EXEC_SOMETHING")));

        let result = g.evaluate("SELECT md5(name) FROM sales LIMIT 10");
        assert_eq!(result.violations, vec!["Unauthorized function: MD5".to_string()]);
        let err = g.validate("SELECT md5(name) FROM sales LIMIT 10").unwrap_err();
        assert_eq!(err.to_string(), "SQL contains unauthorized functions");
    }

    #[test]
    fn test_all_unauthorized_functions_collected() {
        let result = gate().evaluate(
            "SELECT pg_sleep(1), md5(name), md5(email), COUNT(*) FROM users LIMIT 1",
        );
        assert_eq!(
            result.violations,
            vec![
                "Unauthorized function: PG_SLEEP".to_string(),
                "Unauthorized function: MD5".to_string(),
            ]
        );
    }

    #[test]
    fn test_in_list_is_not_a_function_call() {
        let result =
            gate().evaluate("SELECT * FROM sales WHERE region IN ('EU', 'US') LIMIT 10");
        assert!(result.is_valid, "{:?}", result.violations);
    }

    #[test]
    fn test_keyword_inside_identifier_still_blocked() {
        let g = gate();
        let cases = [
            ("SELECT created_at FROM sales LIMIT 1", "CREATE"),
            ("SELECT * FROM updates LIMIT 1", "UPDATE"),
            ("SELECT dropped_count FROM sales LIMIT 1", "DROP"),
            ("SELECT * FROM sales WHERE note = 'xDELETEx' LIMIT 1", "DELETE"),
        ];
        for (sql, keyword) in cases {
            let result = g.evaluate(sql);
            assert!(!result.is_valid, "accepted: {sql}");
            assert!(!g.is_safe(&result), "safe: {sql}");
            assert!(
                result.violations.iter().any(|v| v.contains(keyword)),
                "{sql}: {:?}",
                result.violations
            );
        }
    }

    #[test]
    fn test_every_blocked_keyword_reported() {
        let result = gate().evaluate("EXECUTE proc; DROP TABLE sales");
        assert_eq!(
            result.violations,
            vec![
                "Blocked keyword detected: DROP".to_string(),
                "Blocked keyword detected: EXEC (in EXECUTE)".to_string(),
                "Blocked keyword detected: EXECUTE".to_string(),
            ]
        );
        assert!(approx(result.safety_score, 0.0));
    }

    #[test]
    fn test_suspicious_patterns_match_as_substrings() {
        let result = gate().evaluate("SELECT id FROM a WHERE x = 1 or 1=1 LIMIT 5");
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.ends_with("OR 1=1")));
    }

    #[test]
    fn test_blocked_keyword_in_comment_rejected() {
        let result = gate().evaluate("SELECT * FROM sales LIMIT 1 -- then DELETE everything");
        assert!(!result.is_valid);
        assert!(result.violations[0].contains("DELETE"));
    }

    #[test]
    fn test_empty_query_rejected() {
        let g = gate();
        for sql in ["", "   ", "\n\t"] {
            let result = g.evaluate(sql);
            assert!(!result.is_valid);
            assert_eq!(result.violations, vec!["Empty query".to_string()]);
        }
    }

    #[test]
    fn test_known_bad_corpus_rejected() {
        let corpus = [
            "INSERT INTO sales (id) VALUES (1)",
            "UPDATE sales SET amount = 0",
            "DELETE FROM sales",
            "MERGE INTO sales USING staging ON sales.id = staging.id WHEN MATCHED THEN DELETE",
            "UPSERT INTO sales VALUES (1)",
            "CREATE TABLE t (id INT)",
            "ALTER TABLE sales ADD COLUMN x INT",
            "DROP TABLE sales",
            "TRUNCATE TABLE sales",
            "RENAME TABLE sales TO old_sales",
            "GRANT ALL ON sales TO public",
            "REVOKE SELECT ON sales FROM public",
            "COMMIT",
            "ROLLBACK",
            "SAVEPOINT before_cleanup",
            "EXEC sp_who",
            "EXECUTE procedure_name",
            "CALL refresh_stats()",
            "LOAD DATA INFILE '/tmp/x' INTO TABLE sales",
            "COPY sales TO '/tmp/out.csv'",
            "SHOW TABLES",
            "DESCRIBE sales",
            "EXPLAIN SELECT * FROM sales",
            "ANALYZE sales",
            "SELECT * FROM sales INTO OUTFILE '/tmp/out'",
            "select into backup from sales",
            "SELECT * INTO backup FROM sales",
            "SELECT * FROM sales; SELECT * FROM users",
            "SELECT * FROM sales FOR UPDATE",
            "SELECT pg_read_file('/etc/passwd') LIMIT 1",
            "SELECT * FROM dblink('host=evil', 'SELECT 1') AS t(x int) LIMIT 1",
            "WITH gone AS (SELECT 1) SELEC * FROM gone",
            "VALUES (1)",
        ];
        let g = gate();
        for sql in corpus {
            let result = g.evaluate(sql);
            assert!(!result.is_valid, "accepted: {sql}");
            assert!(!result.violations.is_empty(), "no violation: {sql}");
            assert!(g.validate(sql).is_err(), "validate accepted: {sql}");
            assert!(!g.is_safe(&result), "safe: {sql}");
        }
    }

    #[test]
    fn test_blocked_keyword_always_invalid() {
        let g = gate();
        for kw in &g.config().blocked_keywords {
            let sql = format!("SELECT id FROM sales WHERE note = '{kw}' LIMIT 1");
            assert!(!g.evaluate(&sql).is_valid, "{kw}");
        }
    }

    #[test]
    fn test_safe_implies_valid_and_read_only() {
        let g = gate();
        let samples = [
            "SELECT * FROM sales",
            "SELECT * FROM sales LIMIT 10",
            "SELECT id FROM a UNION SELECT id FROM b",
            "SELECT * FROM sales WHERE 1=1 OR 1=1",
            "DROP TABLE sales",
            "SELECT nope() FROM sales",
            "",
        ];
        for sql in samples {
            let result = g.evaluate(sql);
            if g.is_safe(&result) {
                assert!(result.is_valid && result.is_read_only, "{sql}");
            }
        }
    }

    #[test]
    fn test_union_flagged_as_suspicious() {
        let result = gate().evaluate("SELECT id FROM a UNION SELECT id FROM b LIMIT 5");
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("UNION")));
    }

    #[test]
    fn test_tautology_flagged_as_suspicious() {
        let result = gate().evaluate("SELECT * FROM users WHERE name = 'x' OR 1=1 LIMIT 5");
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("OR 1=1")));
    }

    #[test]
    fn test_many_warnings_fall_below_execution_threshold() {
        let g = gate();
        // no LIMIT, UNION, AND 1=1, OR 1=1, comment markers
        let sql = "SELECT id FROM a /* x */ WHERE 1=1 AND 1=1 OR 1=1 UNION SELECT id FROM b";
        let result = g.evaluate(sql);
        assert!(result.is_valid);
        assert!(result.safety_score < 0.7, "{}", result.safety_score);
        assert!(!g.is_safe(&result));
        assert!(matches!(g.approve(sql), Err(GateError::Unsafe { .. })));
    }

    #[test]
    fn test_join_threshold_warning() {
        let sql = "SELECT * FROM a JOIN b ON a.id = b.id JOIN c ON b.id = c.id \
                   JOIN d ON c.id = d.id JOIN e ON d.id = e.id JOIN f ON e.id = f.id LIMIT 10";
        let result = gate().evaluate(sql);
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("too many tables")));

        let mut config = GateConfig::default();
        config.max_join_tables = 10;
        let relaxed = SafetyGate::new(config).evaluate(sql);
        assert!(relaxed.warnings.is_empty());
    }

    #[test]
    fn test_cost_estimate_components() {
        let result = gate().evaluate(
            "SELECT c.region, SUM(s.amount) FROM sales s JOIN customers c ON s.cid = c.id \
             WHERE s.amount > 0 GROUP BY c.region ORDER BY c.region LIMIT 10",
        );
        // 0.01 + 2*0.005 + 1*0.01 + 0.005 + 0.01 + 0.005
        assert!(approx(result.estimated_cost, 0.05), "{}", result.estimated_cost);
    }

    #[test]
    fn test_approve_wraps_trimmed_sql() {
        let approved = gate().approve("  SELECT * FROM sales LIMIT 5  ").unwrap();
        assert_eq!(approved.as_str(), "SELECT * FROM sales LIMIT 5");
    }

    #[test]
    fn test_stricter_threshold_from_config() {
        let sql = "SELECT id FROM a WHERE x = 1 OR 1=1 UNION SELECT id FROM b";
        assert!(gate().approve(sql).is_ok());

        let mut config = GateConfig::default();
        config.min_safety_score = 0.95;
        let strict = SafetyGate::new(config);
        assert!(strict.approve("SELECT * FROM sales LIMIT 5").is_ok());
        assert!(matches!(strict.approve(sql), Err(GateError::Unsafe { .. })));
    }
}
