use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_JOIN_TABLES: usize = 5;
pub const DEFAULT_MAX_ROW_LIMIT: i64 = 10_000;
pub const DEFAULT_MIN_SAFETY_SCORE: f64 = 0.7;

const BLOCKED_KEYWORDS: &[&str] = &[
    // DML
    "INSERT",
    "UPDATE",
    "DELETE",
    "MERGE",
    "UPSERT",
    // DDL
    "CREATE",
    "ALTER",
    "DROP",
    "TRUNCATE",
    "RENAME",
    // DCL
    "GRANT",
    "REVOKE",
    // Transaction control
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
    // Admin / exec
    "EXEC",
    "EXECUTE",
    "CALL",
    "LOAD",
    "COPY",
    "SHOW",
    "DESCRIBE",
    "EXPLAIN",
    "ANALYZE",
    // File operations
    "INTO OUTFILE",
    "LOAD DATA",
    "SELECT INTO",
];

const ALLOWED_FUNCTIONS: &[&str] = &[
    // Aggregate
    "COUNT",
    "SUM",
    "AVG",
    "MIN",
    "MAX",
    // String
    "UPPER",
    "LOWER",
    "TRIM",
    "LENGTH",
    "SUBSTRING",
    "CONCAT",
    // Date
    "DATE",
    "YEAR",
    "MONTH",
    "DAY",
    "DATE_TRUNC",
    "DATE_ADD",
    "DATE_SUB",
    "EXTRACT",
    "NOW",
    "CURRENT_DATE",
    "CURRENT_TIMESTAMP",
    // Math
    "ROUND",
    "CEIL",
    "FLOOR",
    "ABS",
    "COALESCE",
    "NULLIF",
    // Conditional
    "CASE",
    "IF",
    "IFNULL",
];

const SUSPICIOUS_PATTERNS: &[&str] = &[
    "--", "/*", "*/", ";", "UNION", "OR 1=1", "AND 1=1", "DROP", "DELETE", "UPDATE",
];

/// Score adjustments applied after the structural checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub violation_penalty: f64,
    pub warning_penalty: f64,
    pub read_only_bonus: f64,
    pub limit_bonus: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            violation_penalty: 0.3,
            warning_penalty: 0.1,
            read_only_bonus: 0.2,
            limit_bonus: 0.1,
        }
    }
}

/// Immutable rule set for the SQL safety gate.
///
/// Built once at startup and handed to `SafetyGate::new`. Tests construct
/// variants to exercise thresholds without touching global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Matched case-insensitively as substrings of the raw text.
    pub blocked_keywords: Vec<String>,
    /// Uppercased function names a query may call.
    pub allowed_functions: Vec<String>,
    /// Recorded as warnings only.
    pub suspicious_patterns: Vec<String>,
    pub max_join_tables: usize,
    pub max_row_limit: i64,
    /// Minimum score for `SafetyGate::is_safe`.
    pub min_safety_score: f64,
    pub weights: ScoreWeights,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            blocked_keywords: to_owned(BLOCKED_KEYWORDS),
            allowed_functions: to_owned(ALLOWED_FUNCTIONS),
            suspicious_patterns: to_owned(SUSPICIOUS_PATTERNS),
            max_join_tables: DEFAULT_MAX_JOIN_TABLES,
            max_row_limit: DEFAULT_MAX_ROW_LIMIT,
            min_safety_score: DEFAULT_MIN_SAFETY_SCORE,
            weights: ScoreWeights::default(),
        }
    }
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lists_are_uppercase() {
        let config = GateConfig::default();
        for kw in &config.blocked_keywords {
            assert_eq!(kw, &kw.to_uppercase());
        }
        for f in &config.allowed_functions {
            assert_eq!(f, &f.to_uppercase());
        }
    }

    #[test]
    fn test_default_thresholds() {
        let config = GateConfig::default();
        assert_eq!(config.max_join_tables, 5);
        assert_eq!(config.max_row_limit, 10_000);
        assert!((config.min_safety_score - 0.7).abs() < f64::EPSILON);
        assert!((config.weights.violation_penalty - 0.3).abs() < f64::EPSILON);
    }
}
