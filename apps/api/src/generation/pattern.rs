//! Keyword-driven SQL generator. Deterministic and offline; the default
//! when no LLM key is configured.

use async_trait::async_trait;

use crate::rag::context_builder::{QueryContext, TableContext};

use super::{normalize_sql, GenerationError, SqlGenerator};

const FALLBACK_TABLE: &str = "sales";
const FALLBACK_MEASURE: &str = "amount";
const AGGREGATE_LIMIT: u32 = 1000;
const BROWSE_LIMIT: u32 = 100;

const SUM_WORDS: &[&str] = &["sales", "revenue", "total"];
const COUNT_WORDS: &[&str] = &["count", "number", "how many"];
const AVG_WORDS: &[&str] = &["average", "avg", "mean"];
const AGGREGATE_HINTS: &[&str] = &["sum", "total", "aggregate"];
const NUMERIC_TYPES: &[&str] = &[
    "int", "numeric", "decimal", "float", "double", "real", "money",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct PatternSqlGenerator;

fn mentions(text: &str, words: &[&str]) -> bool {
    let text = text.to_lowercase();
    words.iter().any(|w| text.contains(&w.to_lowercase()))
}

/// Lowercase identifier with anything but `[a-z0-9_]` replaced by `_`.
fn identifier(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn top_table(context: &QueryContext) -> Option<&TableContext> {
    context.schema_context.tables.first()
}

fn measure_column(table: Option<&TableContext>) -> String {
    table
        .and_then(|t| {
            t.columns.iter().find(|c| {
                c.data_type
                    .as_deref()
                    .is_some_and(|ty| mentions(ty, NUMERIC_TYPES))
            })
        })
        .map(|c| c.name.clone())
        .unwrap_or_else(|| FALLBACK_MEASURE.to_string())
}

fn with_limit(formula: &str) -> String {
    let formula = formula.trim().trim_end_matches(';').trim_end();
    if formula.to_lowercase().contains(" limit ") {
        formula.to_string()
    } else {
        format!("{formula} LIMIT {AGGREGATE_LIMIT}")
    }
}

impl PatternSqlGenerator {
    /// Picks the first matching rule: KPI formula, glossary aggregate, then
    /// fixed keyword patterns over the best retrieved table.
    pub fn candidate(&self, query: &str, context: &QueryContext) -> String {
        let lower = query.to_lowercase();

        for kpi in &context.kpi_context {
            if lower.contains(&kpi.name.to_lowercase()) {
                if let Some(formula) = kpi.formula.as_deref().filter(|f| !f.trim().is_empty()) {
                    return with_limit(formula);
                }
            }
        }

        let table = top_table(context);
        let table_name = table
            .map(|t| t.name.clone())
            .unwrap_or_else(|| FALLBACK_TABLE.to_string());

        for term in &context.glossary_context {
            if lower.contains(&term.term.to_lowercase()) && mentions(&term.definition, AGGREGATE_HINTS)
            {
                return format!(
                    "SELECT SUM({}) AS total FROM {table_name} LIMIT {AGGREGATE_LIMIT}",
                    identifier(&term.term)
                );
            }
        }

        let measure = measure_column(table);
        if mentions(query, SUM_WORDS) {
            return format!(
                "SELECT SUM({measure}) AS total_{measure} FROM {table_name} LIMIT {AGGREGATE_LIMIT}"
            );
        }
        if mentions(query, COUNT_WORDS) {
            return format!(
                "SELECT COUNT(*) AS total_count FROM {table_name} LIMIT {AGGREGATE_LIMIT}"
            );
        }
        if mentions(query, AVG_WORDS) {
            return format!(
                "SELECT AVG({measure}) AS average_{measure} FROM {table_name} LIMIT {AGGREGATE_LIMIT}"
            );
        }
        format!("SELECT * FROM {table_name} LIMIT {BROWSE_LIMIT}")
    }
}

#[async_trait]
impl SqlGenerator for PatternSqlGenerator {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn generate(&self, query: &str, context: &QueryContext) -> Result<String, GenerationError> {
        normalize_sql(&self.candidate(query, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::context_builder::{
        ColumnContext, GlossaryContext, KpiContext, SchemaContext,
    };
    use serde_json::json;

    fn context(tables: Vec<TableContext>, kpis: Vec<KpiContext>, terms: Vec<GlossaryContext>) -> QueryContext {
        QueryContext {
            query: String::new(),
            data_source_id: 1,
            schema_context: SchemaContext { tables },
            kpi_context: kpis,
            glossary_context: terms,
            prompt: String::new(),
            degraded: Vec::new(),
        }
    }

    fn orders_table() -> TableContext {
        TableContext {
            name: "orders".into(),
            description: None,
            score: 0.9,
            metadata: json!({}),
            columns: vec![
                ColumnContext {
                    name: "region".into(),
                    data_type: Some("text".into()),
                    score: 0.5,
                    metadata: json!({}),
                },
                ColumnContext {
                    name: "order_total".into(),
                    data_type: Some("numeric".into()),
                    score: 0.4,
                    metadata: json!({}),
                },
            ],
        }
    }

    #[test]
    fn test_kpi_formula_wins() {
        let kpi = KpiContext {
            name: "Revenue".into(),
            description: String::new(),
            formula: Some("SELECT SUM(amount) AS revenue FROM sales;".into()),
            score: 0.8,
            metadata: json!({}),
        };
        let ctx = context(vec![orders_table()], vec![kpi], vec![]);
        assert_eq!(
            PatternSqlGenerator.candidate("show revenue by month", &ctx),
            "SELECT SUM(amount) AS revenue FROM sales LIMIT 1000"
        );
    }

    #[test]
    fn test_glossary_aggregate_hint() {
        let term = GlossaryContext {
            term: "Gross Margin".into(),
            definition: "Total revenue minus cost".into(),
            score: 0.7,
            metadata: json!({}),
        };
        let ctx = context(vec![orders_table()], vec![], vec![term]);
        assert_eq!(
            PatternSqlGenerator.candidate("gross margin this year", &ctx),
            "SELECT SUM(gross_margin) AS total FROM orders LIMIT 1000"
        );
    }

    #[test]
    fn test_keyword_patterns_use_top_table() {
        let ctx = context(vec![orders_table()], vec![], vec![]);
        let gen = PatternSqlGenerator;
        assert_eq!(
            gen.candidate("total sales last week", &ctx),
            "SELECT SUM(order_total) AS total_order_total FROM orders LIMIT 1000"
        );
        assert_eq!(
            gen.candidate("how many orders", &ctx),
            "SELECT COUNT(*) AS total_count FROM orders LIMIT 1000"
        );
        assert_eq!(
            gen.candidate("avg order size", &ctx),
            "SELECT AVG(order_total) AS average_order_total FROM orders LIMIT 1000"
        );
        assert_eq!(gen.candidate("list orders", &ctx), "SELECT * FROM orders LIMIT 100");
    }

    #[test]
    fn test_falls_back_to_sales_without_context() {
        let ctx = context(vec![], vec![], vec![]);
        assert_eq!(
            PatternSqlGenerator.candidate("revenue", &ctx),
            "SELECT SUM(amount) AS total_amount FROM sales LIMIT 1000"
        );
        assert_eq!(
            PatternSqlGenerator.candidate("show me everything", &ctx),
            "SELECT * FROM sales LIMIT 100"
        );
    }
}
