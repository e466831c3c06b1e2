// Retrieval prompt template.
// Section order is fixed: tables, columns, KPIs, glossary, query, instructions.

use std::fmt::Write;

use crate::rag::context_builder::{GlossaryContext, KpiContext, SchemaContext};

pub const SQL_PROMPT_PREAMBLE: &str =
    "You are an expert SQL generator. Convert natural language queries to SQL using the provided schema context.";

pub const SQL_PROMPT_INSTRUCTIONS: &str = "\
INSTRUCTIONS:
1. Generate a SELECT-only SQL query
2. Use only the tables and columns provided above
3. Include appropriate WHERE clauses, JOINs, and aggregations
4. Always include a LIMIT clause
5. Return only the SQL query, no explanations
";

const EMPTY_SECTION: &str = "- none\n";

pub fn build_sql_prompt(
    query: &str,
    schema: &SchemaContext,
    kpis: &[KpiContext],
    glossary: &[GlossaryContext],
) -> String {
    // Writing into a String cannot fail; results are discarded.
    let mut out = String::new();
    let _ = writeln!(out, "{SQL_PROMPT_PREAMBLE}\n");

    out.push_str("AVAILABLE TABLES AND COLUMNS:\n");
    if schema.tables.is_empty() {
        out.push_str(EMPTY_SECTION);
    }
    for table in &schema.tables {
        let _ = writeln!(out, "Table: {}", table.name);
        if let Some(desc) = table.description.as_deref().filter(|d| !d.is_empty()) {
            let _ = writeln!(out, "Description: {desc}");
        }
    }
    for table in schema.tables.iter().filter(|t| !t.columns.is_empty()) {
        let _ = writeln!(out, "\nColumns for {}:", table.name);
        for column in &table.columns {
            match column.data_type.as_deref().filter(|t| !t.is_empty()) {
                Some(ty) => {
                    let _ = writeln!(out, "- {} ({ty})", column.name);
                }
                None => {
                    let _ = writeln!(out, "- {}", column.name);
                }
            }
        }
    }

    out.push_str("\nRELEVANT KPIs:\n");
    if kpis.is_empty() {
        out.push_str(EMPTY_SECTION);
    }
    for kpi in kpis {
        let _ = writeln!(out, "- {}: {}", kpi.name, kpi.description);
    }

    out.push_str("\nBUSINESS TERMS:\n");
    if glossary.is_empty() {
        out.push_str(EMPTY_SECTION);
    }
    for term in glossary {
        let _ = writeln!(out, "- {}: {}", term.term, term.definition);
    }

    let _ = write!(out, "\nQUERY: {query}\n\n");
    out.push_str(SQL_PROMPT_INSTRUCTIONS);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::context_builder::{ColumnContext, TableContext};
    use serde_json::json;

    fn schema() -> SchemaContext {
        SchemaContext {
            tables: vec![
                TableContext {
                    name: "sales".into(),
                    description: Some("Daily sales".into()),
                    score: 0.9,
                    metadata: json!({}),
                    columns: vec![
                        ColumnContext {
                            name: "amount".into(),
                            data_type: Some("numeric".into()),
                            score: 0.8,
                            metadata: json!({}),
                        },
                        ColumnContext {
                            name: "region".into(),
                            data_type: None,
                            score: 0.7,
                            metadata: json!({}),
                        },
                    ],
                },
                TableContext {
                    name: "customers".into(),
                    description: None,
                    score: 0.5,
                    metadata: json!({}),
                    columns: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_sections_in_fixed_order() {
        let kpis = vec![KpiContext {
            name: "revenue".into(),
            description: "Sum of order totals".into(),
            formula: None,
            score: 0.6,
            metadata: json!({}),
        }];
        let glossary = vec![GlossaryContext {
            term: "churn".into(),
            definition: "Customers lost in a period".into(),
            score: 0.4,
            metadata: json!({}),
        }];
        let prompt = build_sql_prompt("total sales by region", &schema(), &kpis, &glossary);

        let order = [
            "AVAILABLE TABLES AND COLUMNS:",
            "Table: sales",
            "Description: Daily sales",
            "Table: customers",
            "Columns for sales:",
            "- amount (numeric)",
            "- region\n",
            "RELEVANT KPIs:",
            "- revenue: Sum of order totals",
            "BUSINESS TERMS:",
            "- churn: Customers lost in a period",
            "QUERY: total sales by region",
            "INSTRUCTIONS:",
        ];
        let mut cursor = 0;
        for marker in order {
            let found = prompt[cursor..]
                .find(marker)
                .unwrap_or_else(|| panic!("missing or out of order: {marker}"));
            cursor += found + marker.len();
        }
        assert!(!prompt.contains("Columns for customers"));
    }

    #[test]
    fn test_empty_sections_still_rendered() {
        let prompt = build_sql_prompt("anything", &SchemaContext::default(), &[], &[]);
        assert!(prompt.starts_with(SQL_PROMPT_PREAMBLE));
        assert_eq!(prompt.matches("- none").count(), 3);
        assert!(prompt.contains("RELEVANT KPIs:"));
        assert!(prompt.contains("BUSINESS TERMS:"));
        assert!(prompt.ends_with(SQL_PROMPT_INSTRUCTIONS));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let a = build_sql_prompt("q", &schema(), &[], &[]);
        let b = build_sql_prompt("q", &schema(), &[], &[]);
        assert_eq!(a, b);
    }
}
