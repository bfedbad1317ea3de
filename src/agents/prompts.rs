//! Prompt text and context rendering shared by the agents.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::models::{Exchange, Role};
use crate::types::LLMMessage;

/// Upper bound on the flight-data hint forwarded from the client.
const FLIGHT_HINT_MAX_CHARS: usize = 2000;

pub const CLASSIFIER_SYSTEM: &str = r#"You route questions for a UAV flight log assistant. The user has uploaded a flight log that is stored as SQL tables (one table per telemetry message type, e.g. GLOBAL_POSITION_INT, SYS_STATUS, VFR_HUD, ATTITUDE, HEARTBEAT).

Reply with exactly one word:
SQL - the question asks for values that can be read or aggregated directly from the tables (maximum altitude, flight duration, average speed, when the battery dropped below a level, how many mode changes).
ANALYSIS - the question needs statistics, correlation, anomaly detection, trend fitting or another multi-step computation over the data.
NONE - the question is not about this flight's data (greetings, general knowledge, anything else).

Answer with SQL, ANALYSIS or NONE and nothing else."#;

pub const SQL_SYSTEM: &str = r#"You are a SQL query generation expert for UAV flight data analysis. You convert natural language questions into SQLite queries over the tables described below.

Guidelines:
1. Do not ask for clarification. Make logical assumptions about the user's intent.
2. Assume the user is asking about the entire flight unless they say otherwise.
3. Only generate a single SELECT statement (WITH ... SELECT is fine). Never generate INSERT, UPDATE, DELETE, DROP or PRAGMA.
4. Only use tables and columns listed in the schema. Use table aliases for clarity.
5. Use aggregate functions (COUNT, AVG, MAX, MIN, SUM) when appropriate.
6. Respect the units given in the table descriptions; do not convert units in SQL.
7. Wrap the statement in a single ```sql code fence with no extra prose.

Examples:
Q: "What was the maximum altitude?"
A: ```sql
SELECT MAX(alt) AS max_alt FROM GLOBAL_POSITION_INT;
```

Q: "Show me the battery voltage over time"
A: ```sql
SELECT time_boot_ms, voltage_battery FROM SYS_STATUS ORDER BY time_boot_ms;
```"#;

pub const EXTRACTION_GUIDELINES: &str = r#"The rows you select will be loaded into a pandas DataFrame for further analysis, so:
- select the raw per-sample rows the analysis needs, not aggregates;
- include a time column (time_boot_ms, time_usec or similar) when the analysis is about change over time;
- select only the columns the analysis needs;
- when the columns live in different tables, join them on their time column."#;

pub const CLARIFICATION_SYSTEM: &str = r#"You are a SQL query expert. Decide whether a question about a UAV flight log needs clarification before a query can be written.

Only ask for clarification when the question cannot be answered with reasonable defaults. If no time period is given, assume the entire flight. Questions about specific flight parameters, statistics, trends, events or comparisons do not need clarification.

If no clarification is needed, reply with exactly: null
Otherwise reply with the single clarifying question to ask the user."#;

pub const SUMMARY_SYSTEM: &str = r#"You are a UAV flight data expert. Answer the user's question from the SQL query results provided.

Rules:
- Quote numbers exactly as they appear in the results. Do not recompute, re-round or estimate values.
- Use the units given in the table descriptions. If you state a value in another unit, also give the value as it appears in the results.
- Keep the answer short and direct."#;

pub const CODE_SYSTEM: &str = r#"You write Python analysis code for UAV flight data.

A pandas DataFrame named `df` is already loaded with the extracted rows and pandas is imported as `pd`. You may import only: pandas, numpy, scipy, sklearn, math, statistics, json, collections, itertools, datetime. There is no network access.

Rules:
- Do not import any other module. Do not open, read or write files. Do not use eval, exec or dunder attributes.
- Print every result the answer needs with print(), labelled, for example print("correlation:", r).
- Keep the output short: print statistics, not whole DataFrames.
- Reply with a single ```python code fence and no extra prose."#;

pub const REASONING_SYSTEM: &str = r#"You are a UAV flight data analyst. Explain the result of an analysis to the user.

Rules:
- The numbers in the analysis output are authoritative. Quote them exactly as printed; do not recompute, round differently or invent values.
- Interpret what the numbers mean for this flight (strength of a relationship, whether something is anomalous, what likely caused it).
- Mention caveats briefly when the data is small or the relationship is weak.
- Answer in a few short paragraphs."#;

/// Conversation history as completion messages, oldest first.
pub fn render_context(exchanges: &[Exchange]) -> Vec<LLMMessage> {
    exchanges
        .iter()
        .map(|exchange| match exchange.role {
            Role::User => LLMMessage::user(exchange.text.clone()),
            Role::Assistant => LLMMessage::assistant(exchange.text.clone()),
        })
        .collect()
}

/// Client-supplied flight context (current mode, selected time range, ...)
/// rendered as a bounded text block. Never interpreted.
pub fn render_flight_hint(flight_data: &Value) -> Option<String> {
    if flight_data.is_null() {
        return None;
    }
    let text = match flight_data {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= FLIGHT_HINT_MAX_CHARS {
        return Some(text);
    }
    let mut truncated: String = text.chars().take(FLIGHT_HINT_MAX_CHARS).collect();
    truncated.push_str("...");
    Some(truncated)
}

fn code_fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n?(.*?)```").expect("valid fence regex"))
}

/// Body of the first fenced block tagged `lang`, else of the first fenced
/// block, else the whole reply.
pub fn extract_code_block(raw: &str, lang: &str) -> String {
    let blocks: Vec<(String, String)> = code_fence_pattern()
        .captures_iter(raw)
        .map(|c| (c[1].to_lowercase(), c[2].trim().to_string()))
        .collect();

    blocks
        .iter()
        .find(|(tag, _)| tag == lang)
        .or_else(|| blocks.first())
        .map(|(_, body)| body.clone())
        .unwrap_or_else(|| raw.trim().trim_matches('`').trim().to_string())
}

/// Appends the client hint to a task prompt when one was supplied.
pub fn with_flight_hint(task: String, flight_hint: Option<&str>) -> String {
    match flight_hint {
        Some(hint) => format!("{task}\n\nContext from the flight viewer: {hint}"),
        None => task,
    }
}
