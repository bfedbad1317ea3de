//! Numeric fidelity of narrated answers.
//!
//! Narration stages only rephrase results that were already computed. Every
//! number a narration quotes has to trace back to the evidence it was given
//! (result rows, code output, the question itself), allowing for rounding to
//! the precision the narration states and for common unit rescaling
//! (mm to m, mV to V, m/s to km/h, fractions to percent).

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Scale factors accepted between an evidence value and a quoted one.
const UNIT_SCALES: [f64; 6] = [1.0, 10.0, 100.0, 1000.0, 1_000_000.0, 3.6];

/// Small integers are ordinals and counts in prose ("the 2 tables").
const IGNORED_INTEGER_MAX: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Quoted {
    value: f64,
    decimals: i32,
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("valid number regex")
    })
}

fn quoted_numbers(text: &str) -> Vec<(&str, Quoted)> {
    number_pattern()
        .find_iter(text)
        .filter_map(|m| {
            let literal = m.as_str().replace(',', "");
            let value: f64 = literal.parse().ok()?;
            let decimals = if literal.contains(['e', 'E']) {
                0
            } else {
                literal.split_once('.').map_or(0, |(_, frac)| frac.len() as i32)
            };
            Some((m.as_str(), Quoted { value, decimals }))
        })
        .collect()
}

fn numbers_in(text: &str) -> Vec<Quoted> {
    quoted_numbers(text).into_iter().map(|(_, q)| q).collect()
}

fn is_supported(quoted: &Quoted, evidence: &[f64]) -> bool {
    let tolerance = 0.5 * 10f64.powi(-quoted.decimals) + 1e-9;
    evidence.iter().any(|&e| {
        UNIT_SCALES
            .iter()
            .any(|&s| (quoted.value - e * s).abs() <= tolerance || (quoted.value - e / s).abs() <= tolerance)
    })
}

/// Numbers quoted in `narration` that no evidence value accounts for.
pub fn unsupported_numbers(narration: &str, evidence: &[&str]) -> Vec<String> {
    let known: Vec<f64> = evidence
        .iter()
        .flat_map(|text| numbers_in(text))
        .map(|q| q.value)
        .collect();

    quoted_numbers(narration)
        .into_iter()
        .filter(|(_, quoted)| !(quoted.decimals == 0 && quoted.value <= IGNORED_INTEGER_MAX))
        .filter(|(_, quoted)| !is_supported(quoted, &known))
        .map(|(literal, _)| literal.to_string())
        .collect()
}

/// Returns the narration unchanged when every quoted number is backed by
/// evidence; otherwise appends the computed result verbatim so the user
/// always sees the authoritative figures.
pub fn enforce(stage: &'static str, narration: String, evidence: &[&str], computed: &str) -> String {
    let unsupported = unsupported_numbers(&narration, evidence);
    if unsupported.is_empty() {
        return narration;
    }
    warn!(stage, unsupported = ?unsupported, "Narration quotes numbers not found in the computed result");
    format!("{}\n\nComputed result:\n{}", narration.trim_end(), computed.trim())
}
