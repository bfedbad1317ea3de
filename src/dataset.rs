use serde::Serialize;
use serde_json::Value;

use crate::store::QueryResult;

/// Rows pulled by the extraction stage, handed to the code sandbox as-is.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptiveStat {
    pub column: String,
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub median: f64,
    pub max: f64,
}

impl From<QueryResult> for Dataset {
    fn from(result: QueryResult) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows,
        }
    }
}

impl Dataset {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// JSON type name per column from the first non-null value.
    pub fn column_types(&self) -> Vec<&'static str> {
        (0..self.columns.len())
            .map(|idx| {
                self.rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .find(|v| !v.is_null())
                    .map(|v| match v {
                        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
                        Value::Number(_) => "float",
                        Value::Bool(_) => "boolean",
                        _ => "text",
                    })
                    .unwrap_or("null")
            })
            .collect()
    }

    pub fn numeric_column(&self, idx: usize) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(Value::as_f64))
            .collect()
    }

    pub fn describe(&self) -> Vec<DescriptiveStat> {
        let mut stats = Vec::new();
        for (idx, column) in self.columns.iter().enumerate() {
            let mut col = self.numeric_column(idx);
            if col.is_empty() {
                continue;
            }
            col.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let count = col.len();
            let mean = col.iter().sum::<f64>() / count as f64;
            let median = if count % 2 == 0 {
                (col[count / 2 - 1] + col[count / 2]) / 2.0
            } else {
                col[count / 2]
            };
            stats.push(DescriptiveStat {
                column: column.clone(),
                count,
                mean,
                std_dev: std_dev(&col, mean),
                min: col[0],
                median,
                max: col[count - 1],
            });
        }
        stats
    }

    /// Column names, types, row count and the first `sample_rows` rows.
    pub fn render_shape(&self, sample_rows: usize) -> String {
        let columns = self
            .columns
            .iter()
            .zip(self.column_types())
            .map(|(name, ty)| format!("{name} ({ty})"))
            .collect::<Vec<_>>()
            .join(", ");
        let sample = self
            .rows
            .iter()
            .take(sample_rows)
            .map(|row| Value::Array(row.clone()).to_string())
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Columns: {columns}\nRow count: {}\nSample rows:\n{sample}",
            self.row_count()
        )
    }

    /// One line per numeric column.
    pub fn render_summary(&self) -> String {
        let stats = self.describe();
        if stats.is_empty() {
            return format!("{} rows, no numeric columns", self.row_count());
        }
        let mut lines = vec![format!("{} rows", self.row_count())];
        lines.extend(stats.iter().map(|s| {
            format!(
                "{}: count={} mean={:.4} std={:.4} min={} median={} max={}",
                s.column, s.count, s.mean, s.std_dev, s.min, s.median, s.max
            )
        }));
        lines.join("\n")
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "columns": self.columns, "rows": self.rows })
    }
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0);
    variance.sqrt()
}
