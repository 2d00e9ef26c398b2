use crate::adapters::Row;
use once_cell::sync::Lazy;
use regex::Regex;

static LIKELY_VALUE_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(result|count|total|sum|value|amount|revenue|sales|orders|balance|qty|rental)")
        .expect("value column pattern")
});

static LIKELY_CATEGORY_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(location|site|city|name|branch|warehouse)").expect("category column pattern")
});

/// Picks one numeric value out of a result row.
///
/// Preference order: a column whose value is already numeric (likely-named
/// ones first), then likely-named columns whose text parses as a number, then
/// any column that parses. `None` means nothing parsed — distinct from a
/// legitimate `Some(0.0)` so the caller can classify it as a failure.
pub fn extract_single(row: &Row) -> Option<f64> {
    extract_single_excluding(row, None)
}

fn extract_single_excluding(row: &Row, exclude: Option<&str>) -> Option<f64> {
    let candidates: Vec<(&String, &serde_json::Value)> = row
        .iter()
        .filter(|(name, _)| exclude != Some(name.as_str()))
        .collect();

    let numeric: Vec<(&str, f64)> = candidates
        .iter()
        .filter_map(|(name, value)| value.as_f64().map(|number| (name.as_str(), number)))
        .collect();
    if let Some((_, number)) = numeric
        .iter()
        .find(|(name, _)| LIKELY_VALUE_COLUMN.is_match(name))
    {
        return Some(*number);
    }
    if let Some((_, number)) = numeric.first() {
        return Some(*number);
    }

    for (name, value) in &candidates {
        if LIKELY_VALUE_COLUMN.is_match(name) {
            if let Some(number) = value.as_str().and_then(parse_numeric_text) {
                return Some(number);
            }
        }
    }

    for (_, value) in &candidates {
        if let Some(number) = value.as_str().and_then(parse_numeric_text) {
            return Some(number);
        }
    }

    None
}

/// Multi-row extraction for the site-breakdown chart: one (category, value)
/// pair per row. Rows without a usable category or value are skipped with a
/// warning rather than failing the batch.
pub fn extract_aggregated(rows: &[Row]) -> Vec<(String, f64)> {
    let mut pairs = Vec::with_capacity(rows.len());
    for row in rows {
        let Some((category_column, category)) = pick_category(row) else {
            tracing::warn!("aggregated row has no category column, skipping");
            continue;
        };
        let Some(value) = extract_single_excluding(row, Some(category_column.as_str())) else {
            tracing::warn!(category = %category, "aggregated row has no numeric value, skipping");
            continue;
        };
        pairs.push((category, value));
    }
    pairs
}

fn pick_category(row: &Row) -> Option<(String, String)> {
    if let Some((name, value)) = row
        .iter()
        .find(|(name, value)| LIKELY_CATEGORY_COLUMN.is_match(name) && value.is_string())
    {
        return Some((name.clone(), value.as_str().unwrap_or_default().to_string()));
    }
    row.iter()
        .find(|(_, value)| value.is_string())
        .map(|(name, value)| (name.clone(), value.as_str().unwrap_or_default().to_string()))
}

/// Coerces display-formatted text ("$1,234.56", "12%", " 42 ") to a number.
pub fn parse_numeric_text(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | '%') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(entries: &[(&str, serde_json::Value)]) -> Row {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn prefers_numeric_columns_with_likely_names() {
        let row = row(&[
            ("period", serde_json::json!(8)),
            ("result", serde_json::json!(1250.5)),
        ]);
        assert_eq!(extract_single(&row), Some(1250.5));
    }

    #[test]
    fn falls_back_to_any_numeric_column() {
        let row = row(&[("weird_col", serde_json::json!(7))]);
        assert_eq!(extract_single(&row), Some(7.0));
    }

    #[test]
    fn parses_formatted_text_values() {
        let row1 = row(&[("total_amount", serde_json::json!("$1,234.56"))]);
        assert_eq!(extract_single(&row1), Some(1234.56));

        let row2 = row(&[("margin", serde_json::json!("12.5%"))]);
        assert_eq!(extract_single(&row2), Some(12.5));
    }

    #[test]
    fn zero_is_a_value_and_garbage_is_not() {
        let zero = row(&[("result", serde_json::json!(0))]);
        assert_eq!(extract_single(&zero), Some(0.0));

        let garbage = row(&[("notes", serde_json::json!("n/a"))]);
        assert_eq!(extract_single(&garbage), None);
    }

    #[test]
    fn aggregated_pairs_category_with_value() {
        let rows = vec![
            row(&[
                ("location_name", serde_json::json!("Columbus")),
                ("sales", serde_json::json!(40)),
            ]),
            row(&[
                ("location_name", serde_json::json!("Addison")),
                ("sales", serde_json::json!(25)),
            ]),
        ];
        assert_eq!(
            extract_aggregated(&rows),
            vec![("Columbus".to_string(), 40.0), ("Addison".to_string(), 25.0)]
        );
    }

    #[test]
    fn aggregated_excludes_the_category_column_from_value_selection() {
        // "branch_name" matches the category pattern; "city_count" matches
        // both patterns but must still be usable as the value.
        let rows = vec![row(&[
            ("branch_name", serde_json::json!("Columbus")),
            ("city_count", serde_json::json!(3)),
        ])];
        assert_eq!(extract_aggregated(&rows), vec![("Columbus".to_string(), 3.0)]);
    }

    #[test]
    fn aggregated_falls_back_to_first_string_column() {
        let rows = vec![row(&[
            ("descriptor", serde_json::json!("East")),
            ("total", serde_json::json!(9)),
        ])];
        assert_eq!(extract_aggregated(&rows), vec![("East".to_string(), 9.0)]);
    }
}
