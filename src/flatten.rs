// src/flatten.rs

use serde_json::{Map, Value};

/// Flatten a nested extraction result into one row.
///
/// Nested objects become `parent_child` keys, the `items` list fans out
/// into `item_{n}_{field}` columns (1-based), and any other list is kept
/// as its JSON text under its own key. Key order follows the input.
pub fn flatten(data: &Map<String, Value>) -> Map<String, Value> {
    let mut row = Map::new();
    flatten_into(&mut row, "", data);
    row
}

fn flatten_into(row: &mut Map<String, Value>, prefix: &str, data: &Map<String, Value>) {
    for (key, value) in data {
        let full_key = join_key(prefix, key);
        match value {
            Value::Object(nested) => flatten_into(row, &full_key, nested),
            Value::Array(items) if key == "items" => expand_items(row, prefix, items),
            Value::Array(_) => {
                row.insert(full_key, Value::String(value.to_string()));
            }
            scalar => {
                row.insert(full_key, scalar.clone());
            }
        }
    }
}

fn expand_items(row: &mut Map<String, Value>, prefix: &str, items: &[Value]) {
    for (i, item) in items.iter().enumerate() {
        let item_key = join_key(prefix, &format!("item_{}", i + 1));
        match item {
            Value::Object(fields) => {
                for (field, value) in fields {
                    let cell = match value {
                        Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
                        scalar => scalar.clone(),
                    };
                    row.insert(format!("{item_key}_{field}"), cell);
                }
            }
            other => {
                row.insert(item_key, other.clone());
            }
        }
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}_{key}")
    }
}

/// Text for one CSV cell: strings verbatim, null empty, the rest as JSON.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a flattened row as a two-line CSV document (header + values).
pub fn to_csv(row: &Map<String, Value>) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(row.keys())?;
    writer.write_record(row.values().map(cell_text))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
