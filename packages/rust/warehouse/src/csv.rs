//! CSV encoding for ClickHouse `FORMAT CSV` inserts.
//!
//! Text values are always quoted with embedded quotes doubled; integers are
//! written bare. Rows end with `\n`.

use aspects_shared::{FieldValue, FlatRow};

/// Encode `rows` as one CSV body.
pub fn encode_rows(rows: &[FlatRow]) -> String {
    let mut out = String::new();
    for row in rows {
        for (i, field) in row.fields().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_field(&mut out, field);
        }
        out.push('\n');
    }
    out
}

fn push_field(out: &mut String, field: &FieldValue) {
    match field {
        FieldValue::Int(n) => out.push_str(&n.to_string()),
        FieldValue::Text(s) => {
            out.push('"');
            for ch in s.chars() {
                if ch == '"' {
                    out.push('"');
                }
                out.push(ch);
            }
            out.push('"');
        }
    }
}
