//! SQL literal encoding for exported rows.

use dbkit_core::driver::{Dialect, Value};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Encodes one column value as a SQL literal.
///
/// Bytes and text containing a control byte other than `\n`, `\r` or `\t`
/// become hex literals; everything else textual is an escaped quoted string.
pub fn encode_value(value: &Value, dialect: &dyn Dialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => dialect.bool_literal(*b).to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Decimal(d) => d.clone(),
        Value::Text(s) => encode_bytes(s.as_bytes(), dialect),
        Value::Bytes(b) => encode_bytes(b, dialect),
        Value::Date(d) => dialect.quote_string(&d.format(DATE_FORMAT).to_string()),
        Value::Timestamp(ts) => dialect.quote_string(&ts.format(TIMESTAMP_FORMAT).to_string()),
    }
}

fn encode_bytes(bytes: &[u8], dialect: &dyn Dialect) -> String {
    if needs_hex(bytes) {
        return dialect.hex_literal(bytes);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => dialect.quote_string(text),
        Err(_) => dialect.hex_literal(bytes),
    }
}

fn needs_hex(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .any(|&b| (b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t')) || b == 0x7f)
}

/// Renders a row as `(v1, v2, ...)`.
pub fn encode_row(row: &[Value], dialect: &dyn Dialect) -> String {
    let mut out = String::with_capacity(row.len() * 8 + 2);
    out.push('(');
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&encode_value(value, dialect));
    }
    out.push(')');
    out
}
