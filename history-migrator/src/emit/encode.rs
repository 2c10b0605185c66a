use super::DestinationRecord;

/// Escapes a label value for the exposition format. Backslash goes first so the
/// escapes introduced for quotes and newlines are not escaped again.
pub fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

pub fn decode_label_value(escaped: &str) -> String {
    let mut decoded = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            decoded.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => decoded.push('\n'),
            Some(other) => decoded.push(other),
            None => decoded.push('\\'),
        }
    }
    decoded
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else {
        value.to_string()
    }
}

/// `name{k1="v1",k2="v2"} value timestamp_ms`. Labels come out in key order
/// because they are held in a `BTreeMap`.
pub fn encode_line(record: &DestinationRecord) -> String {
    let mut line = String::with_capacity(64 + record.labels.len() * 32);
    line.push_str(&record.metric_name);

    if !record.labels.is_empty() {
        line.push('{');
        for (i, (key, value)) in record.labels.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(key);
            line.push_str("=\"");
            line.push_str(&escape_label_value(value));
            line.push('"');
        }
        line.push('}');
    }

    line.push(' ');
    line.push_str(&format_value(record.value));
    line.push(' ');
    line.push_str(&record.timestamp_ms.to_string());
    line
}

pub fn encode_batch(records: &[DestinationRecord]) -> String {
    records
        .iter()
        .map(encode_line)
        .collect::<Vec<_>>()
        .join("\n")
}
