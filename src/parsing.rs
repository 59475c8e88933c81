use serde_json::Value;

/// Pulls a JSON object out of a model reply: bare, fenced, or embedded in prose.
///
/// For the embedded case only an object mentioning `key` is accepted.
pub(crate) fn extract_json_object(content: &str, key: &str) -> Option<Value> {
    if let Some(value) = parse_object(content.trim()) {
        return Some(value);
    }

    if let Some(value) = extract_fenced_block(content).and_then(|body| parse_object(&body)) {
        return Some(value);
    }

    extract_from_mixed_content(content, key).and_then(|candidate| parse_object(&candidate))
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn extract_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

// Quote/escape-aware scan for the last complete top-level object.
fn extract_from_mixed_content(content: &str, key: &str) -> Option<String> {
    let bytes = content.as_bytes();
    let mut start_pos = None;
    let mut end_pos = None;
    let mut depth: i32 = 0;

    let mut in_str = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        } else if b == b'"' {
            in_str = true;
            continue;
        }

        match b {
            b'{' => {
                if depth == 0 {
                    start_pos = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 && start_pos.is_some() {
                        end_pos = Some(i + 1);
                    }
                }
            }
            _ => {}
        }
    }

    let (s, e) = (start_pos?, end_pos?);
    if s >= e {
        return None;
    }
    let candidate = &content[s..e];
    candidate
        .contains(&format!("\"{key}\""))
        .then(|| candidate.to_string())
}
