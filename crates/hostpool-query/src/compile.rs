use hostpool_domain::{Op, Query, Term, Value};
use serde_json::{Map, Value as Json};

use crate::error::QueryError;

// ── Pass A: structural parsing of request arguments ───────────────────────────

/// Parse flat request arguments into a nested JSON object.
///
/// Grammar: `key := segment ( ('[' segment ']') | ('.' segment) )*` with at
/// most one bracket level; an empty segment is only legal at the very end and
/// appends to a list:
///
/// `?cpu-model:in[]=41&cpu-model:in[]=42&extra_device[gpu-vendor]=nvidia`
///
/// Repeated identical key/value pairs are idempotent; conflicting values for
/// the same key fail.
pub fn parse_request_args<'a, I>(args: I) -> Result<Json, QueryError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut root = Map::new();
    for (key, value) in args {
        let segments = split_segments(key)?;
        insert_arg(&mut root, key, &segments, value)?;
    }
    Ok(Json::Object(root))
}

fn split_segments(key: &str) -> Result<Vec<String>, QueryError> {
    let mut segments = Vec::new();
    let mut token = String::new();
    let mut depth = 0usize;
    for c in key.chars() {
        match c {
            '[' => {
                if depth > 0 {
                    return Err(QueryError::InvalidQuery(format!(
                        "nested brackets in key '{}'",
                        key
                    )));
                }
                depth += 1;
                if !token.is_empty() {
                    segments.push(std::mem::take(&mut token));
                }
            }
            ']' => {
                if depth == 0 {
                    return Err(QueryError::InvalidQuery(format!(
                        "unbalanced bracket in key '{}'",
                        key
                    )));
                }
                depth -= 1;
                segments.push(std::mem::take(&mut token));
            }
            '.' if depth == 0 => {
                segments.push(std::mem::take(&mut token));
            }
            _ => token.push(c),
        }
    }
    if depth != 0 {
        return Err(QueryError::InvalidQuery(format!(
            "unclosed bracket in key '{}'",
            key
        )));
    }
    if !token.is_empty() {
        segments.push(token);
    }
    if segments.is_empty() || segments[0].is_empty() {
        return Err(QueryError::InvalidQuery(format!(
            "query key '{}' has no root field",
            key
        )));
    }
    if segments[..segments.len() - 1].iter().any(|s| s.is_empty()) {
        return Err(QueryError::InvalidQuery(format!(
            "empty segment before the end of key '{}' (lists of objects are not supported)",
            key
        )));
    }
    Ok(segments)
}

fn insert_arg(
    root: &mut Map<String, Json>,
    key: &str,
    segments: &[String],
    value: &str,
) -> Result<(), QueryError> {
    let mut node = root;
    for pair in segments.windows(2) {
        let (seg, next) = (&pair[0], &pair[1]);
        let wants_list = next.is_empty();
        let entry = node.entry(seg.clone()).or_insert_with(|| {
            if wants_list {
                Json::Array(Vec::new())
            } else {
                Json::Object(Map::new())
            }
        });
        if wants_list {
            let Json::Array(list) = entry else {
                return Err(QueryError::InvalidQuery(format!(
                    "type conflict for '{}': expected a list",
                    key
                )));
            };
            list.push(Json::String(value.to_string()));
            return Ok(());
        }
        let Json::Object(inner) = entry else {
            return Err(QueryError::InvalidQuery(format!(
                "type conflict for '{}': expected an object",
                key
            )));
        };
        node = inner;
    }

    let last = &segments[segments.len() - 1];
    match node.get(last.as_str()) {
        None => {
            node.insert(last.clone(), Json::String(value.to_string()));
            Ok(())
        }
        Some(Json::String(existing)) if existing == value => Ok(()),
        Some(existing) => Err(QueryError::InvalidQuery(format!(
            "value conflict for '{}': '{}' vs '{}'",
            key, existing, value
        ))),
    }
}

// ── Pass B: operator splitting ────────────────────────────────────────────────

/// Rewrite `<name>:<op>` leaf keys of a nested argument object into
/// `{$op: value}` maps, at every nesting level, and produce the query. Bare
/// values stay bare; sanitisation decides later whether they must be wrapped
/// in `$eq`.
pub fn parse_query(args: &Json) -> Result<Query, QueryError> {
    if !args.is_object() {
        return Err(QueryError::InvalidQuery(
            "root query object must be a mapping".to_string(),
        ));
    }
    let rewritten = rewrite_op_keys(args)?;
    serde_json::from_value(rewritten)
        .map_err(|e| QueryError::InvalidQuery(format!("malformed query: {}", e)))
}

/// Compile a JSON request body (already nested) straight into a query.
pub fn parse_json_query(body: &Json) -> Result<Query, QueryError> {
    parse_query(body)
}

fn rewrite_op_keys(json: &Json) -> Result<Json, QueryError> {
    let Json::Object(map) = json else {
        return Ok(json.clone());
    };
    let mut out = Map::new();
    for (key, raw) in map {
        let value = rewrite_op_keys(raw)?;
        match key.rsplit_once(':') {
            Some((field, suffix)) => {
                let op = Op::from_suffix(suffix).ok_or_else(|| {
                    QueryError::InvalidQuery(format!("unknown operator '{}' in '{}'", suffix, key))
                })?;
                let entry = out
                    .entry(field.to_string())
                    .or_insert_with(|| Json::Object(Map::new()));
                let Json::Object(ops) = entry else {
                    return Err(QueryError::InvalidQuery(format!(
                        "query conflict: '{}' given both a plain value and an operator",
                        field
                    )));
                };
                ops.insert(op.to_string(), value);
            }
            None => {
                if out.contains_key(key) {
                    return Err(QueryError::InvalidQuery(format!(
                        "query conflict: '{}' given both a plain value and an operator",
                        key
                    )));
                }
                out.insert(key.clone(), value);
            }
        }
    }
    Ok(Json::Object(out))
}

// ── Render: the inverse of compilation ────────────────────────────────────────

/// Render a query back into flat request arguments. `parse_request_args` +
/// `parse_query` over the result reproduces the query.
pub fn render(query: &Query) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (field, term) in query.iter() {
        match term {
            Term::Value(v) => render_value(&mut out, field, v),
            Term::Ops(ops) => {
                for (op, v) in ops {
                    render_value(&mut out, &format!("{}:{}", field, op.suffix()), v);
                }
            }
        }
    }
    out
}

fn render_value(out: &mut Vec<(String, String)>, key: &str, value: &Value) {
    match value {
        Value::StrList(items) => {
            for item in items {
                out.push((format!("{}[]", key), item.clone()));
            }
        }
        Value::Map(inner) => {
            for (sub, v) in inner {
                render_value(out, &format!("{}[{}]", key, sub), v);
            }
        }
        other => out.push((key.to_string(), other.to_string())),
    }
}

// ── Flatten: simplify lone `$eq` terms ────────────────────────────────────────

/// Replace `{$eq: v}` terms with the bare value. With `force`, any remaining
/// operator term is an error (for consumers that only accept plain values).
pub fn flatten(query: &mut Query, force: bool) -> Result<(), QueryError> {
    for (field, term) in query.0.iter_mut() {
        let lone_eq = match term {
            Term::Ops(ops) if ops.len() == 1 => ops.get(&Op::Eq).cloned(),
            _ => None,
        };
        if let Some(v) = lone_eq {
            *term = Term::Value(v);
        } else if force && matches!(term, Term::Ops(_)) {
            return Err(QueryError::Validate(format!(
                "'{}' only accepts a plain value",
                field
            )));
        }
    }
    Ok(())
}
