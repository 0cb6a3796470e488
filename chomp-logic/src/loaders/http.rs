use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Acquired, Loader};
use crate::{
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    model::Params,
    transform::Payload,
    vitals::VitalsTimer,
};

/// One GET per distinct target per tick; field-level target overrides
/// deduplicate. The body is decoded as JSON when the content type says so
/// or the first non-whitespace byte is `{`/`[`, as UTF-8 text otherwise.
pub struct HttpLoader;

#[async_trait]
impl Loader for HttpLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        let targets = ci.spec.distinct_targets();
        if targets.is_empty() {
            return Err(LoadError::Payload(format!(
                "{} declares no target",
                ci.spec.name
            )));
        }

        let timer = VitalsTimer::start();
        let mut total_bytes = 0u64;
        let mut last_status = 0u16;
        let mut by_target: BTreeMap<String, Box<Payload>> = BTreeMap::new();

        for target in &targets {
            let (payload, bytes, status) = fetch(ctx, ci, target).await?;
            total_bytes += bytes;
            last_status = status;
            by_target.insert(target.to_string(), Box::new(payload));
        }

        let payload = if by_target.len() == 1 {
            *by_target.into_values().next().unwrap()
        } else {
            Payload::ByTarget(by_target)
        };

        let vitals = timer.stop(total_bytes, last_status, ci.spec.fields.len() as u32);
        Ok(Acquired { payload, vitals })
    }
}

async fn fetch(
    ctx: &Context,
    ci: &CompiledIngester,
    target: &str,
) -> Result<(Payload, u64, u16), LoadError> {
    // field-level headers/params override the parent's for their target
    let field = ci
        .spec
        .fields
        .iter()
        .find(|f| f.target.as_deref() == Some(target));
    let headers = field.map(|f| &f.headers).unwrap_or(&ci.spec.headers);
    let params = field.map(|f| &f.params).unwrap_or(&ci.spec.params);

    let mut request = ctx.http.get(target);
    for (key, value) in headers {
        request = request.header(key, value);
    }
    if let Params::Map(params) = params {
        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();
        request = request.query(&query);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    if !response.status().is_success() {
        return Err(LoadError::Status {
            status,
            url: target.to_string(),
        });
    }

    let json_content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let body = response.text().await?;
    let bytes = body.len() as u64;

    let payload = decode_body(&body, json_content_type);
    let payload = apply_pre_transformer(ctx, ci, payload)?;
    Ok((payload, bytes, status))
}

fn decode_body(body: &str, json_content_type: bool) -> Payload {
    let looks_like_json = body
        .trim_start()
        .starts_with(['{', '[']);
    if json_content_type || looks_like_json {
        match serde_json::from_str(body) {
            Ok(doc) => return Payload::Json(doc),
            Err(_) => {}
        }
    }
    // scalar JSON bodies still parse when the content type is explicit
    if json_content_type {
        if let Ok(doc) = serde_json::from_str(body) {
            return Payload::Json(doc);
        }
    }
    Payload::Text(body.to_string())
}

fn apply_pre_transformer(
    ctx: &Context,
    ci: &CompiledIngester,
    payload: Payload,
) -> Result<Payload, LoadError> {
    let Some(name) = ci.spec.pre_transformer.as_deref() else {
        return Ok(payload);
    };
    let pre = ctx
        .plugins
        .pre_transformer(name)
        .ok_or_else(|| LoadError::Payload(format!("pre_transformer '{name}' not registered")))?;
    match payload {
        Payload::Json(doc) => Ok(Payload::Json(pre(doc))),
        Payload::Text(text) => Ok(Payload::Json(pre(serde_json::Value::String(text)))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sniffs_json_by_first_byte() {
        match decode_body("  {\"a\": 1}", false) {
            Payload::Json(doc) => assert_eq!(doc, serde_json::json!({"a": 1})),
            other => panic!("unexpected: {other:?}"),
        }
        match decode_body("[1,2]", false) {
            Payload::Json(doc) => assert_eq!(doc, serde_json::json!([1, 2])),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_text() {
        match decode_body("plain body", false) {
            Payload::Text(text) => assert_eq!(text, "plain body"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn content_type_wins_for_scalar_json() {
        match decode_body("42", true) {
            Payload::Json(doc) => assert_eq!(doc, serde_json::json!(42)),
            other => panic!("unexpected: {other:?}"),
        }
        // without the header a bare scalar stays text
        match decode_body("42", false) {
            Payload::Text(text) => assert_eq!(text, "42"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_with_json_shape_degrades_to_text() {
        match decode_body("{not json", false) {
            Payload::Text(text) => assert_eq!(text, "{not json"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
