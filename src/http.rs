//! HTTP transport boundary and the `http` step.

use crate::context::{VariableContext, THIS};
use crate::registry::{Steps, TypeDescriptor, BUILTIN_STEPS};
use crate::step::{Runtime, StepBehavior, StepOutcome, StepType};
use crate::token::{resolve_string, resolve_value, stringify};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use linkme::distributed_slice;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// A fully resolved request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FormFile>,
    },
}

impl RequestBody {
    /// Summary kept in `this.request.body`.
    fn summary(&self) -> Value {
        match self {
            RequestBody::Empty => Value::Null,
            RequestBody::Json(value) => value.clone(),
            RequestBody::Text(text) => Value::String(text.clone()),
            RequestBody::Bytes(data) => json!({ "bytes": data.len() }),
            RequestBody::Multipart { fields, files } => json!({
                "fields": fields.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect::<Map<_, _>>(),
                "files": files.iter().map(|f| json!({"field": f.field, "fileName": f.file_name, "bytes": f.data.len()})).collect::<Vec<_>>(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormFile {
    pub field: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub duration: Duration,
}

/// Sends requests on behalf of `http` steps.
#[async_trait]
pub trait HttpTransport: fmt::Debug + Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: &str) -> Result<Method> {
        Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| anyhow!("invalid HTTP method '{method}'"))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(Self::convert_method(&request.method)?, &request.url);

        let is_multipart = matches!(request.body, RequestBody::Multipart { .. });
        for (name, value) in &request.headers {
            // reqwest sets the multipart boundary itself
            if is_multipart && name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.body(serde_json::to_vec(&value)?),
            RequestBody::Text(text) => builder.body(text),
            RequestBody::Bytes(data) => builder.body(data),
            RequestBody::Multipart { fields, files } => {
                let mut form = Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                for file in files {
                    form = form.part(file.field, Part::bytes(file.data).file_name(file.file_name));
                }
                builder.multipart(form)
            }
        };

        let start = Instant::now();
        debug!("Sending request");
        let response = builder.send().await.context("failed to send request")?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .context("failed to read response body")?;
        debug!("Received response with status {}", status);

        Ok(HttpResponse {
            status,
            headers,
            body,
            duration: start.elapsed(),
        })
    }
}

/// Issues one HTTP request. The response becomes the `this` root:
/// `{status, headers, body, duration, request}` where `body` is
/// parsed JSON when possible and raw text otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpStep {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub query: IndexMap<String, Value>,
    #[serde(default)]
    pub headers: IndexMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    /// File sent as the raw request body.
    #[serde(default)]
    pub file: Option<String>,
    /// Form field → file path; sent as `multipart/form-data` together
    /// with the fields of an object `body`.
    #[serde(default)]
    pub form_files: IndexMap<String, String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl StepType for HttpStep {}

#[distributed_slice(BUILTIN_STEPS)]
static REGISTER_HTTP: fn() -> TypeDescriptor<Steps> = TypeDescriptor::<Steps>::of::<HttpStep>;

impl HttpStep {
    async fn build_request(&self, rt: &Runtime, ctx: &VariableContext) -> Result<HttpRequest> {
        let method = resolve_string(&self.method, ctx).trim().to_uppercase();
        let url = build_url(&resolve_string(&self.url, ctx), &self.query, ctx)?;

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), stringify(&resolve_value(value, ctx))))
            .collect();
        let content_type = self
            .content_type
            .as_deref()
            .map(|ct| resolve_string(ct, ctx))
            .filter(|ct| !ct.is_empty());
        if let Some(ct) = &content_type {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
            headers.push(("Content-Type".to_string(), ct.clone()));
        }

        let body = if !self.form_files.is_empty() {
            let fields = match self.body.as_ref().map(|b| resolve_value(b, ctx)) {
                Some(Value::Object(map)) => map
                    .into_iter()
                    .map(|(k, v)| (k, stringify(&v)))
                    .collect(),
                Some(Value::Null) | None => Vec::new(),
                Some(_) => bail!("'body' must be an object when 'formFiles' is used"),
            };
            let mut files = Vec::with_capacity(self.form_files.len());
            for (field, file) in &self.form_files {
                let path = rt.resolve_file(&resolve_string(file, ctx));
                files.push(FormFile {
                    field: field.clone(),
                    file_name: file_name(&path),
                    data: read_file(&path).await?,
                });
            }
            RequestBody::Multipart { fields, files }
        } else if let Some(file) = &self.file {
            let path = rt.resolve_file(&resolve_string(file, ctx));
            if content_type.is_none() {
                headers.push(("Content-Type".to_string(), "application/octet-stream".to_string()));
            }
            RequestBody::Bytes(read_file(&path).await?)
        } else {
            match self.body.as_ref().map(|b| resolve_value(b, ctx)) {
                None | Some(Value::Null) => RequestBody::Empty,
                Some(Value::String(text)) if !is_json(content_type.as_deref()) => {
                    RequestBody::Text(text)
                }
                Some(value) => {
                    if content_type.is_none() {
                        headers.push(("Content-Type".to_string(), "application/json".to_string()));
                    }
                    RequestBody::Json(value)
                }
            }
        };

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

#[async_trait]
impl StepBehavior for HttpStep {
    async fn execute(&self, rt: &Runtime, ctx: &mut VariableContext) -> Result<StepOutcome> {
        let request = self.build_request(rt, ctx).await?;
        let request_summary = json!({
            "method": request.method,
            "url": request.url,
            "headers": header_map(&request.headers),
            "body": request.body.summary(),
        });

        let response = rt
            .transport
            .send(request.clone())
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;

        let duration_ms = response.duration.as_millis() as u64;
        let this = build_this(&response, request_summary);
        ctx.set_root(THIS, this)?;

        Ok(StepOutcome::passed().with_details(json!({
            "request": {"method": request.method, "url": request.url},
            "response": {"status": response.status, "durationMs": duration_ms},
        })))
    }
}

fn build_url(base: &str, query: &IndexMap<String, Value>, ctx: &VariableContext) -> Result<String> {
    if base.trim().is_empty() {
        bail!("request url is empty");
    }
    if query.is_empty() {
        return Ok(base.to_string());
    }
    let mut url = url::Url::parse(base).with_context(|| format!("invalid url '{base}'"))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query {
            match resolve_value(value, ctx) {
                Value::Array(items) => {
                    for item in items {
                        pairs.append_pair(name, &stringify(&item));
                    }
                }
                other => {
                    pairs.append_pair(name, &stringify(&other));
                }
            }
        }
    }
    Ok(url.to_string())
}

fn build_this(response: &HttpResponse, request: Value) -> Value {
    let body = serde_json::from_str::<Value>(&response.body)
        .unwrap_or_else(|_| Value::String(response.body.clone()));
    json!({
        "status": response.status,
        "headers": header_map(&response.headers),
        "body": body,
        "duration": response.duration.as_millis() as u64,
        "request": request,
    })
}

fn header_map(headers: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(name.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_lowercase().contains("json"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read file {}", path.display()))
}


#[cfg(test)]
mod tests {
    use super::testing::StubTransport;
    use super::*;
    use crate::context::CTX;
    use crate::step::Step;
    use std::sync::Arc;

    fn step(doc: Value) -> Step {
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn test_response_becomes_this() {
        let stub = Arc::new(StubTransport::responding(201, json!({"id": "abc"})));
        let rt = Runtime::new(stub.clone());
        let step = step(json!({
            "type": "http",
            "method": "post",
            "url": "{{$.env.baseUrl}}/orders",
            "headers": {"X-Trace": "{{$.ctx.trace}}"},
            "body": {"qty": "{{$.ctx.qty}}"},
            "save": {"orderId": "{{$.this.body.id}}"},
            "assert": [{"type": "equals", "actualValue": "{{$.this.status}}", "expectedValue": 201}]
        }));
        let mut ctx = VariableContext::with_env(Arc::new(json!({"baseUrl": "http://svc"})));
        ctx.set_root(CTX, json!({"trace": 42, "qty": 3})).unwrap();

        let result = step.execute(&rt, &mut ctx).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(ctx.root(CTX).unwrap()["orderId"], json!("abc"));

        let sent = stub.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "POST");
        assert_eq!(sent[0].url, "http://svc/orders");
        assert_eq!(sent[0].header("x-trace"), Some("42"));
        assert_eq!(sent[0].header("content-type"), Some("application/json"));
        assert!(matches!(&sent[0].body, RequestBody::Json(b) if b == &json!({"qty": 3})));

        let this = ctx.root(THIS).unwrap();
        assert_eq!(this["headers"]["content-type"], json!("application/json"));
        assert_eq!(this["request"]["method"], json!("POST"));
    }

    #[tokio::test]
    async fn test_query_values_are_appended() {
        let stub = Arc::new(StubTransport::default());
        let rt = Runtime::new(stub.clone());
        let step = step(json!({
            "type": "http",
            "url": "http://svc/search?fixed=1",
            "query": {"q": "a b", "tag": ["x", "y"], "n": "{{$.ctx.n}}"}
        }));
        let mut ctx = VariableContext::new();
        ctx.set_root(CTX, json!({"n": 2})).unwrap();

        step.execute(&rt, &mut ctx).await.unwrap();
        assert_eq!(
            stub.requests()[0].url,
            "http://svc/search?fixed=1&q=a+b&tag=x&tag=y&n=2"
        );
    }

    #[tokio::test]
    async fn test_text_body_and_non_json_response() {
        let stub = Arc::new(StubTransport {
            status: 200,
            body: "plain text".to_string(),
            requests: Default::default(),
        });
        let rt = Runtime::new(stub.clone());
        let step = step(json!({
            "type": "http",
            "method": "PUT",
            "url": "http://svc/notes",
            "contentType": "text/plain",
            "body": "hello {{$.ctx.who}}"
        }));
        let mut ctx = VariableContext::new();
        ctx.set_root(CTX, json!({"who": "there"})).unwrap();

        step.execute(&rt, &mut ctx).await.unwrap();
        let sent = stub.requests();
        assert!(matches!(&sent[0].body, RequestBody::Text(t) if t == "hello there"));
        assert_eq!(sent[0].header("Content-Type"), Some("text/plain"));
        assert_eq!(ctx.root(THIS).unwrap()["body"], json!("plain text"));
    }

    #[tokio::test]
    async fn test_form_files_resolve_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("avatar.png"), b"png").unwrap();

        let stub = Arc::new(StubTransport::default());
        let rt = Runtime::new(stub.clone()).with_base_dir(dir.path());
        let step = step(json!({
            "type": "http",
            "method": "POST",
            "url": "http://svc/upload",
            "body": {"owner": "u1"},
            "formFiles": {"image": "avatar.png"}
        }));
        let mut ctx = VariableContext::new();
        step.execute(&rt, &mut ctx).await.unwrap();

        match &stub.requests()[0].body {
            RequestBody::Multipart { fields, files } => {
                assert_eq!(fields, &vec![("owner".to_string(), "u1".to_string())]);
                assert_eq!(files[0].field, "image");
                assert_eq!(files[0].file_name, "avatar.png");
                assert_eq!(files[0].data, b"png");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_a_fault() {
        let rt = Runtime::new(Arc::new(StubTransport::default()));
        let step = step(json!({"type": "http", "method": "POST", "url": "http://svc", "file": "nope.bin"}));
        let mut ctx = VariableContext::new();
        let err = step.execute(&rt, &mut ctx).await.unwrap_err();
        assert!(format!("{err:#}").contains("nope.bin"));
    }

    #[test]
    fn test_convert_method() {
        assert_eq!(ReqwestTransport::convert_method("patch").unwrap(), Method::PATCH);
        assert!(ReqwestTransport::convert_method("NOT A METHOD").is_err());
    }
}
