//! Built-in `web` metric provider.
//!
//! Issues an HTTP GET against `config.url` and returns the JSON body, or the
//! element selected by `config.jsonPath` (`$.data.rate`, `items[0].value`).
//! Non-JSON bodies are returned as a string.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use tracing::debug;

use vane_state::Metric;

use crate::error::ProviderError;
use crate::provider::{MeasureContext, MeasurementOutcome, MetricProvider};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebConfig {
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    json_path: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebProvider;

impl WebProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricProvider for WebProvider {
    async fn run(
        &self,
        ctx: &MeasureContext,
        metric: &Metric,
    ) -> Result<MeasurementOutcome, ProviderError> {
        let config: WebConfig = serde_json::from_value(metric.provider.config.clone())
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        let body = http_get(&config.url, &config.headers).await?;
        debug!(run = %ctx.run, metric = %metric.name, url = %config.url, bytes = body.len(), "web measurement");

        let document = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(json) => json,
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(&body).trim().to_string()),
        };
        let value = match &config.json_path {
            Some(path) => extract(&document, path)
                .ok_or_else(|| ProviderError::Path(path.clone()))?
                .clone(),
            None => document,
        };

        let metadata = BTreeMap::from([("url".to_string(), config.url)]);
        Ok(MeasurementOutcome::Value { value, metadata })
    }
}

/// GET `url` over plain HTTP/1.1 and return the body of a 2xx response.
async fn http_get(url: &str, headers: &BTreeMap<String, String>) -> Result<Bytes, ProviderError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| ProviderError::Config(format!("bad url {url:?}: {e}")))?;
    if uri.scheme_str() != Some("http") {
        return Err(ProviderError::Config(format!(
            "unsupported url {url:?}: only http:// is supported"
        )));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| ProviderError::Config(format!("url {url:?} has no host")))?
        .clone();
    let port = authority.port_u16().unwrap_or(80);

    let stream = tokio::net::TcpStream::connect((authority.host(), port))
        .await
        .map_err(|e| ProviderError::Request(format!("connect {authority}: {e}")))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProviderError::Request(format!("handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let mut builder = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", authority.as_str())
        .header("user-agent", "vane-analysis/0.1")
        .header("accept", "application/json");
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let req = builder
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProviderError::Config(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProviderError::Status(resp.status().as_u16()));
    }
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProviderError::Body(e.to_string()))?
        .to_bytes();
    Ok(body)
}

/// Select an element by dotted path. Accepts `$.a.b`, `{$.a.b}`, `a.b[0]`
/// and `a.b.0`.
pub fn extract<'a>(document: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let path = path.trim();
    let path = path
        .strip_prefix('{')
        .and_then(|p| p.strip_suffix('}'))
        .unwrap_or(path);
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);

    let mut current = document;
    if path.is_empty() {
        return Some(current);
    }
    for segment in path.split('.') {
        let (name, indices) = match segment.find('[') {
            Some(open) => (&segment[..open], &segment[open..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            current = match current {
                serde_json::Value::Object(map) => map.get(name)?,
                serde_json::Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for index in indices.split('[').filter(|s| !s.is_empty()) {
            let n: usize = index.strip_suffix(']')?.parse().ok()?;
            current = current.as_array()?.get(n)?;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve one canned HTTP response and return the address.
    async fn one_shot_server(status: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr.to_string()
    }

    fn web_metric(url: String, json_path: Option<&str>) -> Metric {
        let mut metric = Metric::new("success-rate", "web");
        metric.provider.config = match json_path {
            Some(path) => json!({"url": url, "jsonPath": path}),
            None => json!({"url": url}),
        };
        metric
    }

    fn ctx() -> MeasureContext {
        MeasureContext {
            run: "default/web-run".to_string(),
            args: BTreeMap::new(),
        }
    }

    #[test]
    fn extract_paths() {
        let doc = json!({"data": {"rate": 0.99, "items": [{"v": 1}, {"v": 2}]}});
        assert_eq!(extract(&doc, "$.data.rate"), Some(&json!(0.99)));
        assert_eq!(extract(&doc, "{$.data.rate}"), Some(&json!(0.99)));
        assert_eq!(extract(&doc, "data.items[1].v"), Some(&json!(2)));
        assert_eq!(extract(&doc, "data.items.0.v"), Some(&json!(1)));
        assert_eq!(extract(&doc, "$"), Some(&doc));
        assert_eq!(extract(&doc, "data.missing"), None);
        assert_eq!(extract(&doc, "data.items[9]"), None);
    }

    #[tokio::test]
    async fn fetches_json_path() {
        let addr = one_shot_server("200 OK", r#"{"data":{"rate":0.97}}"#).await;
        let metric = web_metric(format!("http://{addr}/metrics"), Some("$.data.rate"));

        let outcome = WebProvider::new().run(&ctx(), &metric).await.unwrap();
        match outcome {
            MeasurementOutcome::Value { value, metadata } => {
                assert_eq!(value, json!(0.97));
                assert!(metadata["url"].ends_with("/metrics"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let addr = one_shot_server("503 Service Unavailable", "{}").await;
        let metric = web_metric(format!("http://{addr}/"), None);
        let err = WebProvider::new().run(&ctx(), &metric).await.unwrap_err();
        assert!(matches!(err, ProviderError::Status(503)));
    }

    #[tokio::test]
    async fn missing_path_is_an_error() {
        let addr = one_shot_server("200 OK", r#"{"a":1}"#).await;
        let metric = web_metric(format!("http://{addr}/"), Some("b"));
        let err = WebProvider::new().run(&ctx(), &metric).await.unwrap_err();
        assert!(matches!(err, ProviderError::Path(_)));
    }

    #[tokio::test]
    async fn rejects_bad_config() {
        let mut metric = Metric::new("m", "web");
        metric.provider.config = json!({"nourl": true});
        assert!(matches!(
            WebProvider::new().run(&ctx(), &metric).await,
            Err(ProviderError::Config(_))
        ));

        let metric = web_metric("https://example.com/".to_string(), None);
        assert!(matches!(
            WebProvider::new().run(&ctx(), &metric).await,
            Err(ProviderError::Config(_))
        ));
    }

    #[tokio::test]
    async fn connection_refused_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let metric = web_metric(format!("http://{addr}/"), None);
        assert!(matches!(
            WebProvider::new().run(&ctx(), &metric).await,
            Err(ProviderError::Request(_))
        ));
    }
}
