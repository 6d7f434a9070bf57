//! Blocking HTTP client for the IDP API.

use anyhow::{anyhow, Context};
use serde_json::Value;

pub struct ApiClient {
    base: String,
}

impl ApiClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn get(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<Value> {
        let mut req = ureq::get(&self.url(path));
        for (k, v) in query {
            req = req.query(k, v);
        }
        self.finish(req.call())
    }

    pub fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(ureq::post(&self.url(path)), body)
    }

    pub fn put(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(ureq::put(&self.url(path)), body)
    }

    pub fn delete(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<Value> {
        let mut req = ureq::delete(&self.url(path));
        for (k, v) in query {
            req = req.query(k, v);
        }
        self.finish(req.call())
    }

    fn send(&self, req: ureq::Request, body: &Value) -> anyhow::Result<Value> {
        let body = serde_json::to_string(body)?;
        self.finish(
            req.set("Content-Type", "application/json")
                .send_string(&body),
        )
    }

    fn finish(&self, result: Result<ureq::Response, ureq::Error>) -> anyhow::Result<Value> {
        match result {
            Ok(resp) => {
                let text = resp.into_string().context("failed to read response")?;
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&text).context("response was not JSON")
            }
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                let message = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v["error"].as_str().map(str::to_string))
                    .unwrap_or(text);
                Err(anyhow!("API returned {code}: {message}"))
            }
            Err(e) => Err(anyhow!(e).context(format!("failed to reach IDP API at {}", self.base))),
        }
    }
}
