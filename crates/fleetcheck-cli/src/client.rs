use anyhow::{anyhow, Context, Result};
use fleetcheck_common::ApiResponse;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn auth(builder: RequestBuilder, token: Option<&String>) -> RequestBuilder {
    match token {
        Some(t) => builder.bearer_auth(t),
        None => builder,
    }
}

/// Thin wrapper that unwraps the orchestrator's response envelope.
pub struct ApiClient {
    http: Client,
    base: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(server_url: &str, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base: format!("{}/api", server_url.trim_end_matches('/')),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let req = auth(self.http.get(self.url(path)), self.token.as_ref());
        Self::unwrap(req).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        let req = auth(self.http.post(self.url(path)), self.token.as_ref()).json(body);
        Self::unwrap(req).await
    }

    async fn unwrap<T: DeserializeOwned>(req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.context("orchestrator unreachable")?;
        let status = resp.status();
        let text = resp.text().await?;
        let envelope: ApiResponse<T> = serde_json::from_str(&text)
            .with_context(|| format!("unexpected response ({status}): {text}"))?;
        let code = envelope.code;
        envelope.into_result().map_err(|message| match code {
            Some(code) => anyhow!("{message} ({code:?})"),
            None => anyhow!(message),
        })
    }
}
