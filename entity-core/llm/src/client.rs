use futures::stream::Stream;
use futures::{
    StreamExt,
    stream::{self},
};
use reqwest::header::HeaderMap;
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt::Debug, pin::Pin};
use tracing::{Level, event, instrument};

/// Longest error body echoed back in an error message
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
}

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

impl Client {
    pub fn new() -> Self {
        Client {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_headers(headers: HeaderMap) -> anyhow::Result<Self> {
        Ok(Client {
            client: reqwest::Client::builder()
                .default_headers(headers)
                .build()?,
        })
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get<U, T>(&self, url: U) -> anyhow::Result<T>
    where
        U: reqwest::IntoUrl + std::fmt::Debug,
        T: DeserializeOwned,
    {
        let response = self.client.get(url).send().await?;
        let response = ensure_success(response).await?;
        let text = response.text().await?;
        event!(Level::TRACE, response = text);

        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self, request), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post<U, S, T>(&self, url: U, request: &S) -> anyhow::Result<T>
    where
        U: reqwest::IntoUrl + std::fmt::Debug,
        S: Serialize + Sized,
        T: DeserializeOwned,
    {
        let response = self.client.post(url).json(request).send().await?;
        let response = ensure_success(response).await?;
        let text = response.text().await?;
        event!(Level::TRACE, response = text);

        Ok(serde_json::from_str::<T>(&text)?)
    }

    /// POST and decode a line-oriented streaming response.
    ///
    /// `process` maps each raw line to the JSON payload to decode (stripping SSE
    /// prefixes, dropping terminators); lines it rejects are skipped.
    #[instrument(level = "trace", skip(self, request, process), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post_stream<U, S, F, T>(
        &self,
        url: U,
        request: &S,
        process: F,
    ) -> anyhow::Result<BoxedStream<T>>
    where
        U: reqwest::IntoUrl + Debug,
        S: Serialize + Sized,
        T: DeserializeOwned + Send + 'static,
        F: Fn(&str) -> Option<&str> + 'static + Send,
    {
        let response = self.client.post(url).json(&request).send().await?;
        let response = ensure_success(response).await?;

        let buffered_stream = response
            .bytes_stream()
            .scan(String::new(), move |buffer, chunk| {
                let messages = match chunk {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        drain_complete_lines(buffer, &process)
                    }
                    Err(e) => {
                        tracing::warn!("Error reading stream chunk: {}", e);
                        Vec::new()
                    }
                };
                futures::future::ready(Some(messages))
            });

        Ok(Box::pin(buffered_stream.flat_map(stream::iter)))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_success(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let mut body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(anyhow::anyhow!("Request failed with status {}: {}", status, body))
}

/// Decode every complete line in `buffer`, leaving a trailing partial line in place.
fn drain_complete_lines<T, F>(buffer: &mut String, process: &F) -> Vec<T>
where
    T: DeserializeOwned,
    F: Fn(&str) -> Option<&str>,
{
    let mut messages = Vec::new();
    let mut last_newline_pos = 0;

    for (idx, _) in buffer.match_indices('\n') {
        let line = &buffer[last_newline_pos..idx];
        last_newline_pos = idx + 1;

        if let Some(processed) = process(line) {
            if processed.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(processed) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::debug!("Skipping unparseable line {}: {}", processed, e),
            }
        }
    }

    buffer.drain(..last_newline_pos);
    messages
}

/// Line processor for `data: ...` server-sent events, `[DONE]` terminates
pub fn sse_data(line: &str) -> Option<&str> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data == "[DONE]" { None } else { Some(data) }
}

/// Line processor for newline-delimited JSON
pub fn ndjson(line: &str) -> Option<&str> {
    Some(line.trim())
}
