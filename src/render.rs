//! Client for the external HTML-to-PDF rendering service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render service is unhealthy: {0}")]
    Unhealthy(String),
    #[error("render service responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("render request timed out after {0:?}")]
    Timeout(Duration),
    #[error("render request failed: {0}")]
    Transport(reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub format: String,
    pub landscape: bool,
    pub margin_top: f32,
    pub margin_bottom: f32,
    pub margin_left: f32,
    pub margin_right: f32,
    pub scale: f32,
    pub wait_delay_ms: u64,
    pub print_background: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: "A4".to_string(),
            landscape: false,
            margin_top: 0.4,
            margin_bottom: 0.4,
            margin_left: 0.4,
            margin_right: 0.4,
            scale: 1.0,
            wait_delay_ms: 500,
            print_background: true,
        }
    }
}

impl RenderOptions {
    /// Form fields sent next to `index.html`.
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("format", self.format.clone()),
            ("landscape", self.landscape.to_string()),
            ("marginTop", self.margin_top.to_string()),
            ("marginBottom", self.margin_bottom.to_string()),
            ("marginLeft", self.margin_left.to_string()),
            ("marginRight", self.margin_right.to_string()),
            ("scale", self.scale.to_string()),
            ("waitDelay", format!("{}ms", self.wait_delay_ms)),
            ("printBackground", self.print_background.to_string()),
        ]
    }
}

#[async_trait]
pub trait PdfRenderer: Send + Sync + 'static {
    async fn health(&self) -> Result<(), RenderError>;
    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, RenderError>;
}

pub struct HttpRenderClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRenderClient {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn transport(&self, err: reqwest::Error) -> RenderError {
        if err.is_timeout() {
            RenderError::Timeout(self.timeout)
        } else {
            RenderError::Transport(err)
        }
    }
}

#[async_trait]
impl PdfRenderer for HttpRenderClient {
    async fn health(&self) -> Result<(), RenderError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|err| RenderError::Unhealthy(err.to_string()))?;

        if !response.status().is_success() {
            return Err(RenderError::Unhealthy(format!(
                "health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
        self.health().await?;

        let index = multipart::Part::text(html.to_string())
            .file_name("index.html")
            .mime_str("text/html")
            .map_err(RenderError::Transport)?;
        let form = options
            .form_fields()
            .into_iter()
            .fold(multipart::Form::new().part("files", index), |form, (name, value)| {
                form.text(name, value)
            });

        let response = self
            .http
            .post(format!("{}/convert", self.base_url))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.transport(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "render service rejected conversion");
            return Err(RenderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|err| self.transport(err))?;
        debug!(size = bytes.len(), "rendered pdf");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_render_a4_portrait() {
        let fields = RenderOptions::default().form_fields();
        assert!(fields.contains(&("format", "A4".to_string())));
        assert!(fields.contains(&("landscape", "false".to_string())));
        assert!(fields.contains(&("waitDelay", "500ms".to_string())));
    }

    #[test]
    fn partial_options_fill_defaults() {
        let options: RenderOptions =
            serde_json::from_value(serde_json::json!({"landscape": true})).unwrap();
        assert!(options.landscape);
        assert_eq!(options.format, "A4");
        assert_eq!(options.scale, 1.0);
    }
}
