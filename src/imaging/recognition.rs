use ab_glyph::FontVec;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{ImageFilter, caption, decode, encode, run_blocking};
use crate::common::model::FilterType;
use crate::common::model::config::IntegrationConfig;
use crate::errors::{Error, IntegrationError, Result};
use crate::resilience::ResilienceEnvelope;

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    text: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct UploadResult {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    result: Option<UploadResult>,
    status: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct TagName {
    en: String,
}

#[derive(Debug, Deserialize)]
pub struct Tag {
    confidence: f64,
    tag: TagName,
}

#[derive(Debug, Deserialize)]
struct TagsResult {
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    result: Option<TagsResult>,
    status: Option<ApiStatus>,
}

/// Top `limit` tag names by descending confidence, comma separated.
pub fn caption_text(mut tags: Vec<Tag>, limit: usize) -> String {
    tags.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    tags.into_iter()
        .take(limit)
        .map(|t| t.tag.en)
        .collect::<Vec<_>>()
        .join(", ")
}

fn missing_result(status: Option<ApiStatus>) -> Error {
    let text = status
        .map(|s| format!("{}: {}", s.kind, s.text))
        .unwrap_or_else(|| "response carried no result".to_string());
    IntegrationError::Decode(text.into()).into()
}

/// Tags the image through the recognition API and captions it with the
/// most confident tags.
pub struct RecognitionFilter {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    envelope: Arc<ResilienceEnvelope>,
    tags_limit: usize,
    font: Option<Arc<FontVec>>,
}

impl RecognitionFilter {
    pub fn new(
        config: &IntegrationConfig,
        envelope: Arc<ResilienceEnvelope>,
        tags_limit: usize,
        font: Option<FontVec>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            envelope,
            tags_limit,
            font: font.map(Arc::new),
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_ref()),
            None => builder,
        }
    }

    async fn upload(&self, image: &[u8]) -> Result<String> {
        let part = Part::bytes(image.to_vec()).file_name("image");
        let form = Form::new().part("image", part);
        let response = self
            .authorize(self.client.post(format!("{}/uploads", self.base_url)))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let body: UploadResponse = response.json().await?;
        match body.result {
            Some(result) => Ok(result.upload_id),
            None => Err(missing_result(body.status)),
        }
    }

    async fn fetch_tags(&self, upload_id: &str) -> Result<Vec<Tag>> {
        let response = self
            .authorize(self.client.get(format!("{}/tags", self.base_url)))
            .query(&[("image_upload_id", upload_id)])
            .send()
            .await?
            .error_for_status()?;
        let body: TagsResponse = response.json().await?;
        match body.result {
            Some(result) => Ok(result.tags),
            None => Err(missing_result(body.status)),
        }
    }

    async fn recognize(&self, image: &[u8]) -> Result<String> {
        self.envelope.acquire().await?;
        let upload_id = self.envelope.execute(|| self.upload(image)).await?;
        debug!("Uploaded image for recognition: {}", upload_id);
        let tags = self.envelope.execute(|| self.fetch_tags(&upload_id)).await?;
        Ok(caption_text(tags, self.tags_limit))
    }
}

#[async_trait]
impl ImageFilter for RecognitionFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Recognition
    }

    async fn convert(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        let text = self
            .recognize(&image)
            .await
            .map_err(|e| Error::conversion_failed(FilterType::Recognition, e.to_string()))?;

        let font = self.font.clone();
        run_blocking(FilterType::Recognition, move || {
            let mut raster = decode(&image)?;
            match font {
                Some(font) => caption::draw_caption(&mut raster.image, &text, &font),
                None => warn!("Skipping caption '{}': no font available", text),
            }
            encode(raster.image, raster.format)
        })
        .await
    }
}
