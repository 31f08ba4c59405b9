//! Turns image references found on the page into inline base64 payloads for the model

use std::{sync::LazyLock, time::Duration};

use base64::Engine as _;
use color_eyre::{Result, eyre::eyre};
use regex::Regex;
use url::Url;

static DATA_URI_MIME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^data:([^;,]+)[;,]").expect("static regex"));

/// Base64 image ready to be inlined into a model request
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImagePayload {
	pub mime: String,
	pub base64: String,
}

impl ImagePayload {
	pub fn decode(&self) -> Result<Vec<u8>> {
		base64::engine::general_purpose::STANDARD
			.decode(&self.base64)
			.map_err(|e| eyre!("Failed to decode base64: {}", e))
	}

	pub fn data_url(&self) -> String {
		format!("data:{};base64,{}", self.mime, self.base64)
	}
}

#[derive(Clone, Debug)]
pub struct ImageResolver {
	client: reqwest::Client,
	/// URL of the page the images were scraped from, relative `src`s are joined onto it
	base_url: Option<Url>,
}

impl ImageResolver {
	pub fn new(timeout: Duration) -> Result<Self> {
		let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
		Ok(Self { client, base_url: None })
	}

	pub fn with_base_url(mut self, page_url: &str) -> Self {
		self.base_url = Url::parse(page_url).ok();
		self
	}

	/// Resolve `src` into an inline payload. Every failure is logged and yields `None`, so one broken image never sinks the
	/// whole question.
	pub async fn resolve(&self, src: &str) -> Option<ImagePayload> {
		let src = src.trim();
		if src.is_empty() {
			return None;
		}
		if src.starts_with("data:") {
			return parse_data_uri(src);
		}
		if src.starts_with("file://") {
			tracing::debug!("Skipping local file image: {}", src);
			return None;
		}

		let url = match self.absolute_url(src) {
			Some(url) => url,
			None => {
				tracing::warn!("Unresolvable image reference: {}", src);
				return None;
			}
		};
		if url.scheme() == "file" {
			return None;
		}

		match self.fetch(&url).await {
			Ok(payload) => Some(payload),
			Err(e) => {
				tracing::warn!("Failed to fetch image {}: {}", url, e);
				None
			}
		}
	}

	fn absolute_url(&self, src: &str) -> Option<Url> {
		match Url::parse(src) {
			Ok(url) => Some(url),
			Err(url::ParseError::RelativeUrlWithoutBase) => self.base_url.as_ref()?.join(src).ok(),
			Err(_) => None,
		}
	}

	async fn fetch(&self, url: &Url) -> Result<ImagePayload> {
		let response = self.client.get(url.clone()).send().await.map_err(|e| eyre!("request failed: {}", e))?;
		let status = response.status();
		if !status.is_success() {
			return Err(eyre!("HTTP {}", status));
		}

		let declared = response
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
			.unwrap_or_default();
		let bytes = response.bytes().await.map_err(|e| eyre!("failed to read body: {}", e))?;

		let mime = if declared.is_empty() || declared == "application/octet-stream" {
			mime_from_extension(url.path()).to_string()
		} else {
			declared
		};

		Ok(ImagePayload {
			mime,
			base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
		})
	}
}

/// `data:image/png;base64,xxxx` -> payload, with `image/jpeg` when the header carries no usable MIME type
fn parse_data_uri(src: &str) -> Option<ImagePayload> {
	let comma = src.find(',')?;
	let header = &src[..=comma];
	let mime = DATA_URI_MIME
		.captures(header)
		.and_then(|caps| caps.get(1))
		.map(|m| m.as_str().trim().to_string())
		.filter(|m| !m.is_empty())
		.unwrap_or_else(|| "image/jpeg".to_string());
	Some(ImagePayload {
		mime,
		base64: src[comma + 1..].to_string(),
	})
}

fn mime_from_extension(path: &str) -> &'static str {
	let path = path.to_ascii_lowercase();
	if path.ends_with(".png") {
		"image/png"
	} else if path.ends_with(".webp") {
		"image/webp"
	} else if path.ends_with(".gif") {
		"image/gif"
	} else {
		"image/jpeg"
	}
}
