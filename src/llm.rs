//! Model router: walks the (model, key) candidates until one returns a usable answer

use std::{fmt, time::Duration};

use color_eyre::{Result, eyre::eyre};
use serde_json::{Value, json};

use crate::{AnswerResult, prompt::PromptPayload};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models/";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Provider {
	#[default]
	Gemini,
	/// OpenAI-compatible chat completions
	OpenRouter,
}

impl std::str::FromStr for Provider {
	type Err = color_eyre::Report;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" | "gemini" => Ok(Provider::Gemini),
			"openrouter" => Ok(Provider::OpenRouter),
			other => Err(eyre!("Unknown provider '{}' (expected gemini or openrouter)", other)),
		}
	}
}

impl Provider {
	pub fn default_models(&self) -> Vec<String> {
		match self {
			Provider::Gemini => vec!["gemini-2.5-flash".to_string()],
			Provider::OpenRouter => vec!["google/gemini-2.5-flash".to_string(), "openai/gpt-4o-mini".to_string()],
		}
	}

	/// Prepare the HTTP call for one (model, key) candidate
	pub fn call(&self, base_url: Option<&str>, model: &str, api_key: &str, prompt: &PromptPayload) -> ProviderCall {
		match self {
			Provider::Gemini => {
				let mut parts = vec![json!({ "text": prompt.text })];
				for img in &prompt.images {
					parts.push(json!({ "inline_data": { "mime_type": img.mime, "data": img.base64 } }));
				}
				let base = base_url.unwrap_or(GEMINI_BASE_URL);
				ProviderCall {
					model: model.to_string(),
					api_key: api_key.to_string(),
					url: format!("{base}{model}:generateContent"),
					auth: KeyAuth::Header("x-goog-api-key"),
					body: json!({
						"contents": [{ "parts": parts }],
						"generationConfig": { "responseMimeType": "application/json", "temperature": 0.0 }
					}),
				}
			}
			Provider::OpenRouter => {
				let mut content = vec![json!({ "type": "text", "text": prompt.text })];
				for img in &prompt.images {
					content.push(json!({ "type": "image_url", "image_url": { "url": img.data_url() } }));
				}
				ProviderCall {
					model: model.to_string(),
					api_key: api_key.to_string(),
					url: base_url.unwrap_or(OPENROUTER_BASE_URL).to_string(),
					auth: KeyAuth::Bearer,
					body: json!({
						"model": model,
						"messages": [{ "role": "user", "content": content }],
						"temperature": 0.0,
						"response_format": { "type": "json_object" }
					}),
				}
			}
		}
	}

	/// Pull the model's text out of a successful response body
	pub fn response_text(&self, body: &str) -> Result<String> {
		let value: Value = serde_json::from_str(body).map_err(|e| eyre!("Response is not JSON: {}", e))?;
		let text = match self {
			Provider::Gemini => value.pointer("/candidates/0/content/parts/0/text"),
			Provider::OpenRouter => value.pointer("/choices/0/message/content"),
		};
		text.and_then(Value::as_str).map(str::to_string).ok_or_else(|| eyre!("Response carries no text candidate"))
	}
}

/// How the API key is sent; it never goes into the URL
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAuth {
	Bearer,
	Header(&'static str),
}

/// One HTTP request against a provider
#[derive(Clone, Debug)]
pub struct ProviderCall {
	pub model: String,
	pub api_key: String,
	pub url: String,
	pub auth: KeyAuth,
	pub body: Value,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
	pub status: u16,
	pub body: String,
}

/// Sends provider calls. `Err` means the request never produced an HTTP status (network, timeout)
#[allow(async_fn_in_trait)]
pub trait Transport {
	async fn send(&self, call: &ProviderCall) -> Result<TransportResponse>;
}

#[derive(Clone, Debug)]
pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	pub fn new(timeout: Duration) -> Result<Self> {
		let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
		Ok(Self { client })
	}
}

impl Transport for HttpTransport {
	async fn send(&self, call: &ProviderCall) -> Result<TransportResponse> {
		let request = self.client.post(&call.url).json(&call.body);
		let request = match call.auth {
			KeyAuth::Bearer => request.bearer_auth(&call.api_key).header("X-Title", "quiz_pilot"),
			KeyAuth::Header(name) => request.header(name, &call.api_key),
		};
		let response = request.send().await.map_err(|e| eyre!("Request to {} failed: {}", call.model, e.without_url()))?;
		let status = response.status().as_u16();
		let body = response.text().await.map_err(|e| eyre!("Failed to read response from {}: {}", call.model, e.without_url()))?;
		Ok(TransportResponse { status, body })
	}
}

/// Index of the key that answered last; the next call starts from it
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeyAffinity(pub usize);

#[derive(Clone, Debug)]
pub struct RoutedAnswer {
	pub answer: AnswerResult,
	pub model: String,
	pub key_index: usize,
}

impl RoutedAnswer {
	/// Affinity to pass into the next call
	pub fn affinity(&self) -> KeyAffinity {
		KeyAffinity(self.key_index)
	}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouterError {
	/// No model or no key configured
	NoCandidates,
	/// Every (model, key) pair was tried
	Exhausted {
		last_error: Option<String>,
		/// At least one candidate failed below HTTP (network, timeout), so trying again later may help
		transient: bool,
	},
}

impl fmt::Display for RouterError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RouterError::NoCandidates => write!(f, "no model or API key configured"),
			RouterError::Exhausted { last_error: Some(e), .. } => write!(f, "all models and keys failed, last error: {e}"),
			RouterError::Exhausted { last_error: None, .. } => write!(f, "all models and keys are rate-limited or overloaded"),
		}
	}
}

impl std::error::Error for RouterError {}

/// How one candidate went
enum Attempt {
	Answered(AnswerResult),
	/// Rate limit, overload or unparseable answer: move on, nothing worth reporting
	Retryable(String),
	Failed { error: String, transient: bool },
}

async fn attempt<T: Transport>(transport: &T, provider: Provider, call: &ProviderCall, prompt: &PromptPayload) -> Attempt {
	let response = match transport.send(call).await {
		Ok(r) => r,
		Err(e) =>
			return Attempt::Failed {
				error: e.to_string(),
				transient: true,
			},
	};

	match response.status {
		429 | 503 => return Attempt::Retryable(format!("status {}", response.status)),
		200..=299 => {}
		status =>
			return Attempt::Failed {
				error: format!("API {}: {}", status, response.body.trim()),
				transient: false,
			},
	}

	let text = match provider.response_text(&response.body) {
		Ok(text) => text,
		Err(e) => return Attempt::Retryable(e.to_string()),
	};
	tracing::debug!("LLM raw response ({}): {}", call.model, text);

	match AnswerResult::parse(prompt.kind, &text) {
		Ok(answer) => Attempt::Answered(answer),
		Err(e) => Attempt::Retryable(format!("unparseable answer: {e} - raw: '{}'", text.trim())),
	}
}

/// Ask the models for an answer.
///
/// Models are tried in order; for each model every key is tried, starting from `affinity` and wrapping around. The
/// first parsed answer wins and carries the key index to remember for the next call.
pub async fn ask<T: Transport>(
	transport: &T,
	provider: Provider,
	base_url: Option<&str>,
	prompt: &PromptPayload,
	models: &[String],
	keys: &[String],
	affinity: KeyAffinity,
) -> Result<RoutedAnswer, RouterError> {
	if models.is_empty() || keys.is_empty() {
		return Err(RouterError::NoCandidates);
	}

	let mut last_error = None;
	let mut transient = false;
	for model in models {
		for offset in 0..keys.len() {
			let key_index = (affinity.0 + offset) % keys.len();
			let call = provider.call(base_url, model, &keys[key_index], prompt);

			match attempt(transport, provider, &call, prompt).await {
				Attempt::Answered(answer) => {
					tracing::info!("Answered by {} (key #{})", model, key_index);
					return Ok(RoutedAnswer {
						answer,
						model: model.clone(),
						key_index,
					});
				}
				Attempt::Retryable(why) => {
					tracing::warn!("{} with key #{} unavailable ({}), trying next", model, key_index, why);
				}
				Attempt::Failed { error, transient: t } => {
					tracing::warn!("{} with key #{} failed: {}", model, key_index, error);
					transient |= t;
					last_error = Some(error);
				}
			}
		}
	}

	Err(RouterError::Exhausted { last_error, transient })
}

/// Bounded exponential backoff around [`ask`], for failures below the API level
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub multiplier: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(1000),
			multiplier: 2,
		}
	}
}

impl RetryPolicy {
	/// Delay before retry number `attempt` (1-based), with up to 10% jitter
	pub fn delay(&self, attempt: u32) -> Duration {
		let factor = self.multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
		let base = self.base_delay.saturating_mul(factor);
		let jitter_cap = (base.as_millis() as u64 / 10).max(1);
		base + Duration::from_millis(rand::random::<u64>() % jitter_cap)
	}
}

#[allow(clippy::too_many_arguments)]
pub async fn ask_with_retry<T: Transport>(
	transport: &T,
	provider: Provider,
	base_url: Option<&str>,
	prompt: &PromptPayload,
	models: &[String],
	keys: &[String],
	affinity: KeyAffinity,
	policy: RetryPolicy,
) -> Result<RoutedAnswer, RouterError> {
	let attempts = policy.max_attempts.max(1);
	let mut attempt = 1;
	loop {
		match ask(transport, provider, base_url, prompt, models, keys, affinity).await {
			Err(RouterError::Exhausted { transient: true, last_error }) if attempt < attempts => {
				let delay = policy.delay(attempt);
				tracing::warn!(
					"Transient failure ({}), retrying in {:?} (attempt {}/{})",
					last_error.as_deref().unwrap_or("unknown"),
					delay,
					attempt + 1,
					attempts
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
			result => return result,
		}
	}
}
