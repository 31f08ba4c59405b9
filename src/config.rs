use v_utils::macros::{MyConfigPrimitives, Settings};

#[derive(Clone, Debug, Default, MyConfigPrimitives, Settings)]
pub struct AppConfig {
	/// API keys, tried in order starting from the last one that worked
	#[serde(default)]
	pub api_keys: Vec<String>,
	/// LLM provider: "gemini" or "openrouter" (default: gemini)
	#[serde(default)]
	pub provider: Option<String>,
	/// Models in priority order (default: provider-specific)
	#[serde(default)]
	pub models: Vec<String>,
	/// Override of the provider endpoint
	#[serde(default)]
	pub api_base_url: Option<String>,
	/// Pause between two questions, to stay under provider rate limits (default: 1000)
	#[serde(default = "default_question_delay_ms")]
	pub question_delay_ms: u64,
	/// Number of attempts for transient network errors (default: 3)
	#[serde(default = "default_api_retries")]
	pub api_retries: u32,
	/// Base delay in ms between API retries, doubled on every attempt (default: 1000)
	#[serde(default = "default_api_retry_delay_ms")]
	pub api_retry_delay_ms: u64,
	/// Timeout for a single image fetch or model call (default: 60)
	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,
	/// Draw markers next to the chosen options (default: true)
	#[serde(default = "default_true")]
	pub visual_markers: bool,
	/// CSS colour of the option markers (default: #888888)
	#[serde(default)]
	pub marker_color: Option<String>,
	/// Reuse answers for questions already solved in an earlier run (default: true)
	#[serde(default = "default_true")]
	pub answer_cache: bool,
	/// Run with visible browser window (non-headless mode)
	#[serde(default)]
	pub visible: bool,
	/// Command to run on completion/error (receives message as argument)
	#[serde(default)]
	pub stop_hook: Option<String>,
}

fn default_question_delay_ms() -> u64 {
	1000
}

fn default_api_retries() -> u32 {
	3
}

fn default_api_retry_delay_ms() -> u64 {
	1000
}

fn default_request_timeout_secs() -> u64 {
	60
}

fn default_true() -> bool {
	true
}
