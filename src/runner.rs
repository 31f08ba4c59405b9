//! Page driver: extract, ask, apply, one question at a time

#[cfg(feature = "xdg")]
use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{Result, eyre::eyre};
#[cfg(feature = "xdg")]
use v_utils::xdg_state_dir;
use v_utils::{elog, log};

use crate::{
	Question, QuestionKind,
	apply::{ApplyOptions, DEFAULT_MARKER_COLOR, apply},
	cache::AnswerCache,
	config::AppConfig,
	extract::extract_questions,
	llm::{KeyAffinity, Provider, RetryPolicy, Transport, ask_with_retry},
	media::ImageResolver,
	page::{PageSurface, tone},
	prompt::{self, Geometry},
};

/// Run the stop hook with a message if configured
pub fn run_stop_hook(config: &AppConfig, message: &str) {
	if let Some(ref hook) = config.stop_hook {
		log!("Running stop hook: {} {:?}", hook, message);
		// Escape single quotes for shell: replace ' with '\''
		let escaped = message.replace('\'', "'\\''");
		let _ = tokio::process::Command::new("sh").arg("-c").arg(format!("{} '{}'", hook, escaped)).spawn();
	}
}

/// Outcome of one pass over a page
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageReport {
	pub found: usize,
	pub solved: usize,
	/// The model replied but selected nothing
	pub unanswered: usize,
	pub failed: usize,
}

/// How a single question ended; carries whatever produced the reply
enum Outcome {
	Solved(String),
	NoAnswer(String),
}

/// Page decorations are best effort: a vanished node must not cost the answer
fn cosmetic(result: Result<()>, what: &str) {
	if let Err(e) = result {
		tracing::warn!("Failed to {}: {}", what, e);
	}
}

/// Long-lived state of the answering loop: model pool, key affinity, cache
pub struct Solver<T: Transport> {
	transport: T,
	resolver: ImageResolver,
	provider: Provider,
	base_url: Option<String>,
	models: Vec<String>,
	keys: Vec<String>,
	affinity: KeyAffinity,
	retry: RetryPolicy,
	apply: ApplyOptions,
	question_delay: Duration,
	cache: Option<AnswerCache>,
}

impl<T: Transport> Solver<T> {
	pub fn new(config: &AppConfig, transport: T, resolver: ImageResolver, cache: Option<AnswerCache>) -> Result<Self> {
		let provider: Provider = config.provider.as_deref().unwrap_or("gemini").parse()?;
		let models = if config.models.is_empty() { provider.default_models() } else { config.models.clone() };
		let keys: Vec<String> = config.api_keys.iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect();
		if keys.is_empty() {
			return Err(eyre!("No API keys configured (set api_keys in the config)"));
		}

		Ok(Self {
			transport,
			resolver,
			provider,
			base_url: config.api_base_url.clone(),
			models,
			keys,
			affinity: KeyAffinity::default(),
			retry: RetryPolicy {
				max_attempts: config.api_retries.max(1),
				base_delay: Duration::from_millis(config.api_retry_delay_ms),
				multiplier: 2,
			},
			apply: ApplyOptions {
				visual_markers: config.visual_markers,
				marker_color: config.marker_color.clone().unwrap_or_else(|| DEFAULT_MARKER_COLOR.to_string()),
			},
			question_delay: Duration::from_millis(config.question_delay_ms),
			cache,
		})
	}

	/// Solve every question on the current page, or only question `only`.
	///
	/// Questions are handled strictly in order with `question_delay` between them. A failing question is reported on the
	/// page and in the log, then the next one is tried.
	pub async fn solve_page<S: PageSurface>(&mut self, surface: &S, only: Option<usize>) -> Result<PageReport> {
		cosmetic(surface.clear_overlays().await, "clear overlays");
		let url = surface.current_url().await?;
		let html = surface.snapshot_html().await?;

		let mut questions = extract_questions(&html);
		if let Some(n) = only {
			questions.retain(|q| q.number == n);
		}
		let mut report = PageReport {
			found: questions.len(),
			..Default::default()
		};
		if questions.is_empty() {
			log!("No questions found on this page.");
			return Ok(report);
		}

		tracing::info!("Found {} question(s) on {}", questions.len(), url);
		let resolver = self.resolver.clone().with_base_url(&url);

		for (i, question) in questions.iter().enumerate() {
			if i > 0 && !self.question_delay.is_zero() {
				tokio::time::sleep(self.question_delay).await;
			}
			log!("\n==================== Q{} {} ====================", question.number, question.kind().marker());
			eprintln!("{question}");

			cosmetic(surface.show_status(&format!("Thinking Q{}...", question.number), tone::INFO).await, "show status");
			if let Some(container) = &question.container {
				cosmetic(surface.set_dimmed(container, true).await, "dim question");
			}

			let outcome = self.solve_question(surface, &resolver, question).await;

			if let Some(container) = &question.container {
				cosmetic(surface.set_dimmed(container, false).await, "undim question");
			}
			let status = match outcome {
				Ok(Outcome::Solved(model)) => {
					report.solved += 1;
					surface.show_status(&format!("Q{} solved via {}", question.number, model), tone::DONE).await
				}
				Ok(Outcome::NoAnswer(model)) => {
					report.unanswered += 1;
					elog!("Q{}: {} selected nothing", question.number, model);
					surface.show_status(&format!("No answer for Q{}", question.number), tone::WARN).await
				}
				Err(e) => {
					report.failed += 1;
					elog!("Could not solve Q{}: {}", question.number, e);
					surface.show_status(&format!("Could not solve Q{}", question.number), tone::ERROR).await
				}
			};
			cosmetic(status, "show status");
		}

		log!("Page done: {}/{} solved", report.solved, report.found);
		Ok(report)
	}

	async fn solve_question<S: PageSurface>(&mut self, surface: &S, resolver: &ImageResolver, question: &Question) -> Result<Outcome> {
		let geometry = if question.kind() == QuestionKind::DragAndDrop { measure(surface, question).await? } else { Geometry::new() };
		let payload = prompt::build(question, resolver, &geometry).await;
		let fingerprint = payload.fingerprint();

		let cached = self.cache.as_ref().and_then(|c| c.get(&fingerprint)).map(|e| (e.answer.clone(), e.model.clone()));
		let (answer, model) = match cached {
			Some((answer, model)) => {
				tracing::info!("Q{}: answer cached from {}", question.number, model);
				(answer, format!("{model} (cached)"))
			}
			None => {
				let routed = ask_with_retry(
					&self.transport,
					self.provider,
					self.base_url.as_deref(),
					&payload,
					&self.models,
					&self.keys,
					self.affinity,
					self.retry,
				)
				.await
				.map_err(|e| eyre!(e))?;
				self.affinity = routed.affinity();
				if routed.answer.is_empty() {
					return Ok(Outcome::NoAnswer(routed.model));
				}
				if let Some(cache) = self.cache.as_mut()
					&& let Err(e) = cache.insert(fingerprint, routed.answer.clone(), &routed.model)
				{
					tracing::warn!("Failed to update answer cache: {}", e);
				}
				(routed.answer, routed.model)
			}
		};

		log!("Q{} answer: {}", question.number, answer);
		let summary = apply(surface, question, &answer, &self.apply).await?;
		tracing::debug!("Q{} applied: {:?}", question.number, summary);
		Ok(Outcome::Solved(model))
	}
}

/// Page boxes of the background and drop zones of a drag-and-drop question
async fn measure<S: PageSurface>(surface: &S, question: &Question) -> Result<Geometry> {
	let mut geometry = Geometry::new();
	let Some(task) = question.drag_drop() else {
		return Ok(geometry);
	};
	let elements = std::iter::once(&task.background_element).chain(task.zones.iter().map(|z| &z.element));
	for el in elements {
		if let Some(rect) = surface.bounding_box(el).await? {
			geometry.insert(el.clone(), rect);
		}
	}
	Ok(geometry)
}

/// Extract and print the questions without asking anything
pub async fn list_questions<S: PageSurface>(surface: &S) -> Result<Vec<Question>> {
	let html = surface.snapshot_html().await?;
	let questions = extract_questions(&html);
	for question in &questions {
		log!("\n==================== Q{} {} ====================", question.number, question.kind().marker());
		eprintln!("{question}");
	}
	Ok(questions)
}

/// Block until the page URL changes, then give the new page a moment to settle
pub async fn wait_for_page_change<S: PageSurface>(surface: &S) -> Result<()> {
	let initial_url = surface.current_url().await?;

	loop {
		tokio::time::sleep(Duration::from_millis(500)).await;

		let current_url = surface.current_url().await?;

		if current_url != initial_url {
			tokio::time::sleep(Duration::from_secs(1)).await;
			return Ok(());
		}
	}
}

#[cfg(feature = "xdg")]
pub async fn save_page_html<S: PageSurface>(surface: &S, session_id: &str) -> Result<PathBuf> {
	let html_dir = xdg_state_dir!("persist_htmls").join(session_id);
	std::fs::create_dir_all(&html_dir).map_err(|e| eyre!("Failed to create HTML dir: {}", e))?;

	let url = surface.current_url().await.unwrap_or_default();
	let label = url.replace("https://", "").replace("http://", "");
	let html = surface.snapshot_html().await?;

	let timestamp = chrono::Utc::now().timestamp();
	let safe_label: String = label.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();

	let filepath = html_dir.join(format!("{}_{}.html", timestamp, safe_label));
	std::fs::write(&filepath, html).map_err(|e| eyre!("Failed to write HTML file: {}", e))?;

	log!("Saved page HTML to: {}", filepath.display());
	Ok(filepath)
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use serde_json::json;

	use super::*;
	use crate::{
		ElementHandle,
		llm::{ProviderCall, TransportResponse},
		page::{BadgeTone, Rect, fake::RecordingSurface},
	};

	/// Answers by looking for a needle in the prompt text
	struct ScriptedTransport {
		script: Vec<(&'static str, u16, String)>,
		prompts: Mutex<Vec<String>>,
	}

	impl ScriptedTransport {
		fn new(script: Vec<(&'static str, u16, &str)>) -> Self {
			let script = script
				.into_iter()
				.map(|(needle, status, text)| {
					let body = if status == 200 { json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] }).to_string() } else { text.to_string() };
					(needle, status, body)
				})
				.collect();
			Self {
				script,
				prompts: Mutex::default(),
			}
		}
	}

	impl Transport for ScriptedTransport {
		async fn send(&self, call: &ProviderCall) -> Result<TransportResponse> {
			let text = call.body["contents"][0]["parts"][0]["text"].as_str().unwrap_or_default().to_string();
			self.prompts.lock().unwrap().push(text.clone());
			let (_, status, body) = self.script.iter().find(|(needle, ..)| text.contains(needle)).expect("prompt matches a scripted reply");
			Ok(TransportResponse {
				status: *status,
				body: body.clone(),
			})
		}
	}

	fn config() -> AppConfig {
		AppConfig {
			api_keys: vec!["k1".into()],
			provider: Some("gemini".into()),
			models: vec!["m1".into()],
			api_retries: 1,
			visual_markers: true,
			..Default::default()
		}
	}

	fn solver(transport: ScriptedTransport, cache: Option<AnswerCache>) -> Solver<ScriptedTransport> {
		let resolver = ImageResolver::new(Duration::from_secs(1)).unwrap();
		Solver::new(&config(), transport, resolver, cache).unwrap()
	}

	fn block(label: &str) -> String {
		format!(
			r#"<table class="question"><tbody><tr><td class="text">{label}</td></tr></tbody></table>
			<table class="answer" data-qtype="1"><tbody>
				<tr><td class="num">A.</td><td class="text">yes</td><td><input type="radio" name="{label}"></td></tr>
				<tr><td class="num">B.</td><td class="text">no</td><td><input type="radio" name="{label}"></td></tr>
			</tbody></table>"#
		)
	}

	fn two_question_page() -> String {
		format!("<html><body>{}{}</body></html>", block("Broken question?"), block("Fine question?"))
	}

	#[tokio::test]
	async fn one_failure_does_not_stop_the_page() {
		let html = two_question_page();
		let surface = RecordingSurface::with_html(&html);
		let transport = ScriptedTransport::new(vec![("Broken question?", 400, "invalid argument"), ("Fine question?", 200, r#"{"correct":["B"]}"#)]);
		let mut solver = solver(transport, None);

		let report = solver.solve_page(&surface, None).await.unwrap();

		assert_eq!(
			report,
			PageReport {
				found: 2,
				solved: 1,
				unanswered: 0,
				failed: 1
			}
		);
		let questions = extract_questions(&html);
		assert!(!surface.is_checked_now(&questions[0].options()[1].input));
		assert!(surface.is_checked_now(&questions[1].options()[1].input));

		let state = surface.state.lock().unwrap();
		assert_eq!(state.clears, 1);
		let colors: Vec<&str> = state.statuses.iter().map(|(_, c)| c.as_str()).collect();
		assert_eq!(colors, vec![tone::INFO, tone::ERROR, tone::INFO, tone::DONE]);
		assert_eq!(state.statuses[1].0, "Could not solve Q1");
		assert!(state.dimmed.is_empty());
	}

	#[tokio::test]
	async fn single_question_mode() {
		let surface = RecordingSurface::with_html(&two_question_page());
		let transport = ScriptedTransport::new(vec![("Fine question?", 200, r#"{"correct":["A"]}"#)]);
		let mut solver = solver(transport, None);

		let report = solver.solve_page(&surface, Some(2)).await.unwrap();

		assert_eq!(
			report,
			PageReport {
				found: 1,
				solved: 1,
				..Default::default()
			}
		);
		assert_eq!(solver.transport.prompts.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn empty_page_reports_nothing() {
		let surface = RecordingSurface::with_html("<html><body><p>Welcome</p></body></html>");
		let mut solver = solver(ScriptedTransport::new(vec![]), None);

		let report = solver.solve_page(&surface, None).await.unwrap();

		assert_eq!(report, PageReport::default());
		assert!(surface.state.lock().unwrap().statuses.is_empty());
	}

	#[tokio::test]
	async fn cached_answers_skip_the_model() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("answers.json");
		let html = format!("<html><body>{}</body></html>", block("Fine question?"));

		let transport = ScriptedTransport::new(vec![("Fine question?", 200, r#"{"correct":["A"]}"#)]);
		let mut first = solver(transport, Some(AnswerCache::open(&path).unwrap()));
		first.solve_page(&RecordingSurface::with_html(&html), None).await.unwrap();
		assert_eq!(first.transport.prompts.lock().unwrap().len(), 1);

		let cache = AnswerCache::open(&path).unwrap();
		assert_eq!(cache.len(), 1);
		let mut second = solver(ScriptedTransport::new(vec![]), Some(cache));
		let surface = RecordingSurface::with_html(&html);
		let report = second.solve_page(&surface, None).await.unwrap();

		assert_eq!(report.solved, 1);
		assert!(second.transport.prompts.lock().unwrap().is_empty());
		let questions = extract_questions(&html);
		assert!(surface.is_checked_now(&questions[0].options()[0].input));
		let entry = AnswerCache::open(&path).unwrap();
		assert_eq!(entry.len(), 1);
	}

	/// Recording surface whose first dimming call fails, as when the node is replaced under us
	struct FlakySurface {
		inner: RecordingSurface,
		dim_failed: Mutex<bool>,
	}

	impl PageSurface for FlakySurface {
		async fn current_url(&self) -> Result<String> {
			self.inner.current_url().await
		}

		async fn snapshot_html(&self) -> Result<String> {
			self.inner.snapshot_html().await
		}

		async fn is_checked(&self, el: &ElementHandle) -> Result<bool> {
			self.inner.is_checked(el).await
		}

		async fn click(&self, el: &ElementHandle) -> Result<()> {
			self.inner.click(el).await
		}

		async fn has_marker(&self, el: &ElementHandle) -> Result<bool> {
			self.inner.has_marker(el).await
		}

		async fn append_marker(&self, el: &ElementHandle, color: &str, title: &str) -> Result<()> {
			self.inner.append_marker(el, color, title).await
		}

		async fn bounding_box(&self, el: &ElementHandle) -> Result<Option<Rect>> {
			self.inner.bounding_box(el).await
		}

		async fn place_badge(&self, rect: Rect, label: &str, tone: BadgeTone) -> Result<()> {
			self.inner.place_badge(rect, label, tone).await
		}

		async fn show_panel(&self, title: &str, lines: &[String]) -> Result<()> {
			self.inner.show_panel(title, lines).await
		}

		async fn clear_overlays(&self) -> Result<()> {
			self.inner.clear_overlays().await
		}

		async fn show_status(&self, message: &str, color: &str) -> Result<()> {
			self.inner.show_status(message, color).await
		}

		async fn set_dimmed(&self, el: &ElementHandle, dimmed: bool) -> Result<()> {
			let first = !std::mem::replace(&mut *self.dim_failed.lock().unwrap(), true);
			if first {
				return Err(eyre!("node gone"));
			}
			self.inner.set_dimmed(el, dimmed).await
		}
	}

	#[tokio::test]
	async fn page_effect_errors_do_not_stop_the_batch() {
		let html = two_question_page();
		let surface = FlakySurface {
			inner: RecordingSurface::with_html(&html),
			dim_failed: Mutex::new(false),
		};
		let transport = ScriptedTransport::new(vec![("Broken question?", 200, r#"{"correct":["A"]}"#), ("Fine question?", 200, r#"{"correct":["B"]}"#)]);
		let mut solver = solver(transport, None);

		let report = solver.solve_page(&surface, None).await.unwrap();

		assert_eq!(report.solved, 2);
		let questions = extract_questions(&html);
		assert!(surface.inner.is_checked_now(&questions[0].options()[0].input));
		assert!(surface.inner.is_checked_now(&questions[1].options()[1].input));
	}

	#[tokio::test]
	async fn empty_reply_is_reported_as_no_answer() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("answers.json");
		let html = format!("<html><body>{}</body></html>", block("Fine question?"));
		let surface = RecordingSurface::with_html(&html);
		let transport = ScriptedTransport::new(vec![("Fine question?", 200, r#"{"correct":[]}"#)]);
		let mut solver = solver(transport, Some(AnswerCache::open(&path).unwrap()));

		let report = solver.solve_page(&surface, None).await.unwrap();

		assert_eq!(
			report,
			PageReport {
				found: 1,
				unanswered: 1,
				..Default::default()
			}
		);
		let state = surface.state.lock().unwrap();
		assert_eq!(state.statuses.last().unwrap(), &("No answer for Q1".to_string(), tone::WARN.to_string()));
		assert!(state.clicks.is_empty());
		assert!(AnswerCache::open(&path).unwrap().is_empty());
	}

	#[test]
	fn missing_keys_are_rejected() {
		let resolver = ImageResolver::new(Duration::from_secs(1)).unwrap();
		let config = AppConfig {
			api_keys: vec!["  ".into()],
			..config()
		};
		assert!(Solver::new(&config, ScriptedTransport::new(vec![]), resolver, None).is_err());
	}

	#[tokio::test]
	async fn unset_provider_and_colour_fall_back_to_defaults() {
		let config = AppConfig {
			provider: None,
			models: vec![],
			marker_color: None,
			..config()
		};
		let resolver = ImageResolver::new(Duration::from_secs(1)).unwrap();
		let solver = Solver::new(&config, ScriptedTransport::new(vec![]), resolver, None).unwrap();

		assert_eq!(solver.provider, Provider::Gemini);
		assert_eq!(solver.models, Provider::Gemini.default_models());
		assert_eq!(solver.apply.marker_color, DEFAULT_MARKER_COLOR);
	}

	#[test]
	fn unknown_provider_is_rejected() {
		let resolver = ImageResolver::new(Duration::from_secs(1)).unwrap();
		let config = AppConfig {
			provider: Some("carrier-pigeon".into()),
			..config()
		};
		assert!(Solver::new(&config, ScriptedTransport::new(vec![]), resolver, None).is_err());
	}
}
