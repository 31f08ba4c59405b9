use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use clap::Parser;
use color_eyre::{Result, eyre::eyre};
use futures::StreamExt;
use quiz_pilot::{
	cache::AnswerCache,
	config::{AppConfig, SettingsFlags},
	llm::HttpTransport,
	media::ImageResolver,
	page::{PageSurface, tone},
	runner::{Solver, list_questions, run_stop_hook, wait_for_page_change},
};
use tracing_subscriber::EnvFilter;
use v_utils::{elog, log};

#[derive(Debug, Parser)]
#[command(name = "quiz_pilot")]
#[command(about = "Answers quiz pages with a multimodal LLM", long_about = None)]
struct Args {
	/// Quiz page to open
	target_url: String,

	/// Run with visible browser window (non-headless mode)
	#[arg(long)]
	visible: bool,

	/// Only print the extracted questions, do not ask the model
	#[arg(long)]
	no_llm: bool,

	/// Solve the current page and exit instead of following navigation
	#[arg(long)]
	once: bool,

	/// Only solve the question with this number
	#[arg(short, long)]
	question: Option<usize>,

	#[command(flatten)]
	settings_flags: SettingsFlags,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let config = AppConfig::try_build(args.settings_flags.clone())?;
	let visible = args.visible || config.visible;

	let browser_config = if visible {
		BrowserConfig::builder().with_head().build()
	} else {
		BrowserConfig::builder().build()
	}
	.map_err(|e| eyre!("Failed to build browser config: {}", e))?;

	let (mut browser, mut handler) = Browser::launch(browser_config).await.map_err(|e| eyre!("Failed to launch browser: {}", e))?;
	let handle = tokio::spawn(async move {
		while let Some(_event) = handler.next().await {
			// Silently consume events to prevent the browser from hanging
		}
	});

	let page = browser.new_page("about:blank").await.map_err(|e| eyre!("Failed to create new page: {}", e))?;
	log!("Navigating to {}...", args.target_url);
	page.goto(args.target_url.as_str()).await.map_err(|e| eyre!("Failed to navigate: {}", e))?;
	tokio::time::sleep(Duration::from_secs(2)).await;

	let result = if args.no_llm { list_questions(&page).await.map(|_| ()) } else { drive(&page, &config, &args).await };

	browser.close().await.ok();
	handle.await.ok();
	result
}

async fn drive(page: &chromiumoxide::Page, config: &AppConfig, args: &Args) -> Result<()> {
	let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
	let transport = HttpTransport::new(timeout)?;
	let resolver = ImageResolver::new(timeout)?;
	let cache = if config.answer_cache { open_cache() } else { None };
	let mut solver = Solver::new(config, transport, resolver, cache)?;

	#[cfg(feature = "xdg")]
	let session_id = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
	loop {
		#[cfg(feature = "xdg")]
		if let Err(e) = quiz_pilot::runner::save_page_html(page, &session_id).await {
			elog!("Failed to save page HTML: {e}");
		}

		match solver.solve_page(page, args.question).await {
			Ok(report) if report.found > 0 => run_stop_hook(config, &format!("{}/{} questions answered", report.solved, report.found)),
			Ok(_) => {}
			Err(e) if args.once => return Err(e),
			Err(e) => elog!("Page pass failed: {e}"),
		}
		if args.once {
			return Ok(());
		}

		log!("Waiting for page change...");
		wait_for_page_change(page).await?;
		if let Err(e) = page.show_status("Page changed, re-reading questions", tone::INFO).await {
			tracing::warn!("Failed to show status: {}", e);
		}
	}
}

#[cfg(feature = "xdg")]
fn open_cache() -> Option<AnswerCache> {
	match AnswerCache::open(AnswerCache::default_path()) {
		Ok(cache) => Some(cache),
		Err(e) => {
			elog!("Answer cache disabled: {e}");
			None
		}
	}
}

#[cfg(not(feature = "xdg"))]
fn open_cache() -> Option<AnswerCache> {
	None
}
