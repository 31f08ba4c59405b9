//! Writes a model answer back onto the live page

use color_eyre::Result;

use crate::{
	AnswerResult, DragDropTask, Placement, Question,
	page::{BadgeTone, PageSurface},
};

pub const DEFAULT_MARKER_COLOR: &str = "#888888";

#[derive(Clone, Debug)]
pub struct ApplyOptions {
	pub visual_markers: bool,
	pub marker_color: String,
}

impl Default for ApplyOptions {
	fn default() -> Self {
		Self {
			visual_markers: true,
			marker_color: DEFAULT_MARKER_COLOR.to_string(),
		}
	}
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplySummary {
	/// Option ids whose input was clicked during this call
	pub clicked: Vec<String>,
	/// Option ids that received a new marker
	pub marked: Vec<String>,
	/// Ids (or `zone:item` pairs) that matched nothing on the page
	pub ignored: Vec<String>,
	pub badges: usize,
}

/// Apply `answer` to `question`. Safe to call repeatedly with the same inputs.
pub async fn apply<S: PageSurface>(surface: &S, question: &Question, answer: &AnswerResult, options: &ApplyOptions) -> Result<ApplySummary> {
	match (answer, question.drag_drop()) {
		(AnswerResult::Choice { correct, reason }, None) => apply_choice(surface, question, correct, reason.as_deref(), options).await,
		(AnswerResult::DragAndDrop { placements, .. }, Some(task)) => apply_drag_drop(surface, question.number, task, placements).await,
		_ => {
			tracing::warn!("Q{}: answer shape does not match a {:?} question, ignoring", question.number, question.kind());
			Ok(ApplySummary {
				ignored: vec![answer.to_string()],
				..Default::default()
			})
		}
	}
}

async fn apply_choice<S: PageSurface>(surface: &S, question: &Question, correct: &[String], reason: Option<&str>, options: &ApplyOptions) -> Result<ApplySummary> {
	let mut summary = ApplySummary::default();
	let color = if options.marker_color.is_empty() { DEFAULT_MARKER_COLOR } else { &options.marker_color };
	let title = reason.unwrap_or("Suggested answer");

	for id in correct {
		let Some(option) = question.options().iter().find(|o| &o.id == id) else {
			summary.ignored.push(id.clone());
			continue;
		};

		if !surface.is_checked(&option.input).await? {
			surface.click(&option.input).await?;
			summary.clicked.push(id.clone());
		}

		if options.visual_markers {
			let target = option.text_node.as_ref().unwrap_or(&option.input);
			if !surface.has_marker(target).await? {
				surface.append_marker(target, color, title).await?;
				summary.marked.push(id.clone());
			}
		}
	}

	if !summary.ignored.is_empty() {
		tracing::warn!("Q{}: model picked unknown option(s) {:?}", question.number, summary.ignored);
	}
	Ok(summary)
}

async fn apply_drag_drop<S: PageSurface>(surface: &S, number: usize, task: &DragDropTask, placements: &[Placement]) -> Result<ApplySummary> {
	let mut summary = ApplySummary::default();
	let mut lines = Vec::new();

	for placement in placements {
		let zone = task.zones.iter().find(|z| z.index == placement.zone);
		let item = task.items.iter().find(|i| i.id == placement.item);
		let (Some(zone), Some(item)) = (zone, item) else {
			summary.ignored.push(format!("{}:{}", placement.zone, placement.item));
			continue;
		};

		if let Some(rect) = surface.bounding_box(&zone.element).await? {
			surface.place_badge(rect, &item.id, BadgeTone::Zone).await?;
			summary.badges += 1;
		}
		for el in &item.elements {
			if let Some(rect) = surface.bounding_box(el).await? {
				surface.place_badge(rect, &format!("{} → {}", item.id, zone.index), BadgeTone::Item).await?;
				summary.badges += 1;
			}
		}

		let label = if item.text.is_empty() { "image".to_string() } else { item.text.clone() };
		lines.push(format!("Zone {} → {} ({})", zone.index, item.id, label));
	}

	if !lines.is_empty() {
		surface.show_panel(&format!("Q{number}: drag items"), &lines).await?;
	}
	if !summary.ignored.is_empty() {
		tracing::warn!("Q{}: placements refer to unknown zones or items {:?}", number, summary.ignored);
	}
	Ok(summary)
}
