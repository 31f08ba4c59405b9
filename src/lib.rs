use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};

pub mod apply;
pub mod cache;
pub mod config;
pub mod extract;
pub mod llm;
pub mod media;
pub mod page;
pub mod prompt;
pub mod runner;

/// Opaque reference to a node of the live page.
///
/// Holds a `nth-child` selector path computed from the snapshot the question was extracted from, so it is only
/// meaningful until the page mutates structurally or navigates. Never persist it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ElementHandle(String);

impl ElementHandle {
	pub fn from_selector(selector: impl Into<String>) -> Self {
		Self(selector.into())
	}

	pub fn selector(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ElementHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Represents an image in a question
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, new)]
pub struct Image {
	/// Raw `src` of the image, a URL (possibly relative) or a data URI
	pub src: String,
	/// Alt text if available
	pub alt: Option<String>,
}

/// One selectable answer, bound to the page input that selects it
#[derive(Clone, Debug)]
pub struct AnswerOption {
	/// Letter identifier shown to the model ("A", "B", ...)
	pub id: String,
	pub text: String,
	pub image: Option<Image>,
	/// The radio/checkbox to click
	pub input: ElementHandle,
	/// Where visual markers are appended
	pub text_node: Option<ElementHandle>,
}

/// Numbered drop target of a drag-and-drop task
#[derive(Clone, Debug, new)]
pub struct DropZone {
	/// 1-based, in DOM order
	pub index: usize,
	pub element: ElementHandle,
}

/// A logical draggable item; reused copies of the same item are collapsed into one
#[derive(Clone, Debug)]
pub struct DraggableItem {
	pub id: String,
	pub text: String,
	pub image: Option<Image>,
	/// Every DOM occurrence of this item
	pub elements: Vec<ElementHandle>,
}

#[derive(Clone, Debug)]
pub struct DragDropTask {
	pub background: Image,
	pub background_element: ElementHandle,
	pub zones: Vec<DropZone>,
	pub items: Vec<DraggableItem>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuestionKind {
	SingleChoice,
	MultiChoice,
	DragAndDrop,
}

impl QuestionKind {
	pub fn marker(&self) -> &'static str {
		match self {
			QuestionKind::SingleChoice => "[single]",
			QuestionKind::MultiChoice => "[multi]",
			QuestionKind::DragAndDrop => "[drag]",
		}
	}
}

/// Represents different shapes of quiz question bodies
#[derive(Clone, Debug)]
pub enum QuestionBody {
	/// Radio buttons, one answer
	SingleChoice { options: Vec<AnswerOption> },
	/// Checkboxes, several answers
	MultiChoice { options: Vec<AnswerOption> },
	DragAndDrop(DragDropTask),
}

/// One scraped quiz item
#[derive(Clone, Debug)]
pub struct Question {
	/// Ordinal position on the page
	pub number: usize,
	pub text: String,
	/// Images in the question text (not in options)
	pub images: Vec<Image>,
	/// Outer element of the question, dimmed while the model is thinking
	pub container: Option<ElementHandle>,
	pub body: QuestionBody,
}

impl Question {
	pub fn kind(&self) -> QuestionKind {
		match self.body {
			QuestionBody::SingleChoice { .. } => QuestionKind::SingleChoice,
			QuestionBody::MultiChoice { .. } => QuestionKind::MultiChoice,
			QuestionBody::DragAndDrop(_) => QuestionKind::DragAndDrop,
		}
	}

	/// Get options for this question (empty for drag-and-drop)
	pub fn options(&self) -> &[AnswerOption] {
		match &self.body {
			QuestionBody::SingleChoice { options } | QuestionBody::MultiChoice { options } => options,
			QuestionBody::DragAndDrop(_) => &[],
		}
	}

	pub fn drag_drop(&self) -> Option<&DragDropTask> {
		match &self.body {
			QuestionBody::DragAndDrop(task) => Some(task),
			_ => None,
		}
	}

	/// Returns true if this is a multi-choice (checkbox) question
	pub fn is_multi(&self) -> bool {
		matches!(self.body, QuestionBody::MultiChoice { .. })
	}
}

impl fmt::Display for Question {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{}", self.text)?;
		writeln!(f)?;
		match &self.body {
			QuestionBody::SingleChoice { options } =>
				for option in options {
					writeln!(f, "( ) {}. {}", option.id, option.text)?;
				},
			QuestionBody::MultiChoice { options } =>
				for option in options {
					writeln!(f, "[ ] {}. {}", option.id, option.text)?;
				},
			QuestionBody::DragAndDrop(task) => {
				for item in &task.items {
					if item.text.is_empty() {
						writeln!(f, "  <{}> (image)", item.id)?;
					} else {
						writeln!(f, "  <{}> {}", item.id, item.text)?;
					}
				}
				writeln!(f, "  {} drop zone(s)", task.zones.len())?;
			}
		}
		Ok(())
	}
}

/// One (zone, item) assignment of a drag-and-drop answer
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Placement {
	pub zone: usize,
	pub item: String,
}

/// The model's structured answer for one question
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnswerResult {
	Choice {
		correct: Vec<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	DragAndDrop {
		placements: Vec<Placement>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
}

impl AnswerResult {
	/// Parse a raw model reply for a question of `kind`.
	///
	/// Markdown code fences are stripped first, models wrap JSON in them despite being told not to.
	pub fn parse(kind: QuestionKind, raw: &str) -> Result<Self, serde_json::Error> {
		#[derive(Deserialize)]
		struct ChoiceReply {
			correct: Vec<serde_json::Value>,
			#[serde(default)]
			reason: Option<String>,
		}
		#[derive(Deserialize)]
		struct DragReply {
			placements: Vec<Placement>,
			#[serde(default)]
			reason: Option<String>,
		}

		let json = strip_code_fences(raw);
		match kind {
			QuestionKind::SingleChoice | QuestionKind::MultiChoice => {
				let reply: ChoiceReply = serde_json::from_str(json)?;
				let correct = reply
					.correct
					.iter()
					.filter_map(|v| match v {
						serde_json::Value::String(s) => Some(normalize_id(s)),
						serde_json::Value::Number(n) => Some(n.to_string()),
						_ => None,
					})
					.filter(|id| !id.is_empty())
					.collect();
				Ok(AnswerResult::Choice { correct, reason: reply.reason })
			}
			QuestionKind::DragAndDrop => {
				let reply: DragReply = serde_json::from_str(json)?;
				let placements = reply
					.placements
					.into_iter()
					.map(|p| Placement {
						zone: p.zone,
						item: normalize_id(&p.item),
					})
					.collect();
				Ok(AnswerResult::DragAndDrop { placements, reason: reply.reason })
			}
		}
	}

	/// The model answered but picked nothing
	pub fn is_empty(&self) -> bool {
		match self {
			AnswerResult::Choice { correct, .. } => correct.is_empty(),
			AnswerResult::DragAndDrop { placements, .. } => placements.is_empty(),
		}
	}

	pub fn reason(&self) -> Option<&str> {
		match self {
			AnswerResult::Choice { reason, .. } | AnswerResult::DragAndDrop { reason, .. } => reason.as_deref(),
		}
	}
}

impl fmt::Display for AnswerResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AnswerResult::Choice { correct, .. } => write!(f, "{}", correct.join(", "))?,
			AnswerResult::DragAndDrop { placements, .. } => {
				let pairs: Vec<String> = placements.iter().map(|p| format!("{} -> {}", p.zone, p.item)).collect();
				write!(f, "{}", pairs.join(", "))?;
			}
		}
		if let Some(reason) = self.reason() {
			write!(f, " ({reason})")?;
		}
		Ok(())
	}
}

/// "b." / " B) " -> "B"
fn normalize_id(raw: &str) -> String {
	raw.trim().trim_end_matches(['.', ')']).trim().to_uppercase()
}

/// Remove a surrounding ```json ... ``` block, if any
pub fn strip_code_fences(raw: &str) -> &str {
	let trimmed = raw.trim();
	let Some(rest) = trimmed.strip_prefix("```") else {
		return trimmed;
	};
	// drop the language tag line
	let rest = match rest.find('\n') {
		Some(nl) => &rest[nl + 1..],
		None => rest,
	};
	rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Uppercase letter for a 0-based position, "A".."Z", then "AA", "AB", ...
pub fn letter_id(idx: usize) -> String {
	let mut n = idx;
	let mut out = Vec::new();
	loop {
		out.push((b'A' + (n % 26) as u8) as char);
		if n < 26 {
			break;
		}
		n = n / 26 - 1;
	}
	out.iter().rev().collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_fenced_json() {
		assert_eq!(strip_code_fences("```json\n{\"correct\": [\"B\"]}\n```"), "{\"correct\": [\"B\"]}");
		assert_eq!(strip_code_fences("```{\"a\":1}```"), "{\"a\":1}");
		assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
	}

	#[test]
	fn parses_choice_reply_with_sloppy_ids() {
		let answer = AnswerResult::parse(QuestionKind::MultiChoice, r#"{"correct": ["b.", " c) "], "reason": "because"}"#).unwrap();
		assert_eq!(
			answer,
			AnswerResult::Choice {
				correct: vec!["B".into(), "C".into()],
				reason: Some("because".into())
			}
		);
	}

	#[test]
	fn parses_drag_reply() {
		let answer = AnswerResult::parse(QuestionKind::DragAndDrop, "```json\n{\"placements\": [{\"zone\": 2, \"item\": \"a\"}]}\n```").unwrap();
		assert_eq!(
			answer,
			AnswerResult::DragAndDrop {
				placements: vec![Placement { zone: 2, item: "A".into() }],
				reason: None
			}
		);
	}

	#[test]
	fn rejects_reply_of_wrong_shape() {
		assert!(AnswerResult::parse(QuestionKind::SingleChoice, r#"{"placements": []}"#).is_err());
		assert!(AnswerResult::parse(QuestionKind::SingleChoice, "The answer is B").is_err());
	}

	#[test]
	fn empty_replies_are_detected() {
		assert!(AnswerResult::parse(QuestionKind::SingleChoice, r#"{"correct": []}"#).unwrap().is_empty());
		assert!(AnswerResult::parse(QuestionKind::DragAndDrop, r#"{"placements": []}"#).unwrap().is_empty());
		// ids that normalise to nothing are dropped
		assert!(AnswerResult::parse(QuestionKind::MultiChoice, r#"{"correct": [" . "]}"#).unwrap().is_empty());
		assert!(!AnswerResult::parse(QuestionKind::MultiChoice, r#"{"correct": ["A"]}"#).unwrap().is_empty());
	}

	#[test]
	fn letter_ids_continue_past_z() {
		assert_eq!(letter_id(0), "A");
		assert_eq!(letter_id(25), "Z");
		assert_eq!(letter_id(26), "AA");
		assert_eq!(letter_id(27), "AB");
	}
}
