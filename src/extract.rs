//! Scrapes quiz questions out of a page snapshot.
//!
//! Supports three platform layouts, each a detector over the parsed document:
//! drag-and-drop canvases, a grid of question/answer tables (N questions per page) and a single wrapped question with its
//! answer rows elsewhere in the document.

use std::{
	collections::HashMap,
	sync::LazyLock,
};

use scraper::{ElementRef, Html, Node, Selector};

use crate::{AnswerOption, DragDropTask, DraggableItem, DropZone, ElementHandle, Image, Question, QuestionBody, letter_id};

fn selector(css: &str) -> Selector {
	Selector::parse(css).expect("static selector")
}

static IMG: LazyLock<Selector> = LazyLock::new(|| selector("img"));
static TEXT: LazyLock<Selector> = LazyLock::new(|| selector(".text"));
static ROW: LazyLock<Selector> = LazyLock::new(|| selector("tr"));
static CELL: LazyLock<Selector> = LazyLock::new(|| selector("td"));

static GRID_QUESTION: LazyLock<Selector> = LazyLock::new(|| selector("table.question"));
static GRID_LABEL: LazyLock<Selector> = LazyLock::new(|| selector(".num"));
static GRID_INPUT: LazyLock<Selector> = LazyLock::new(|| selector("input:not([type=\"hidden\"])"));

/// Known question wrappers of the single-question layout, most specific first
static WRAPPERS: LazyLock<Vec<Selector>> =
	LazyLock::new(|| [".question-wrapper", r#"div[ng-bind-html="question.questionText"]"#, ".text"].into_iter().map(selector).collect());
static WRAPPER_ROWS: LazyLock<Selector> = LazyLock::new(|| selector(".table-question tbody tr"));
static CHOICE_INPUT: LazyLock<Selector> = LazyLock::new(|| selector(r#"input[type="radio"], input[type="checkbox"]"#));

static DD_AREA: LazyLock<Selector> = LazyLock::new(|| selector(".ddarea"));
static DD_BACKGROUND: LazyLock<Selector> = LazyLock::new(|| selector("img.dropbackground"));
static DD_ZONE: LazyLock<Selector> = LazyLock::new(|| selector(".dropzone"));
static DD_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".draghome, .drag, .draggable"));
static QTEXT: LazyLock<Selector> = LazyLock::new(|| selector(".qtext"));

/// Platform layouts we know how to read, in detection priority order
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
	/// Background image with numbered drop zones and draggable items
	DragDrop,
	/// `table.question` immediately followed by `table.answer`, repeated
	Grid,
	/// One question wrapper, answers in a separate `.table-question`
	Wrapper,
}

impl Layout {
	/// Run this layout's detector; `None` when it recognises nothing
	pub fn detect(self, doc: &Html) -> Option<Vec<Question>> {
		let questions = match self {
			Layout::DragDrop => detect_drag_drop(doc),
			Layout::Grid => detect_grid(doc),
			Layout::Wrapper => detect_wrapper(doc),
		};
		if questions.is_empty() {
			None
		} else {
			tracing::debug!("{:?} layout matched {} question(s)", self, questions.len());
			Some(questions)
		}
	}
}

/// Extract every question on the page.
///
/// Drag-and-drop tasks never compete with the other layouts, so they are always collected; of the choice layouts the
/// first one that matches wins.
pub fn extract_questions(html: &str) -> Vec<Question> {
	let doc = Html::parse_document(html);

	let mut questions = Layout::DragDrop.detect(&doc).unwrap_or_default();
	if let Some(found) = [Layout::Grid, Layout::Wrapper].into_iter().find_map(|layout| layout.detect(&doc)) {
		questions.extend(found);
	}
	questions
}

fn detect_grid(doc: &Html) -> Vec<Question> {
	let mut questions = Vec::new();

	for (index, table) in doc.select(&GRID_QUESTION).enumerate() {
		let Some(answer_table) = next_element_sibling(table).filter(|s| has_class(*s, "answer")) else {
			tracing::debug!("Question table {} has no answer table after it, skipping", index + 1);
			continue;
		};

		let text_el = table.select(&TEXT).next();
		let text = text_el.map(visible_text).unwrap_or_default();
		let images = text_el.map(images_in).unwrap_or_default();

		let mut options = Vec::new();
		for row in answer_table.select(&ROW) {
			let Some(input) = row.select(&GRID_INPUT).next() else {
				continue;
			};
			let text_cell = row.select(&TEXT).next();
			let id = row
				.select(&GRID_LABEL)
				.next()
				.map(|label| visible_text(label).trim_end_matches(['.', ')']).trim().to_uppercase())
				.filter(|id| !id.is_empty())
				.unwrap_or_else(|| letter_id(options.len()));

			options.push(AnswerOption {
				id,
				text: text_cell.map(visible_text).unwrap_or_default(),
				image: text_cell.and_then(|c| images_in(c).into_iter().next()),
				input: handle_of(input),
				text_node: text_cell.map(handle_of),
			});
		}

		if options.is_empty() {
			tracing::debug!("Question table {} has no answer inputs, skipping", index + 1);
			continue;
		}

		let body = if answer_table.value().attr("data-qtype") == Some("2") {
			QuestionBody::MultiChoice { options }
		} else {
			QuestionBody::SingleChoice { options }
		};
		questions.push(Question {
			number: index + 1,
			text,
			images,
			container: Some(handle_of(table)),
			body,
		});
	}

	questions
}

fn detect_wrapper(doc: &Html) -> Vec<Question> {
	let Some(wrapper) = WRAPPERS.iter().find_map(|s| doc.select(s).next()) else {
		return Vec::new();
	};

	let mut options = Vec::new();
	let mut multi = false;
	// no embedded labels in this layout, ids follow row order
	for (idx, row) in doc.select(&WRAPPER_ROWS).enumerate() {
		let Some(input) = row.select(&CHOICE_INPUT).next() else {
			continue;
		};
		if input.value().attr("type").is_some_and(|t| t.eq_ignore_ascii_case("checkbox")) {
			multi = true;
		}
		let text_container = row.select(&CELL).nth(1).unwrap_or(row);

		options.push(AnswerOption {
			id: letter_id(idx),
			text: visible_text(text_container),
			image: images_in(text_container).into_iter().next(),
			input: handle_of(input),
			text_node: Some(handle_of(text_container)),
		});
	}

	if options.is_empty() {
		return Vec::new();
	}

	let container = closest_with_class(wrapper, "card").unwrap_or(wrapper);
	let body = if multi { QuestionBody::MultiChoice { options } } else { QuestionBody::SingleChoice { options } };
	vec![Question {
		number: 1,
		text: visible_text(wrapper),
		images: images_in(wrapper),
		container: Some(handle_of(container)),
		body,
	}]
}

fn detect_drag_drop(doc: &Html) -> Vec<Question> {
	let mut questions = Vec::new();

	for (index, area) in doc.select(&DD_AREA).enumerate() {
		let Some(background) = area.select(&DD_BACKGROUND).next() else {
			continue;
		};
		let Some(background_src) = background.value().attr("src").filter(|s| !s.trim().is_empty()) else {
			continue;
		};

		let zones: Vec<DropZone> = area.select(&DD_ZONE).enumerate().map(|(i, zone)| DropZone::new(i + 1, handle_of(zone))).collect();
		if zones.is_empty() {
			continue;
		}

		let mut items: Vec<DraggableItem> = Vec::new();
		let mut seen: HashMap<(String, String), usize> = HashMap::new();
		for node in area.select(&DD_ITEM) {
			let text = visible_text(node);
			let image = images_in(node).into_iter().next();
			let key = (text.clone(), image.as_ref().map(|i| i.src.clone()).unwrap_or_default());
			if key.0.is_empty() && key.1.is_empty() {
				continue;
			}
			match seen.get(&key) {
				Some(&at) => items[at].elements.push(handle_of(node)),
				None => {
					seen.insert(key, items.len());
					items.push(DraggableItem {
						id: letter_id(items.len()),
						text,
						image,
						elements: vec![handle_of(node)],
					});
				}
			}
		}

		let question_root = closest_with_class(area, "formulation").or_else(|| closest_with_class(area, "que"));
		let qtext = question_root.and_then(|root| root.select(&QTEXT).next());

		questions.push(Question {
			number: index + 1,
			text: qtext.map(visible_text).unwrap_or_default(),
			images: qtext.map(images_in).unwrap_or_default(),
			container: Some(handle_of(closest_with_class(area, "que").unwrap_or(area))),
			body: QuestionBody::DragAndDrop(DragDropTask {
				background: Image::new(background_src.to_string(), background.value().attr("alt").map(str::to_string)),
				background_element: handle_of(background),
				zones,
				items,
			}),
		});
	}

	questions
}

/// `nth-child` path from `<html>` down to `el`, resolvable with `document.querySelector`
pub fn handle_of(el: ElementRef<'_>) -> ElementHandle {
	let mut parts = Vec::new();
	let mut current = Some(el);
	while let Some(node) = current {
		let name = node.value().name();
		let parent = node.parent().and_then(ElementRef::wrap);
		if parent.is_some() {
			let position = node.prev_siblings().filter(|s| s.value().is_element()).count() + 1;
			parts.push(format!("{name}:nth-child({position})"));
		} else {
			parts.push(name.to_string());
		}
		current = parent;
	}
	parts.reverse();
	ElementHandle::from_selector(parts.join(" > "))
}

fn next_element_sibling(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
	el.next_siblings().find_map(ElementRef::wrap)
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
	el.value().classes().any(|c| c == class)
}

fn closest_with_class<'a>(el: ElementRef<'a>, class: &str) -> Option<ElementRef<'a>> {
	el.ancestors().filter_map(ElementRef::wrap).find(|a| has_class(*a, class))
}

fn images_in(el: ElementRef<'_>) -> Vec<Image> {
	el.select(&IMG)
		.filter_map(|img| {
			let src = img.value().attr("src")?.trim();
			(!src.is_empty()).then(|| Image::new(src.to_string(), img.value().attr("alt").map(str::to_string)))
		})
		.collect()
}

/// Rendered-ish text of `el`: script/style and our own overlays skipped, whitespace collapsed
fn visible_text(el: ElementRef<'_>) -> String {
	let mut raw = String::new();
	collect_text(el, &mut raw);
	raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
	for child in el.children() {
		match child.value() {
			Node::Text(text) => out.push_str(text),
			Node::Element(element) => {
				if matches!(element.name(), "script" | "style" | "noscript") || element.attr("data-quiz-pilot").is_some() {
					continue;
				}
				if let Some(child_el) = ElementRef::wrap(child) {
					out.push(' ');
					collect_text(child_el, out);
					out.push(' ');
				}
			}
			_ => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn grid_block(label: &str, with_answers: bool) -> String {
		let answers = if with_answers {
			r#"<table class="answer" data-qtype="1"><tbody>
				<tr><td class="num">A.</td><td class="text">Paris</td><td><input type="radio" name="q"></td></tr>
				<tr><td class="num">B.</td><td class="text">Lyon</td><td><input type="radio" name="q"></td></tr>
			</tbody></table>"#
		} else {
			r#"<div class="note">no answers here</div>"#
		};
		format!(r#"<table class="question"><tbody><tr><td class="text">{label}</td></tr></tbody></table>{answers}"#)
	}

	fn resolves_to<'a>(doc: &'a Html, handle: &ElementHandle) -> ElementRef<'a> {
		let sel = Selector::parse(handle.selector()).unwrap();
		let mut found = doc.select(&sel);
		let el = found.next().expect("handle resolves");
		assert!(found.next().is_none(), "handle is ambiguous: {handle}");
		el
	}

	#[test]
	fn grid_skips_block_without_answer_sibling() {
		let html = format!(
			"<html><body>{}{}{}</body></html>",
			grid_block("First?", true),
			grid_block("Second?", false),
			grid_block("Third?", true)
		);
		let questions = extract_questions(&html);
		assert_eq!(questions.len(), 2);
		assert_eq!(questions[0].text, "First?");
		assert_eq!(questions[0].number, 1);
		assert_eq!(questions[1].text, "Third?");
		assert_eq!(questions[1].number, 3);
	}

	#[test]
	fn grid_rows_read_labels_inputs_and_images() {
		let html = r#"<html><body>
			<table class="question"><tr><td class="text">Pick the   <b>primes</b> <img src="/q.png" alt="chart"></td></tr></table>
			<table class="answer" data-qtype="2">
				<tr><td class="num">A.</td><td class="text">2</td><td><input type="checkbox"></td></tr>
				<tr><td class="num">B.</td><td class="text">4 <img src="data:image/png;base64,AAAA"></td><td><input type="checkbox"></td></tr>
				<tr><td class="num">C.</td><td class="text">no input here</td></tr>
				<tr><td class="text">5</td><td><input type="checkbox"></td></tr>
			</table>
		</body></html>"#;
		let questions = extract_questions(html);
		assert_eq!(questions.len(), 1);
		let q = &questions[0];
		assert!(q.is_multi());
		assert_eq!(q.text, "Pick the primes");
		assert_eq!(q.images, vec![Image::new("/q.png".into(), Some("chart".into()))]);

		let ids: Vec<&str> = q.options().iter().map(|o| o.id.as_str()).collect();
		// row C has no input, the unlabelled row falls back to its position letter
		assert_eq!(ids, vec!["A", "B", "C"]);
		assert_eq!(q.options()[2].text, "5");
		assert!(q.options()[0].image.is_none());
		assert_eq!(q.options()[1].image.as_ref().unwrap().src, "data:image/png;base64,AAAA");

		let doc = Html::parse_document(html);
		let input = resolves_to(&doc, &q.options()[1].input);
		assert_eq!(input.value().name(), "input");
		let text_node = resolves_to(&doc, q.options()[1].text_node.as_ref().unwrap());
		assert_eq!(visible_text(text_node), "4");
	}

	#[test]
	fn grid_single_select_by_default() {
		let html = format!("<html><body>{}</body></html>", grid_block("Capital?", true));
		let questions = extract_questions(&html);
		assert!(!questions[0].is_multi());
		assert_eq!(questions[0].options()[1].text, "Lyon");
	}

	#[test]
	fn wrapper_layout_letters_by_row_order() {
		let html = r#"<html><body>
			<div class="card"><div class="question-wrapper">What is 2+2?</div></div>
			<table class="table-question"><tbody>
				<tr><td><input type="radio" name="a"></td><td>3</td></tr>
				<tr><td><input type="radio" name="a"></td><td>4</td></tr>
				<tr><td>separator</td></tr>
				<tr><td><input type="radio" name="a"></td><td>5</td></tr>
			</tbody></table>
		</body></html>"#;
		let questions = extract_questions(html);
		assert_eq!(questions.len(), 1);
		let q = &questions[0];
		assert_eq!(q.text, "What is 2+2?");
		assert!(!q.is_multi());
		let ids: Vec<(&str, &str)> = q.options().iter().map(|o| (o.id.as_str(), o.text.as_str())).collect();
		assert_eq!(ids, vec![("A", "3"), ("B", "4"), ("D", "5")]);

		let doc = Html::parse_document(html);
		let container = resolves_to(&doc, q.container.as_ref().unwrap());
		assert!(has_class(container, "card"));
	}

	#[test]
	fn wrapper_checkbox_in_rows_means_multi() {
		let html = r#"<html><body>
			<div ng-bind-html="question.questionText">Select all even numbers</div>
			<table class="table-question"><tbody>
				<tr><td><input type="checkbox"></td><td>2</td></tr>
				<tr><td><input type="checkbox"></td><td>3</td></tr>
			</tbody></table>
		</body></html>"#;
		let questions = extract_questions(html);
		assert!(questions[0].is_multi());
		assert_eq!(questions[0].text, "Select all even numbers");
	}

	#[test]
	fn drag_drop_collapses_reused_items() {
		let html = r#"<html><body>
			<div class="que ddimageortext"><div class="formulation">
				<div class="qtext">Label the cell</div>
				<div class="ddarea">
					<div class="dropbackground-wrapper"><img class="dropbackground" src="/bg.png" alt="cell"></div>
					<div class="dropzones">
						<div class="dropzone place0"></div>
						<div class="dropzone place1"></div>
						<div class="dropzone place2"></div>
					</div>
					<div class="draghomes">
						<div class="draghome choice1">Nucleus</div>
						<div class="draghome choice2">Membrane</div>
						<div class="draghome choice3"><img src="/mito.png"></div>
						<div class="draghome choice1 infinite">Nucleus</div>
						<div class="draghome"></div>
					</div>
				</div>
			</div></div>
		</body></html>"#;
		let questions = extract_questions(html);
		assert_eq!(questions.len(), 1);
		let q = &questions[0];
		assert_eq!(q.text, "Label the cell");
		let task = q.drag_drop().unwrap();
		assert_eq!(task.background.src, "/bg.png");
		assert_eq!(task.zones.iter().map(|z| z.index).collect::<Vec<_>>(), vec![1, 2, 3]);

		let items: Vec<(&str, &str, usize)> = task.items.iter().map(|i| (i.id.as_str(), i.text.as_str(), i.elements.len())).collect();
		assert_eq!(items, vec![("A", "Nucleus", 2), ("B", "Membrane", 1), ("C", "", 1)]);
		assert_eq!(task.items[2].image.as_ref().unwrap().src, "/mito.png");

		let doc = Html::parse_document(html);
		let zone = resolves_to(&doc, &task.zones[1].element);
		assert!(has_class(zone, "place1"));
	}

	#[test]
	fn drag_drop_needs_background_and_zones() {
		let html = r#"<html><body><div class="ddarea"><div class="dropzone"></div><div class="draghome">x</div></div></body></html>"#;
		assert!(extract_questions(html).is_empty());
	}

	#[test]
	fn unknown_markup_is_nothing_to_do() {
		assert!(extract_questions("<html><body><p>Welcome back!</p></body></html>").is_empty());
	}

	#[test]
	fn injected_markers_do_not_leak_into_text() {
		let html = r#"<html><body>
			<table class="question"><tr><td class="text">Q</td></tr></table>
			<table class="answer"><tr><td class="num">A</td><td class="text">Yes<span class="quiz-pilot-marker" data-quiz-pilot="marker">•</span></td><td><input type="radio"></td></tr></table>
		</body></html>"#;
		assert_eq!(extract_questions(html)[0].options()[0].text, "Yes");
	}
}
