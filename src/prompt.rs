//! Builds the model request for one question: instruction text plus inline images

use std::{collections::HashMap, io::Cursor};

use base64::Engine as _;
use color_eyre::{Result, eyre::eyre};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use sha2::{Digest, Sha256};

use crate::{
	DragDropTask, ElementHandle, Question, QuestionBody, QuestionKind,
	media::{ImagePayload, ImageResolver},
	page::Rect,
};

/// Page-space boxes of the elements a prompt needs to know about
pub type Geometry = HashMap<ElementHandle, Rect>;

/// Everything sent to the model for one question
#[derive(Clone, Debug)]
pub struct PromptPayload {
	pub kind: QuestionKind,
	pub text: String,
	/// Inline images, in the order they are referenced by `text`
	pub images: Vec<ImagePayload>,
}

impl PromptPayload {
	/// Stable key for the answer cache: digest of the kind, the text and every image's bytes
	pub fn fingerprint(&self) -> String {
		let mut hasher = Sha256::new();
		hasher.update(format!("{:?}", self.kind).as_bytes());
		hasher.update(b"\0");
		hasher.update(self.text.trim().as_bytes());
		for img in &self.images {
			hasher.update(b"\0");
			hasher.update(img.mime.as_bytes());
			hasher.update(b"\0");
			hasher.update(img.base64.as_bytes());
		}
		format!("{:x}", hasher.finalize())
	}
}

const CHOICE_FORMAT: &str = r#"{"correct": ["A"], "reason": "very short explanation, max 10 words"}"#;
const DRAG_FORMAT: &str = r#"{"placements": [{"zone": 1, "item": "A"}], "reason": "very short explanation, max 10 words"}"#;

/// Build the prompt for `question`.
///
/// Images that fail to resolve are left out of both the payload and the text, nothing refers to a missing image.
pub async fn build(question: &Question, resolver: &ImageResolver, geometry: &Geometry) -> PromptPayload {
	let mut images = Vec::new();
	for img in &question.images {
		if let Some(payload) = resolver.resolve(&img.src).await {
			images.push(payload);
		}
	}

	let mut text = String::new();
	text.push_str(&format!("Question: {}\n", question.text));

	match &question.body {
		QuestionBody::SingleChoice { options } | QuestionBody::MultiChoice { options } => {
			let kind = if question.is_multi() { "Multi-choice (select ALL correct options)" } else { "Single-choice (select exactly ONE option)" };
			text.push_str(&format!("Type: {kind}\nOptions:\n"));
			for option in options {
				let mut line = format!("{}. {}", option.id, option.text);
				if let Some(img) = &option.image
					&& let Some(payload) = resolver.resolve(&img.src).await
				{
					images.push(payload);
					line.push_str(" [Image Attached]");
				}
				text.push_str(&line);
				text.push('\n');
			}
			text.push_str(&format!(
				"\nTask:\n1. Select the correct option(s) by their letter.\n2. Provide a very short explanation.\n\nReturn JSON ONLY, no markdown, no prose:\n{CHOICE_FORMAT}\n"
			));
		}
		QuestionBody::DragAndDrop(task) => {
			text.push_str("Type: Drag-and-drop\n");
			match annotated_background(task, resolver, geometry).await {
				Some((payload, drawn)) => {
					images.push(payload);
					if drawn.is_empty() {
						text.push_str(&format!("Drop zones are numbered 1-{} in reading order.\n", task.zones.len()));
					} else {
						let numbers: Vec<String> = drawn.iter().map(|z| z.to_string()).collect();
						text.push_str(&format!("The attached image shows drop zones {} as numbered red circles.\n", numbers.join(", ")));
						if drawn.len() < task.zones.len() {
							text.push_str(&format!("There are {} drop zones in total, numbered in reading order.\n", task.zones.len()));
						}
					}
				}
				None => text.push_str(&format!("Drop zones are numbered 1-{} in reading order.\n", task.zones.len())),
			}
			text.push_str("Items:\n");
			for item in &task.items {
				let mut line = format!("{}. {}", item.id, item.text);
				if let Some(img) = &item.image
					&& let Some(payload) = resolver.resolve(&img.src).await
				{
					images.push(payload);
					line.push_str(" [Image Attached]");
				}
				text.push_str(line.trim_end());
				text.push('\n');
			}
			text.push_str(&format!(
				"\nTask:\n1. Assign the correct item to every drop zone.\n2. Provide a very short explanation.\n\nReturn JSON ONLY, no markdown, no prose:\n{DRAG_FORMAT}\n"
			));
		}
	}

	PromptPayload {
		kind: question.kind(),
		text,
		images,
	}
}

/// Background of a drag-and-drop task, annotated with zone numbers when the geometry allows it.
///
/// Returns the payload and the numbers of the zones drawn on it (empty when sent unannotated).
async fn annotated_background(task: &DragDropTask, resolver: &ImageResolver, geometry: &Geometry) -> Option<(ImagePayload, Vec<usize>)> {
	let raw = resolver.resolve(&task.background.src).await?;

	let Some(displayed) = geometry.get(&task.background_element).copied() else {
		tracing::warn!("No on-screen box for the drag-and-drop background, sending it unannotated");
		return Some((raw, Vec::new()));
	};
	let zones: Vec<(usize, Rect)> = task.zones.iter().filter_map(|z| geometry.get(&z.element).map(|r| (z.index, *r))).collect();
	if zones.is_empty() {
		return Some((raw, Vec::new()));
	}

	match render_composite(&raw, displayed, &zones) {
		Ok(annotated) => Some(annotated),
		Err(e) => {
			tracing::warn!("Failed to annotate drag-and-drop background: {}", e);
			Some((raw, Vec::new()))
		}
	}
}

fn render_composite(raw: &ImagePayload, displayed: Rect, zones: &[(usize, Rect)]) -> Result<(ImagePayload, Vec<usize>)> {
	let background = image::load_from_memory(&raw.decode()?).map_err(|e| eyre!("Failed to decode background: {}", e))?;
	let annotated = annotate_drop_zones(&background, displayed, zones);
	let drawn = annotated.markers.iter().map(|m| m.zone).collect();

	let mut bytes = Vec::new();
	DynamicImage::ImageRgba8(annotated.image)
		.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
		.map_err(|e| eyre!("Failed to encode composite: {}", e))?;
	let payload = ImagePayload {
		mime: "image/png".to_string(),
		base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
	};
	Ok((payload, drawn))
}

const MARKER_FILL: Rgba<u8> = Rgba([229, 57, 53, 255]);
const MARKER_INK: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Numbered marker drawn on the composite, in natural pixel coordinates
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneMarker {
	pub zone: usize,
	pub x: u32,
	pub y: u32,
	pub radius: u32,
}

pub struct Annotated {
	pub image: RgbaImage,
	pub markers: Vec<ZoneMarker>,
}

/// Draw a filled numbered circle at the centre of every zone.
///
/// `displayed` and the zone boxes are page coordinates; they are mapped onto the natural resolution of `background`
/// through the natural/displayed size ratio.
pub fn annotate_drop_zones(background: &DynamicImage, displayed: Rect, zones: &[(usize, Rect)]) -> Annotated {
	let mut canvas = background.to_rgba8();
	let (width, height) = canvas.dimensions();
	let scale_x = if displayed.width > 0.0 { width as f64 / displayed.width } else { 1.0 };
	let scale_y = if displayed.height > 0.0 { height as f64 / displayed.height } else { 1.0 };
	let radius = (width.min(height) as f64 / 25.0).clamp(8.0, 28.0) as u32;

	let mut markers = Vec::with_capacity(zones.len());
	for &(zone, rect) in zones {
		let (cx, cy) = rect.center();
		let x = ((cx - displayed.x) * scale_x).round().clamp(0.0, width.saturating_sub(1) as f64) as u32;
		let y = ((cy - displayed.y) * scale_y).round().clamp(0.0, height.saturating_sub(1) as f64) as u32;

		fill_circle(&mut canvas, x, y, radius + 2, MARKER_INK);
		fill_circle(&mut canvas, x, y, radius, MARKER_FILL);
		draw_number(&mut canvas, x, y, zone, (radius / 4).max(1));
		markers.push(ZoneMarker { zone, x, y, radius });
	}

	Annotated { image: canvas, markers }
}

fn fill_circle(canvas: &mut RgbaImage, cx: u32, cy: u32, r: u32, color: Rgba<u8>) {
	let (width, height) = canvas.dimensions();
	let r2 = (r as i64) * (r as i64);
	for dy in -(r as i64)..=(r as i64) {
		for dx in -(r as i64)..=(r as i64) {
			if dx * dx + dy * dy > r2 {
				continue;
			}
			let (x, y) = (cx as i64 + dx, cy as i64 + dy);
			if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
				canvas.put_pixel(x as u32, y as u32, color);
			}
		}
	}
}

/// 3x5 bitmap digits, one row per byte, most significant of the low 3 bits is the left column
const DIGITS: [[u8; 5]; 10] = [
	[0b111, 0b101, 0b101, 0b101, 0b111],
	[0b010, 0b110, 0b010, 0b010, 0b111],
	[0b111, 0b001, 0b111, 0b100, 0b111],
	[0b111, 0b001, 0b111, 0b001, 0b111],
	[0b101, 0b101, 0b111, 0b001, 0b001],
	[0b111, 0b100, 0b111, 0b001, 0b111],
	[0b111, 0b100, 0b111, 0b101, 0b111],
	[0b111, 0b001, 0b001, 0b001, 0b001],
	[0b111, 0b101, 0b111, 0b101, 0b111],
	[0b111, 0b101, 0b111, 0b001, 0b111],
];

/// Draw `n` centred on (cx, cy), each font pixel scaled to a `scale`x`scale` block
fn draw_number(canvas: &mut RgbaImage, cx: u32, cy: u32, n: usize, scale: u32) {
	let digits: Vec<usize> = n.to_string().bytes().map(|b| (b - b'0') as usize).collect();
	let cols = digits.len() as i64 * 4 - 1;
	let s = scale as i64;
	let left = cx as i64 - cols * s / 2;
	let top = cy as i64 - 5 * s / 2;
	let (width, height) = canvas.dimensions();

	for (i, &d) in digits.iter().enumerate() {
		for (row, bits) in DIGITS[d].iter().enumerate() {
			for col in 0..3i64 {
				if bits & (0b100 >> col) == 0 {
					continue;
				}
				let x0 = left + (i as i64 * 4 + col) * s;
				let y0 = top + row as i64 * s;
				for y in y0..y0 + s {
					for x in x0..x0 + s {
						if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
							canvas.put_pixel(x as u32, y as u32, MARKER_INK);
						}
					}
				}
			}
		}
	}
}
