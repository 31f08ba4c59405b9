//! Everything that touches the live page goes through [`PageSurface`]

use chromiumoxide::Page;
use color_eyre::{Result, eyre::eyre};
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::ElementHandle;

/// Attribute carried by every node we inject, so a single query removes them all
const OVERLAY_ATTR: &str = "data-quiz-pilot";
pub const MARKER_CLASS: &str = "quiz-pilot-marker";

/// Box in page coordinates (viewport position plus scroll offset)
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, new)]
pub struct Rect {
	pub x: f64,
	pub y: f64,
	pub width: f64,
	pub height: f64,
}

impl Rect {
	pub fn center(&self) -> (f64, f64) {
		(self.x + self.width / 2.0, self.y + self.height / 2.0)
	}

	pub fn contains(&self, x: f64, y: f64) -> bool {
		x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BadgeTone {
	/// On a drop zone
	Zone,
	/// On a draggable item
	Item,
}

/// Status indicator colours
pub mod tone {
	pub const INFO: &str = "#1976d2";
	pub const DONE: &str = "#2e7d32";
	pub const WARN: &str = "#ff9800";
	pub const ERROR: &str = "#d32f2f";
}

/// Read and mutate the page the quiz is rendered in.
///
/// Implemented for [`chromiumoxide::Page`]; tests use an in-memory recording surface.
#[allow(async_fn_in_trait)]
pub trait PageSurface {
	async fn current_url(&self) -> Result<String>;
	/// Serialized live DOM
	async fn snapshot_html(&self) -> Result<String>;
	async fn is_checked(&self, el: &ElementHandle) -> Result<bool>;
	/// Real click, so the host page's own handlers fire
	async fn click(&self, el: &ElementHandle) -> Result<()>;
	async fn has_marker(&self, el: &ElementHandle) -> Result<bool>;
	async fn append_marker(&self, el: &ElementHandle, color: &str, title: &str) -> Result<()>;
	async fn bounding_box(&self, el: &ElementHandle) -> Result<Option<Rect>>;
	async fn place_badge(&self, rect: Rect, label: &str, tone: BadgeTone) -> Result<()>;
	async fn show_panel(&self, title: &str, lines: &[String]) -> Result<()>;
	/// Remove every marker, badge and panel injected so far
	async fn clear_overlays(&self) -> Result<()>;
	async fn show_status(&self, message: &str, color: &str) -> Result<()>;
	async fn set_dimmed(&self, el: &ElementHandle, dimmed: bool) -> Result<()>;
}

/// Quote `s` as a JS string literal
fn js_str(s: &str) -> String {
	serde_json::Value::String(s.to_owned()).to_string()
}

async fn eval_bool(page: &Page, script: String, what: &str) -> Result<bool> {
	let result = page.evaluate(script).await.map_err(|e| eyre!("Failed to {}: {}", what, e))?;
	Ok(result.value().and_then(|v| v.as_bool()).unwrap_or(false))
}

impl PageSurface for Page {
	async fn current_url(&self) -> Result<String> {
		let url = Page::url(self).await.map_err(|e| eyre!("Failed to get URL: {}", e))?;
		Ok(url.unwrap_or_default())
	}

	async fn snapshot_html(&self) -> Result<String> {
		self.content().await.map_err(|e| eyre!("Failed to get page HTML: {}", e))
	}

	async fn is_checked(&self, el: &ElementHandle) -> Result<bool> {
		let script = format!(
			r#"
			(function() {{
				const input = document.querySelector({});
				return !!(input && input.checked);
			}})()
			"#,
			js_str(el.selector())
		);
		eval_bool(self, script, "read input state").await
	}

	async fn click(&self, el: &ElementHandle) -> Result<()> {
		let script = format!(
			r#"
			(function() {{
				const input = document.querySelector({});
				if (input) {{ input.click(); return true; }}
				return false;
			}})()
			"#,
			js_str(el.selector())
		);
		if !eval_bool(self, script, "click input").await? {
			return Err(eyre!("Failed to find input element: {}", el));
		}
		Ok(())
	}

	async fn has_marker(&self, el: &ElementHandle) -> Result<bool> {
		let script = format!(
			r#"
			(function() {{
				const node = document.querySelector({});
				return !!(node && node.querySelector(':scope > .{MARKER_CLASS}'));
			}})()
			"#,
			js_str(el.selector())
		);
		eval_bool(self, script, "look up marker").await
	}

	async fn append_marker(&self, el: &ElementHandle, color: &str, title: &str) -> Result<()> {
		let script = format!(
			r#"
			(function() {{
				const node = document.querySelector({});
				if (!node) return false;
				if (node.querySelector(':scope > .{MARKER_CLASS}')) return true;
				const m = document.createElement('span');
				m.className = '{MARKER_CLASS}';
				m.setAttribute('{OVERLAY_ATTR}', 'marker');
				m.textContent = '•';
				m.style.color = {};
				m.style.marginLeft = '5px';
				m.style.cursor = 'help';
				m.title = {};
				node.appendChild(m);
				return true;
			}})()
			"#,
			js_str(el.selector()),
			js_str(color),
			js_str(title)
		);
		if !eval_bool(self, script, "append marker").await? {
			return Err(eyre!("Failed to find marker target: {}", el));
		}
		Ok(())
	}

	async fn bounding_box(&self, el: &ElementHandle) -> Result<Option<Rect>> {
		let script = format!(
			r#"
			(function() {{
				const node = document.querySelector({});
				if (!node) return null;
				const r = node.getBoundingClientRect();
				return JSON.stringify({{ x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height }});
			}})()
			"#,
			js_str(el.selector())
		);
		let result = self.evaluate(script).await.map_err(|e| eyre!("Failed to measure element: {}", e))?;
		let Some(json_str) = result.value().and_then(|v| v.as_str()) else {
			return Ok(None);
		};
		let rect: Rect = serde_json::from_str(json_str).map_err(|e| eyre!("Failed to parse bounding box: {}", e))?;
		Ok(Some(rect))
	}

	async fn place_badge(&self, rect: Rect, label: &str, tone: BadgeTone) -> Result<()> {
		let (background, left, top) = match tone {
			BadgeTone::Zone => ("#d32f2f", rect.x + rect.width / 2.0 - 11.0, rect.y + rect.height / 2.0 - 11.0),
			BadgeTone::Item => ("#1976d2", rect.x - 8.0, rect.y - 8.0),
		};
		let script = format!(
			r#"
			(function() {{
				const b = document.createElement('div');
				b.setAttribute('{OVERLAY_ATTR}', 'badge');
				b.textContent = {};
				b.style.cssText = `
					position: absolute; left: {left}px; top: {top}px;
					min-width: 22px; height: 22px; line-height: 22px; padding: 0 4px; box-sizing: border-box;
					border-radius: 11px; background: {background}; color: #fff; text-align: center;
					font: bold 12px monospace; pointer-events: none; z-index: 99998;
					box-shadow: 0 1px 3px rgba(0,0,0,0.4);
				`;
				document.body.appendChild(b);
				return true;
			}})()
			"#,
			js_str(label)
		);
		eval_bool(self, script, "place badge").await?;
		Ok(())
	}

	async fn show_panel(&self, title: &str, lines: &[String]) -> Result<()> {
		let lines_json = serde_json::to_string(lines).map_err(|e| eyre!("Failed to serialize panel lines: {}", e))?;
		let script = format!(
			r#"
			(function() {{
				let panel = document.getElementById('quiz-pilot-panel');
				if (panel) panel.remove();
				panel = document.createElement('div');
				panel.id = 'quiz-pilot-panel';
				panel.setAttribute('{OVERLAY_ATTR}', 'panel');
				panel.style.cssText = `
					position: fixed; top: 10px; right: 10px; max-width: 320px;
					font-family: monospace; font-size: 12px; color: #333;
					background: rgba(255,255,255,0.97); padding: 8px 10px;
					border: 1px solid #ddd; border-radius: 4px;
					pointer-events: none; z-index: 99999; box-shadow: 0 2px 5px rgba(0,0,0,0.15);
				`;
				const h = document.createElement('div');
				h.style.fontWeight = 'bold';
				h.textContent = {};
				panel.appendChild(h);
				for (const line of {lines_json}) {{
					const row = document.createElement('div');
					row.textContent = line;
					panel.appendChild(row);
				}}
				document.body.appendChild(panel);
				return true;
			}})()
			"#,
			js_str(title)
		);
		eval_bool(self, script, "show panel").await?;
		Ok(())
	}

	async fn clear_overlays(&self) -> Result<()> {
		let script = format!(
			r#"
			(function() {{
				for (const node of document.querySelectorAll('[{OVERLAY_ATTR}]')) node.remove();
				for (const node of document.querySelectorAll('[{OVERLAY_ATTR}-dimmed]')) {{
					node.style.opacity = '';
					node.removeAttribute('{OVERLAY_ATTR}-dimmed');
				}}
				return true;
			}})()
			"#
		);
		eval_bool(self, script, "clear overlays").await?;
		Ok(())
	}

	async fn show_status(&self, message: &str, color: &str) -> Result<()> {
		let script = format!(
			r#"
			(function() {{
				let s = document.getElementById('quiz-pilot-status');
				if (!s) {{
					s = document.createElement('div');
					s.id = 'quiz-pilot-status';
					s.style.cssText = `
						position: fixed; bottom: 10px; right: 10px;
						font-family: monospace; font-size: 11px;
						background: rgba(255,255,255,0.95);
						padding: 4px 8px; border: 1px solid #ddd; border-radius: 4px;
						pointer-events: none; z-index: 99999; box-shadow: 0 2px 5px rgba(0,0,0,0.1);
					`;
					document.body.appendChild(s);
				}}
				s.textContent = {};
				s.style.color = {};
				s.style.display = 'block';
				return true;
			}})()
			"#,
			js_str(message),
			js_str(color)
		);
		eval_bool(self, script, "show status").await?;
		Ok(())
	}

	async fn set_dimmed(&self, el: &ElementHandle, dimmed: bool) -> Result<()> {
		let script = format!(
			r#"
			(function() {{
				const node = document.querySelector({});
				if (!node) return false;
				if ({dimmed}) {{
					node.style.opacity = '0.7';
					node.setAttribute('{OVERLAY_ATTR}-dimmed', '');
				}} else {{
					node.style.opacity = '';
					node.removeAttribute('{OVERLAY_ATTR}-dimmed');
				}}
				return true;
			}})()
			"#,
			js_str(el.selector())
		);
		eval_bool(self, script, "dim question").await?;
		Ok(())
	}
}
