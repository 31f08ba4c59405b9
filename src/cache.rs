//! On-disk memo of answers, keyed by prompt fingerprint

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use color_eyre::{Result, eyre::eyre};
use serde::{Deserialize, Serialize};

use crate::AnswerResult;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CacheEntry {
	pub answer: AnswerResult,
	pub model: String,
	pub saved_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AnswerCache {
	path: PathBuf,
	entries: HashMap<String, CacheEntry>,
}

impl AnswerCache {
	/// Load from `path`; a missing file is an empty cache
	pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let entries = match std::fs::read_to_string(&path) {
			Ok(s) => serde_json::from_str(&s).map_err(|e| eyre!("Corrupt answer cache {}: {}", path.display(), e))?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
			Err(e) => return Err(eyre!("Failed to read answer cache {}: {}", path.display(), e)),
		};
		Ok(Self { path, entries })
	}

	#[cfg(feature = "xdg")]
	pub fn default_path() -> PathBuf {
		v_utils::xdg_state_dir!("answers").join("answers.json")
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn get(&self, fingerprint: &str) -> Option<&CacheEntry> {
		self.entries.get(fingerprint)
	}

	/// Remember `answer` and flush to disk
	pub fn insert(&mut self, fingerprint: String, answer: AnswerResult, model: &str) -> Result<()> {
		self.entries.insert(
			fingerprint,
			CacheEntry {
				answer,
				model: model.to_string(),
				saved_at: Utc::now(),
			},
		);
		self.save()
	}

	fn save(&self) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| eyre!("Failed to create cache dir: {}", e))?;
		}
		let json = serde_json::to_string_pretty(&self.entries).map_err(|e| eyre!("Failed to serialize answer cache: {}", e))?;
		std::fs::write(&self.path, json).map_err(|e| eyre!("Failed to write answer cache {}: {}", self.path.display(), e))
	}
}
