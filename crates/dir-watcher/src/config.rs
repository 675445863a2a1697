use std::path::{Path, PathBuf};

/// Size of the buffer handed to the kernel for each `read` on the inotify descriptor.
/// Big enough for ~200 events with short names.
const DEFAULT_EVENT_BUFFER_SIZE: usize = 4096;

/// System directories such as `/dev` and `/proc` hold special files that generate floods of
/// events and never represent real directory content, so they are never watched.
const DEFAULT_IGNORED: [&str; 3] = ["/sys", "/proc", "/dev"];

#[derive(Debug, Clone)]
pub struct WatchServiceConfig {
	/// Path prefixes that `register` silently refuses to arm.
	pub ignored: Vec<PathBuf>,
	pub event_buffer_size: usize,
}

impl Default for WatchServiceConfig {
	fn default() -> Self {
		Self {
			ignored: DEFAULT_IGNORED.iter().map(PathBuf::from).collect(),
			event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
		}
	}
}

impl WatchServiceConfig {
	/// A config with nothing ignored.
	#[must_use]
	pub fn empty() -> Self {
		Self {
			ignored: vec![],
			..Default::default()
		}
	}

	#[must_use]
	pub fn with_ignored(mut self, path: impl Into<PathBuf>) -> Self {
		self.ignored.push(path.into());
		self
	}

	#[must_use]
	pub fn with_event_buffer_size(mut self, size: usize) -> Self {
		self.event_buffer_size = size;
		self
	}

	pub(crate) fn is_ignored(&self, path: &Path) -> bool {
		self.ignored.iter().any(|prefix| path.starts_with(prefix))
	}
}
