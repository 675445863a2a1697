use std::{
	fmt,
	fs::{self, Metadata},
	os::unix::fs::MetadataExt,
	path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::error::Error;

/// The identity of a filesystem object independent of the path used to reach it.
///
/// Hard links and bind mounts of one directory share a `NodeIdentity`, and so share a single
/// kernel watch: inotify hands back the same descriptor for every `add_watch` on one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity {
	pub device: u64,
	pub inode: u64,
}

impl NodeIdentity {
	#[must_use]
	pub fn from_metadata(metadata: &Metadata) -> Self {
		Self {
			device: metadata.dev(),
			inode: metadata.ino(),
		}
	}
}

impl fmt::Display for NodeIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.device, self.inode)
	}
}

/// Resolves the identity of whatever `path` currently points to, following symbolic links.
///
/// A failing `stat()` is always an error, never a placeholder identity.
pub fn identity_of(path: impl AsRef<Path>) -> Result<NodeIdentity, Error> {
	let path = path.as_ref();

	fs::metadata(path)
		.map(|metadata| NodeIdentity::from_metadata(&metadata))
		.map_err(|e| Error::from_io(path, e))
}

/// Directories directly inside `path` with their identities, read the way a listing would:
/// symbolic links are not followed, and entries that vanish or can't be `stat()`ed while
/// listing are skipped. A `path` that can't be listed (a file, no permission) has no children.
pub(crate) fn child_directories(path: &Path) -> Vec<(PathBuf, NodeIdentity)> {
	let entries = match fs::read_dir(path) {
		Ok(entries) => entries,
		Err(e) => {
			debug!(?e, path = %path.display(), "Unable to list directory children;");
			return vec![];
		}
	};

	entries
		.filter_map(|entry| {
			let entry = entry.ok()?;
			if !entry.file_type().ok()?.is_dir() {
				return None;
			}

			let child = entry.path();
			match identity_of(&child) {
				Ok(node) => Some((child, node)),
				Err(e) => {
					trace!(?e, "Skipping child directory;");
					None
				}
			}
		})
		.collect()
}
