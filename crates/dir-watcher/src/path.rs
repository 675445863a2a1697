//! Helpers for the absolute, lexically normalized paths the service keys everything on.
//!
//! Two spellings of one location (`/a/./b`, `/a/c/../b`) must land on the same registration, so
//! every path entering the public API goes through [`normalize`]. Symbolic links are *not*
//! resolved here: aliases are reconciled by inode identity, not by path rewriting.

use std::path::{Component, Path, PathBuf};

use crate::error::Error;

/// Makes `path` absolute (relative to the current directory) and removes `.`, `..` and repeated
/// separators without touching the filesystem.
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf, Error> {
	let path = path.as_ref();

	let absolute = if path.is_absolute() {
		path.to_path_buf()
	} else {
		std::env::current_dir()
			.map_err(|e| Error::from_io(path, e))?
			.join(path)
	};

	let mut normalized = PathBuf::new();
	for component in absolute.components() {
		match component {
			Component::Prefix(_) | Component::RootDir => normalized.push(component),
			Component::CurDir => {}
			Component::ParentDir => {
				normalized.pop();
			}
			Component::Normal(name) => normalized.push(name),
		}
	}

	Ok(normalized)
}
