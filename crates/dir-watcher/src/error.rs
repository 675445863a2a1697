use std::{io, path::Path};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("path not found: <path='{}'>", .0.display())]
	NotFound(Box<Path>),
	#[error("permission denied: <path='{}'>", .0.display())]
	PermissionDenied(Box<Path>),
	/// The kernel refused another watch (`max_user_watches` or `max_user_instances` reached).
	/// Callers should fall back to manual refresh; the service never polls.
	#[error("inotify watch limit reached: <path='{}'>", .0.display())]
	ResourceExhausted(Box<Path>),
	#[error("watch service must be created inside a tokio runtime")]
	NoRuntime,
	#[error("watch service was shut down")]
	Shutdown,

	#[error("file I/O error: {source}; path: '{}'", .path.display())]
	FileIO {
		path: Box<Path>,
		#[source]
		source: io::Error,
	},
}

impl Error {
	/// Classifies a raw I/O error coming from `stat()`, `inotify_init` or `inotify_add_watch`.
	/// `inotify_add_watch` reports a full kernel watch table as `ENOMEM` as well as `ENOSPC`.
	pub fn from_io(path: impl AsRef<Path>, source: io::Error) -> Self {
		let path = path.as_ref();

		match source.raw_os_error() {
			Some(libc::ENOSPC | libc::ENOMEM | libc::EMFILE | libc::ENFILE) => {
				return Self::ResourceExhausted(path.into())
			}
			Some(libc::ENOENT | libc::ENOTDIR) => return Self::NotFound(path.into()),
			Some(libc::EACCES | libc::EPERM) => return Self::PermissionDenied(path.into()),
			_ => {}
		}

		match source.kind() {
			io::ErrorKind::NotFound => Self::NotFound(path.into()),
			io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.into()),
			_ => Self::FileIO {
				path: path.into(),
				source,
			},
		}
	}

	#[must_use]
	pub const fn is_resource_exhausted(&self) -> bool {
		matches!(self, Self::ResourceExhausted(_))
	}
}
