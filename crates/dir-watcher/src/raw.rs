//! Thin layer over the kernel's inotify facility.

use std::{
	ffi::OsString,
	fmt,
	hash::Hash,
	path::{Path, PathBuf},
};

use inotify::{EventMask, EventOwned, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use tracing::{debug, trace};

use crate::{
	error::Error,
	node::{child_directories, identity_of, NodeIdentity},
};

/// Shown in errors raised while creating the inotify instance itself, where no watched path is
/// involved yet. Exhausting instances is reported against the knob that limits them.
const INOTIFY_INSTANCES_KNOB: &str = "/proc/sys/fs/inotify/max_user_instances";

/// Everything that can change what a directory listing shows, plus self deletion/move.
pub(crate) const WATCH_MASK: WatchMask = WatchMask::ATTRIB
	.union(WatchMask::CREATE)
	.union(WatchMask::DELETE)
	.union(WatchMask::DELETE_SELF)
	.union(WatchMask::MODIFY)
	.union(WatchMask::CLOSE_WRITE)
	.union(WatchMask::MOVE_SELF)
	.union(WatchMask::MOVED_FROM)
	.union(WatchMask::MOVED_TO);

/// Where watch descriptors come from. Implemented by [`RawWatch`] over inotify.
pub(crate) trait WatchBackend {
	type Descriptor: Clone + Eq + Hash + fmt::Debug;

	/// Starts watching the object `path` resolves to. Adding a path whose inode is already
	/// watched returns the existing descriptor.
	fn add(&mut self, path: &Path) -> Result<Self::Descriptor, Error>;

	/// Releases a descriptor. The kernel may already have dropped it (deleted or unmounted
	/// node), so failures are not reported.
	fn remove(&mut self, descriptor: Self::Descriptor);

	/// Current identity of `path`, `None` if it can't be `stat()`ed.
	fn resolve(&self, path: &Path) -> Option<NodeIdentity> {
		identity_of(path).ok()
	}

	fn child_dirs(&self, path: &Path) -> Vec<(PathBuf, NodeIdentity)> {
		child_directories(path)
	}
}

/// A single decoded kernel record.
#[derive(Debug, Clone)]
pub(crate) struct RawEvent<D> {
	pub descriptor: D,
	pub mask: EventMask,
	pub name: Option<OsString>,
}

impl From<EventOwned> for RawEvent<WatchDescriptor> {
	fn from(event: EventOwned) -> Self {
		Self {
			descriptor: event.wd,
			mask: event.mask,
			name: event.name,
		}
	}
}

pub(crate) struct RawWatch {
	watches: Watches,
}

impl fmt::Debug for RawWatch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RawWatch").finish_non_exhaustive()
	}
}

impl RawWatch {
	/// Creates the inotify instance, returning the handle used to add/remove watches and the
	/// stream the event loop reads from. Must be called from within a tokio runtime.
	pub fn init(buffer_size: usize) -> Result<(Self, EventStream<Vec<u8>>), Error> {
		let inotify = Inotify::init().map_err(|e| Error::from_io(INOTIFY_INSTANCES_KNOB, e))?;
		let watches = inotify.watches();

		let stream = inotify
			.into_event_stream(vec![0; buffer_size])
			.map_err(|e| Error::from_io(INOTIFY_INSTANCES_KNOB, e))?;

		Ok((Self { watches }, stream))
	}
}

impl WatchBackend for RawWatch {
	type Descriptor = WatchDescriptor;

	fn add(&mut self, path: &Path) -> Result<WatchDescriptor, Error> {
		let descriptor = self
			.watches
			.add(path, WATCH_MASK)
			.map_err(|e| Error::from_io(path, e))?;

		trace!(path = %path.display(), ?descriptor, "Added inotify watch;");

		Ok(descriptor)
	}

	fn remove(&mut self, descriptor: WatchDescriptor) {
		if let Err(e) = self.watches.remove(descriptor.clone()) {
			debug!(?e, ?descriptor, "Watch was already released by the kernel;");
		}
	}
}
