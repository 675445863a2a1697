//! One live kernel watch bound to one inode, and the decoding of its raw events.

use std::{
	collections::BTreeSet,
	ffi::{OsStr, OsString},
	path::{Path, PathBuf},
};

use inotify::EventMask;
use tracing::debug;

use crate::{
	error::Error,
	node::NodeIdentity,
	raw::WatchBackend,
};

/// Logical outcome of a raw event, relative to the directory being watched.
///
/// A single raw event can produce a child outcome and a self outcome at once: creating a file
/// both adds a child and bumps the directory's own timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
	/// Created or moved in. `is_dir` comes from `IN_ISDIR`.
	ChildAdded { name: OsString, is_dir: bool },
	/// Attribute, content or close-after-write.
	ChildModified(OsString),
	/// Deleted or moved out.
	ChildRemoved(OsString),
	SelfModified,
	SelfRemoved,
	/// The kernel dropped the watch (`IN_IGNORED`), for whatever reason it chose.
	Invalidated,
}

/// Decodes the kernel mask of one event in a single place, so nothing else has to test bits.
pub(crate) fn decode(mask: EventMask, name: Option<&OsStr>) -> Vec<Change> {
	let mut changes = Vec::with_capacity(2);
	let name = name.filter(|name| !name.is_empty());

	if let Some(name) = name {
		if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
			changes.push(Change::ChildAdded {
				name: name.to_os_string(),
				is_dir: mask.contains(EventMask::ISDIR),
			});
		} else if mask.intersects(EventMask::ATTRIB | EventMask::MODIFY | EventMask::CLOSE_WRITE) {
			changes.push(Change::ChildModified(name.to_os_string()));
		} else if mask.intersects(EventMask::MOVED_FROM | EventMask::DELETE) {
			changes.push(Change::ChildRemoved(name.to_os_string()));
		}
	}

	if (mask.contains(EventMask::ATTRIB) && name.is_none())
		|| mask.intersects(
			EventMask::CREATE | EventMask::MOVED_TO | EventMask::MOVED_FROM | EventMask::DELETE,
		) {
		changes.push(Change::SelfModified);
	} else if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
		changes.push(Change::SelfRemoved);
	}

	if mask.contains(EventMask::IGNORED) {
		changes.push(Change::Invalidated);
	}

	changes
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State<D> {
	New,
	Watching(D),
	Stopped,
}

/// Owns exactly one kernel watch descriptor for one [`NodeIdentity`], and records every logical
/// path currently known to resolve to that node.
///
/// Lifecycle is `New -> Watching -> Stopped`; a stopped observer is discarded and never
/// restarted. Watching the node again takes a brand-new observer.
#[derive(Debug)]
pub(crate) struct PathObserver<D> {
	node: NodeIdentity,
	paths: BTreeSet<PathBuf>,
	state: State<D>,
}

impl<D: Clone + PartialEq> PathObserver<D> {
	pub fn new(node: NodeIdentity) -> Self {
		Self {
			node,
			paths: BTreeSet::new(),
			state: State::New,
		}
	}

	/// Arms the kernel watch using `path` to reach the node.
	pub fn start<B>(&mut self, backend: &mut B, path: &Path) -> Result<D, Error>
	where
		B: WatchBackend<Descriptor = D>,
	{
		debug_assert!(matches!(self.state, State::New), "observer started twice");

		let descriptor = backend.add(path)?;
		self.state = State::Watching(descriptor.clone());
		debug!(path = %path.display(), node = %self.node, "Started path observer;");

		Ok(descriptor)
	}

	/// Releases the kernel watch. Safe to call in any state.
	pub fn stop<B>(&mut self, backend: &mut B)
	where
		B: WatchBackend<Descriptor = D>,
	{
		if let State::Watching(descriptor) = std::mem::replace(&mut self.state, State::Stopped) {
			backend.remove(descriptor);
			debug!(node = %self.node, paths = ?self.paths, "Stopped path observer;");
		}
	}

	/// The kernel already dropped the watch, nothing to release.
	pub fn invalidate(&mut self) {
		self.state = State::Stopped;
	}

	pub const fn node(&self) -> NodeIdentity {
		self.node
	}

	pub fn add_path(&mut self, path: PathBuf) -> bool {
		self.paths.insert(path)
	}

	pub fn remove_path(&mut self, path: &Path) -> bool {
		self.paths.remove(path)
	}

	pub fn paths(&self) -> impl Iterator<Item = &Path> {
		self.paths.iter().map(PathBuf::as_path)
	}

	pub fn is_empty(&self) -> bool {
		self.paths.is_empty()
	}

	/// Removes and returns every path equal to or beneath `prefix`.
	pub fn remove_paths_under(&mut self, prefix: &Path) -> Vec<PathBuf> {
		let (removed, kept) = std::mem::take(&mut self.paths)
			.into_iter()
			.partition::<Vec<_>, _>(|path| path.starts_with(prefix));
		self.paths = kept.into_iter().collect();
		removed
	}

	/// Removes and returns every path whose current `stat()` no longer resolves to this node.
	pub fn remove_paths_not_resolving(
		&mut self,
		resolve: impl Fn(&Path) -> Option<NodeIdentity>,
	) -> Vec<PathBuf> {
		let node = self.node;
		let (removed, kept) = std::mem::take(&mut self.paths)
			.into_iter()
			.partition::<Vec<_>, _>(|path| resolve(path.as_path()) != Some(node));
		self.paths = kept.into_iter().collect();
		removed
	}

	pub fn take_paths(&mut self) -> Vec<PathBuf> {
		std::mem::take(&mut self.paths).into_iter().collect()
	}
}
