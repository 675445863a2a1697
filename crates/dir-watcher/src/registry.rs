//! Bookkeeping behind the watch service: which paths have listeners, which observer claims
//! which path, and how filesystem changes reshape both.
//!
//! Invariants kept here:
//! - one observer per [`NodeIdentity`], every aliasing path is attached to it;
//! - every monitored path is claimed by an observer whose node was its `stat()` result when it
//!   was last checked, and a mismatch is reconciled (see `check_node`) before it is armed again;
//! - an observer without paths does not exist, it is stopped when its last path goes away.
//!
//! Nothing in here calls listeners. Operations push [`Delivery`] values (an event plus the
//! listeners snapshotted for it) that the service hands out after releasing its lock.

use std::{
	collections::{HashMap, HashSet},
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
};

use tracing::{debug, trace, warn};

use crate::{
	config::WatchServiceConfig,
	error::Error,
	event::{Listener, ListenerRef, WatchEvent},
	node::NodeIdentity,
	observer::{decode, Change, PathObserver},
	raw::{RawEvent, WatchBackend},
};

#[derive(Debug)]
pub(crate) struct Delivery {
	pub event: WatchEvent,
	pub listeners: Vec<ListenerRef>,
}

impl Delivery {
	pub fn dispatch(&self) {
		for listener in &self.listeners {
			listener.notify(&self.event);
		}
	}
}

pub(crate) struct Registry<B: WatchBackend> {
	backend: B,
	config: WatchServiceConfig,
	/// Registrations, ignored paths included.
	listeners: HashMap<PathBuf, Vec<ListenerRef>>,
	/// Registered paths that are armed. Their direct child directories are armed too.
	monitored: HashSet<PathBuf>,
	observers: HashMap<B::Descriptor, PathObserver<B::Descriptor>>,
	by_node: HashMap<NodeIdentity, B::Descriptor>,
	by_path: HashMap<PathBuf, B::Descriptor>,
}

impl<B: WatchBackend> Registry<B> {
	pub fn new(backend: B, config: WatchServiceConfig) -> Self {
		Self {
			backend,
			config,
			listeners: HashMap::new(),
			monitored: HashSet::new(),
			observers: HashMap::new(),
			by_node: HashMap::new(),
			by_path: HashMap::new(),
		}
	}

	pub fn is_monitored(&self, path: &Path) -> bool {
		self.monitored.contains(path)
	}

	pub fn has_observer(&self, path: &Path) -> bool {
		self.by_path.contains_key(path)
	}

	pub fn observed_node(&self, path: &Path) -> Option<NodeIdentity> {
		self.by_path
			.get(path)
			.and_then(|descriptor| self.observers.get(descriptor))
			.map(PathObserver::node)
	}

	pub fn watch_count(&self) -> usize {
		self.observers.len()
	}

	/// Records `listener` without arming anything, used as is for ignored paths.
	pub fn add_listener(&mut self, path: PathBuf, listener: ListenerRef) {
		let listeners = self.listeners.entry(path).or_default();
		if !listeners.iter().any(|existing| existing.same(&listener)) {
			listeners.push(listener);
		}
	}

	/// Arms `path` (and its child directories, one level deep) if it isn't monitored yet, then
	/// records `listener` on it. On failure nothing of this registration is left behind.
	///
	/// `child_dirs` is the listing gathered before taking the lock; `None` lists them now.
	pub fn register(
		&mut self,
		path: &Path,
		node: NodeIdentity,
		child_dirs: Option<Vec<(PathBuf, NodeIdentity)>>,
		listener: ListenerRef,
		deliveries: &mut Vec<Delivery>,
	) -> Result<(), Error> {
		self.check_node(path, node, deliveries);

		if !self.monitored.contains(path) {
			self.monitor(path, node, child_dirs, deliveries)?;
		}

		self.add_listener(path.to_path_buf(), listener);

		Ok(())
	}

	/// Removes `listener` from `path`. Once the path has no listener left it is disarmed, along
	/// with the child directories that were only armed for its sake. No-op if absent.
	pub fn unregister<L: Listener + ?Sized>(&mut self, path: &Path, listener: &Arc<L>) {
		let Some(listeners) = self.listeners.get_mut(path) else {
			return;
		};

		listeners.retain(|existing| !existing.is(listener));

		if listeners.is_empty() {
			self.listeners.remove(path);
			self.unmonitor(path);
		}
	}

	pub fn handle_event(&mut self, event: RawEvent<B::Descriptor>) -> Vec<Delivery> {
		let mut deliveries = vec![];

		let Some(observer) = self.observers.get(&event.descriptor) else {
			trace!(?event, "Ignoring event for a released watch;");
			return deliveries;
		};

		let node = observer.node();
		let paths = observer.paths().map(Path::to_path_buf).collect::<Vec<_>>();
		let changes = decode(event.mask, event.name.as_deref());

		trace!(?event, ?changes, ?paths, "Decoded raw event;");

		for path in &paths {
			for change in &changes {
				self.apply(path, node, change, &mut deliveries);
			}
		}

		if changes.contains(&Change::Invalidated) {
			self.invalidate(&event.descriptor, &mut deliveries);
		}

		deliveries
	}

	/// Stops every observer and forgets every registration.
	pub fn clear(&mut self) {
		for (_, mut observer) in self.observers.drain() {
			observer.stop(&mut self.backend);
		}

		self.by_node.clear();
		self.by_path.clear();
		self.monitored.clear();
		self.listeners.clear();
	}

	fn monitor(
		&mut self,
		path: &Path,
		node: NodeIdentity,
		child_dirs: Option<Vec<(PathBuf, NodeIdentity)>>,
		deliveries: &mut Vec<Delivery>,
	) -> Result<(), Error> {
		self.monitored.insert(path.to_path_buf());

		if let Err(e) = self.arm(path, node, deliveries) {
			self.monitored.remove(path);
			return Err(e);
		}

		let child_dirs = child_dirs.unwrap_or_else(|| self.backend.child_dirs(path));

		for (child_path, child_node) in child_dirs {
			if self.config.is_ignored(&child_path) {
				continue;
			}

			self.check_node(&child_path, child_node, deliveries);

			match self.arm(&child_path, child_node, deliveries) {
				Ok(()) => {}
				Err(e) if e.is_resource_exhausted() => {
					warn!(
						path = %path.display(),
						"Watch limit reached while arming child directories, rolling back;"
					);
					self.unmonitor(path);
					return Err(e);
				}
				// Gone or inaccessible since it was listed
				Err(e) => trace!(?e, "Skipping child directory;"),
			}
		}

		Ok(())
	}

	fn unmonitor(&mut self, path: &Path) {
		if !self.monitored.remove(path) {
			return;
		}

		let claimed = self
			.by_path
			.keys()
			.filter(|claimed| claimed.as_path() == path || claimed.parent() == Some(path))
			.cloned()
			.collect::<Vec<_>>();

		for claimed in claimed {
			if !self.is_needed(&claimed) {
				self.release(&claimed);
			}
		}
	}

	/// A path must stay armed while it is monitored itself or its parent is.
	fn is_needed(&self, path: &Path) -> bool {
		self.monitored.contains(path)
			|| path
				.parent()
				.is_some_and(|parent| self.monitored.contains(parent))
	}

	/// Attaches `path` to the observer of `node`, creating and starting one if needed.
	fn arm(
		&mut self,
		path: &Path,
		node: NodeIdentity,
		deliveries: &mut Vec<Delivery>,
	) -> Result<(), Error> {
		if self.by_path.contains_key(path) {
			// `check_node` ran first, so whoever claims `path` watches `node`
			return Ok(());
		}

		if let Some(descriptor) = self.by_node.get(&node).cloned() {
			if self.prune(&descriptor, deliveries) {
				self.attach(&descriptor, path);
				return Ok(());
			}
		}

		let mut observer = PathObserver::new(node);
		let descriptor = observer.start(&mut self.backend, path)?;

		if self.observers.contains_key(&descriptor) {
			// inotify answers with the existing descriptor when the inode is already watched
			debug!(
				path = %path.display(),
				?descriptor,
				"Kernel reused an existing watch, sharing its observer;"
			);
			self.attach(&descriptor, path);
			return Ok(());
		}

		observer.add_path(path.to_path_buf());
		self.by_path.insert(path.to_path_buf(), descriptor.clone());
		self.by_node.insert(node, descriptor.clone());
		self.observers.insert(descriptor, observer);

		Ok(())
	}

	fn attach(&mut self, descriptor: &B::Descriptor, path: &Path) {
		if let Some(observer) = self.observers.get_mut(descriptor) {
			observer.add_path(path.to_path_buf());
			self.by_path.insert(path.to_path_buf(), descriptor.clone());
		}
	}

	/// Drops the paths of an observer that no longer resolve to its node: they were deleted or
	/// moved and the kernel hasn't told us yet. Returns whether the observer is still alive.
	fn prune(&mut self, descriptor: &B::Descriptor, deliveries: &mut Vec<Delivery>) -> bool {
		let Some(observer) = self.observers.get_mut(descriptor) else {
			return false;
		};

		let backend = &self.backend;
		let stale = observer.remove_paths_not_resolving(|path| backend.resolve(path));

		if stale.is_empty() {
			return true;
		}

		if observer.is_empty() {
			self.drop_observer(descriptor);
		}

		for path in stale {
			self.by_path.remove(&path);
			self.remove_and_report(&path, deliveries);
		}

		self.observers.contains_key(descriptor)
	}

	/// Stale-generation guard. If `path` is claimed by an observer of another node, the path was
	/// deleted and recreated faster than the kernel reported it: the old observer is stopped and
	/// every path it held is treated as removed.
	fn check_node(&mut self, path: &Path, node: NodeIdentity, deliveries: &mut Vec<Delivery>) {
		let Some(descriptor) = self.by_path.get(path).cloned() else {
			return;
		};

		if self
			.observers
			.get(&descriptor)
			.is_some_and(|observer| observer.node() == node)
		{
			return;
		}

		debug!(
			path = %path.display(),
			%node,
			"Path now resolves to another node, dropping stale observer;"
		);

		match self.drop_observer(&descriptor) {
			Some(mut observer) => {
				for stale in observer.take_paths() {
					self.remove_and_report(&stale, deliveries);
				}
			}
			None => {
				self.by_path.remove(path);
			}
		}
	}

	fn apply(
		&mut self,
		path: &Path,
		node: NodeIdentity,
		change: &Change,
		deliveries: &mut Vec<Delivery>,
	) {
		match change {
			Change::ChildAdded { name, is_dir } => {
				let child_path = path.join(name);

				if *is_dir
					&& self.monitored.contains(path)
					&& !self.config.is_ignored(&child_path)
				{
					self.arm_created(&child_path, deliveries);
				}

				self.report(WatchEvent::created(child_path), deliveries);
			}

			Change::ChildModified(name) => {
				self.report(WatchEvent::modified(path.join(name)), deliveries);
			}

			Change::ChildRemoved(name) => {
				let child_path = path.join(name);
				self.report(WatchEvent::removed(child_path.clone()), deliveries);

				let current = self.backend.resolve(&child_path);
				let claimed = self.observed_node(&child_path);

				if current.is_none() || (claimed.is_some() && claimed != current) {
					self.remove_subtree_reporting_descendants(&child_path, deliveries);
				}
			}

			Change::SelfModified => self.report(WatchEvent::modified(path), deliveries),

			Change::SelfRemoved => {
				if self.backend.resolve(path) == Some(node) {
					// Moved into place and armed before the kernel reported the move
					trace!(path = %path.display(), "Path still resolves to its node, ignoring;");
					return;
				}

				self.remove_and_report(path, deliveries);
			}

			// Handled once per raw event, not once per path
			Change::Invalidated => {}
		}
	}

	fn arm_created(&mut self, child_path: &Path, deliveries: &mut Vec<Delivery>) {
		let Some(child_node) = self.backend.resolve(child_path) else {
			trace!(path = %child_path.display(), "New directory already gone;");
			return;
		};

		self.check_node(child_path, child_node, deliveries);

		if let Err(e) = self.arm(child_path, child_node, deliveries) {
			warn!(?e, path = %child_path.display(), "Unable to watch new directory;");
		}
	}

	fn invalidate(&mut self, descriptor: &B::Descriptor, deliveries: &mut Vec<Delivery>) {
		let Some(mut observer) = self.observers.remove(descriptor) else {
			return;
		};

		debug!(node = %observer.node(), "Kernel invalidated watch;");
		observer.invalidate();

		if self.by_node.get(&observer.node()) == Some(descriptor) {
			self.by_node.remove(&observer.node());
		}

		for path in observer.take_paths() {
			self.by_path.remove(&path);
			self.remove_and_report(&path, deliveries);
		}
	}

	fn release(&mut self, path: &Path) {
		let Some(descriptor) = self.by_path.remove(path) else {
			return;
		};

		let emptied = self
			.observers
			.get_mut(&descriptor)
			.is_some_and(|observer| {
				observer.remove_path(path);
				observer.is_empty()
			});

		if emptied {
			self.drop_observer(&descriptor);
		}
	}

	fn drop_observer(
		&mut self,
		descriptor: &B::Descriptor,
	) -> Option<PathObserver<B::Descriptor>> {
		let mut observer = self.observers.remove(descriptor)?;

		if self.by_node.get(&observer.node()) == Some(descriptor) {
			self.by_node.remove(&observer.node());
		}

		observer.stop(&mut self.backend);

		Some(observer)
	}

	/// Reports `Removed(prefix)` then tears down everything at or beneath it.
	fn remove_and_report(&mut self, prefix: &Path, deliveries: &mut Vec<Delivery>) {
		self.report(WatchEvent::removed(prefix), deliveries);
		self.remove_subtree_reporting_descendants(prefix, deliveries);
	}

	/// Registrations strictly beneath `prefix` are dropped by the teardown, their listeners get a
	/// last `Removed` for their own path.
	fn remove_subtree_reporting_descendants(
		&mut self,
		prefix: &Path,
		deliveries: &mut Vec<Delivery>,
	) {
		deliveries.extend(
			self.listeners
				.iter()
				.filter(|(path, _)| path.as_path() != prefix && path.starts_with(prefix))
				.map(|(path, listeners)| Delivery {
					event: WatchEvent::removed(path.clone()),
					listeners: listeners.clone(),
				}),
		);

		self.remove_subtree(prefix);
	}

	/// Cascading teardown: drops every registration, monitored path and claimed path at or
	/// beneath `prefix`, stopping observers left without paths.
	fn remove_subtree(&mut self, prefix: &Path) {
		self.monitored.retain(|path| !path.starts_with(prefix));
		self.listeners.retain(|path, _| !path.starts_with(prefix));
		self.by_path.retain(|path, _| !path.starts_with(prefix));

		let emptied = self
			.observers
			.iter_mut()
			.filter_map(|(descriptor, observer)| {
				observer.remove_paths_under(prefix);
				observer.is_empty().then(|| descriptor.clone())
			})
			.collect::<Vec<_>>();

		for descriptor in emptied {
			self.drop_observer(&descriptor);
		}
	}

	fn report(&self, event: WatchEvent, deliveries: &mut Vec<Delivery>) {
		let listeners = self.recipients(&event.path);
		if !listeners.is_empty() {
			deliveries.push(Delivery { event, listeners });
		}
	}

	/// Listeners of `path` and of all its ancestors, each listed once.
	fn recipients(&self, path: &Path) -> Vec<ListenerRef> {
		let mut recipients = Vec::<ListenerRef>::new();

		for candidate in path
			.ancestors()
			.filter_map(|path| self.listeners.get(path))
			.flatten()
		{
			if !recipients.iter().any(|existing| existing.same(candidate)) {
				recipients.push(candidate.clone());
			}
		}

		recipients
	}
}

impl<B: WatchBackend> fmt::Debug for Registry<B> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registry")
			.field("monitored", &self.monitored)
			.field("observers", &self.observers)
			.field("listeners", &self.listeners)
			.finish_non_exhaustive()
	}
}
