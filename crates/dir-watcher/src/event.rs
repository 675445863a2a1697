use std::{
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_channel as chan;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
	Created,
	Modified,
	Removed,
}

/// A "something changed at `path`, re-check" signal.
///
/// Events may be coalesced or lost by the kernel, so consumers must re-derive their state from a
/// fresh read of the directory instead of applying events one by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEvent {
	pub kind: WatchEventKind,
	pub path: PathBuf,
}

impl WatchEvent {
	pub fn created(path: impl Into<PathBuf>) -> Self {
		Self {
			kind: WatchEventKind::Created,
			path: path.into(),
		}
	}

	pub fn modified(path: impl Into<PathBuf>) -> Self {
		Self {
			kind: WatchEventKind::Modified,
			path: path.into(),
		}
	}

	pub fn removed(path: impl Into<PathBuf>) -> Self {
		Self {
			kind: WatchEventKind::Removed,
			path: path.into(),
		}
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl fmt::Display for WatchEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}({})", self.kind, self.path.display())
	}
}

/// Receives events for the paths it was registered on, and for everything beneath them.
///
/// Called from the service's event loop, never while the service holds its internal lock, so an
/// implementation may call back into `register`/`unregister`. It should return quickly: every
/// other listener waits on it.
pub trait Listener: Send + Sync + 'static {
	fn on_event(&self, event: &WatchEvent);
}

impl<F> Listener for F
where
	F: Fn(&WatchEvent) + Send + Sync + 'static,
{
	fn on_event(&self, event: &WatchEvent) {
		self(event);
	}
}

/// A registered listener. Two handles are the same listener when they share an allocation.
#[derive(Clone)]
pub(crate) struct ListenerRef(Arc<dyn Listener>);

impl ListenerRef {
	pub fn new<L: Listener>(listener: &Arc<L>) -> Self {
		Self(Arc::clone(listener) as Arc<dyn Listener>)
	}

	pub fn is<L: Listener + ?Sized>(&self, listener: &Arc<L>) -> bool {
		Arc::as_ptr(&self.0).cast::<()>() == Arc::as_ptr(listener).cast::<()>()
	}

	pub fn same(&self, other: &Self) -> bool {
		self.is(&other.0)
	}

	pub fn notify(&self, event: &WatchEvent) {
		self.0.on_event(event);
	}
}

impl fmt::Debug for ListenerRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Listener({:p})", Arc::as_ptr(&self.0).cast::<()>())
	}
}

/// Forwards every event into an unbounded channel, for consumers that batch and debounce on
/// their own task before re-reading the directory.
#[derive(Debug)]
pub struct ChannelListener {
	events_tx: chan::Sender<WatchEvent>,
}

impl ChannelListener {
	#[must_use]
	pub fn new() -> (Arc<Self>, chan::Receiver<WatchEvent>) {
		let (events_tx, events_rx) = chan::unbounded();
		(Arc::new(Self { events_tx }), events_rx)
	}
}

impl Listener for ChannelListener {
	fn on_event(&self, event: &WatchEvent) {
		if self.events_tx.is_closed() {
			return;
		}

		// Unbounded, so `try_send` only fails once closed
		if self.events_tx.try_send(event.clone()).is_err() {
			error!(%event, "Unable to forward watch event to a closed channel;");
		}
	}
}
