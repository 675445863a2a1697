use std::{
	io,
	path::{Path, PathBuf},
	pin::pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use inotify::{EventMask, EventOwned, EventStream};
use parking_lot::Mutex;
use tokio::{runtime::Handle, spawn, sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{
	config::WatchServiceConfig,
	error::Error,
	event::{Listener, ListenerRef},
	node::{child_directories, identity_of, NodeIdentity},
	path::normalize,
	raw::{RawEvent, RawWatch},
	registry::{Delivery, Registry},
};

type SharedRegistry = Arc<Mutex<Registry<RawWatch>>>;
type SharedEventStream = Arc<AsyncMutex<EventStream<Vec<u8>>>>;

/// Recursive, alias-aware directory watching on top of inotify.
///
/// Listeners are called from the service's event loop task, after the internal lock is released.
/// A listener may therefore observe a registration state slightly newer or older than the event
/// it receives: an event already snapshotted for delivery can still reach a listener right after
/// `unregister` returned.
pub struct WatchService {
	config: WatchServiceConfig,
	registry: SharedRegistry,
	stop_tx: chan::Sender<()>,
	handle: Mutex<Option<JoinHandle<()>>>,
	is_shutdown: AtomicBool,
}

impl WatchService {
	/// Creates a service with the default config. Must be called from within a tokio runtime.
	pub fn new() -> Result<Self, Error> {
		Self::with_config(WatchServiceConfig::default())
	}

	#[instrument(name = "watch_service", skip_all)]
	pub fn with_config(config: WatchServiceConfig) -> Result<Self, Error> {
		Handle::try_current().map_err(|_| Error::NoRuntime)?;

		let (raw, events) = RawWatch::init(config.event_buffer_size)?;
		let registry = Arc::new(Mutex::new(Registry::new(raw, config.clone())));
		let events = Arc::new(AsyncMutex::new(events));

		let (stop_tx, stop_rx) = chan::bounded(1);

		let handle = spawn({
			let registry = Arc::clone(&registry);
			async move {
				while let Err(e) = spawn(
					Self::run(Arc::clone(&registry), Arc::clone(&events), stop_rx.clone())
						.in_current_span(),
				)
				.await
				{
					if e.is_panic() {
						error!(?e, "Watch service event loop panicked;");
					} else {
						trace!("Watch service event loop was cancelled and will exit...");
						break;
					}
					trace!("Restarting watch service event loop...");
				}

				info!("Watch service event loop gracefully shutdown");
			}
			.in_current_span()
		});

		info!("Watch service started");

		Ok(Self {
			config,
			registry,
			stop_tx,
			handle: Mutex::new(Some(handle)),
			is_shutdown: AtomicBool::new(false),
		})
	}

	async fn run(registry: SharedRegistry, events: SharedEventStream, stop_rx: chan::Receiver<()>) {
		enum StreamMessage {
			NewEvent(io::Result<EventOwned>),
			Stop,
		}

		// A previous run that panicked released its guard while unwinding
		let mut events = events.lock().await;

		let mut msg_stream = pin!((
			(&mut *events).map(StreamMessage::NewEvent),
			stop_rx.map(|()| StreamMessage::Stop),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::NewEvent(Ok(event)) => Self::handle_event(&registry, event),

				StreamMessage::NewEvent(Err(e)) => error!(?e, "Failed to read inotify events;"),

				StreamMessage::Stop => {
					debug!("Stopping watch service event loop");
					break;
				}
			}
		}
	}

	fn handle_event(registry: &Mutex<Registry<RawWatch>>, event: EventOwned) {
		if event.mask.contains(EventMask::Q_OVERFLOW) {
			// Nothing to resync from, listeners re-read their directories on the next event anyway
			warn!("Kernel event queue overflowed, some events were lost;");
			return;
		}

		let deliveries = registry.lock().handle_event(RawEvent::from(event));

		deliveries.iter().for_each(Delivery::dispatch);
	}

	/// Starts delivering events under `path` to `listener`.
	///
	/// `path` and its existing child directories get kernel watches, new subdirectories are
	/// watched as they appear. Registering an ignored path records the listener without watching
	/// anything. Registering the same listener twice on a path is a no-op.
	#[instrument(skip(self, path, listener), fields(path = %path.as_ref().display()), err)]
	pub fn register<L: Listener>(
		&self,
		path: impl AsRef<Path>,
		listener: &Arc<L>,
	) -> Result<(), Error> {
		if self.is_shutdown.load(Ordering::Acquire) {
			return Err(Error::Shutdown);
		}

		let path = normalize(path.as_ref())?;
		let listener = ListenerRef::new(listener);

		if self.config.is_ignored(&path) {
			debug!("Path is ignored, recording listener without watching it;");
			self.registry.lock().add_listener(path, listener);
			return Ok(());
		}

		let node = identity_of(&path)?;

		let child_dirs = self.children_to_arm(&path, child_directories);

		let mut deliveries = vec![];
		let res = self
			.registry
			.lock()
			.register(&path, node, child_dirs, listener, &mut deliveries);

		deliveries.iter().for_each(Delivery::dispatch);

		res
	}

	/// Child directories of `path` when it isn't armed yet. Listing touches the disk, so it runs
	/// without holding the registry lock.
	fn children_to_arm(
		&self,
		path: &Path,
		list: impl FnOnce(&Path) -> Vec<(PathBuf, NodeIdentity)>,
	) -> Option<Vec<(PathBuf, NodeIdentity)>> {
		let is_monitored = self.registry.lock().is_monitored(path);

		(!is_monitored).then(|| list(path))
	}

	/// Stops delivering events under `path` to `listener`. Watches nobody needs anymore are
	/// released. No-op if `listener` wasn't registered on `path`.
	#[instrument(skip(self, path, listener), fields(path = %path.as_ref().display()))]
	pub fn unregister<L: Listener + ?Sized>(&self, path: impl AsRef<Path>, listener: &Arc<L>) {
		let Some(path) = normalized(path.as_ref()) else {
			return;
		};

		self.registry.lock().unregister(&path, listener);
	}

	/// Whether `register` would put a kernel watch on `path`.
	pub fn is_watchable(&self, path: impl AsRef<Path>) -> bool {
		normalized(path.as_ref()).is_some_and(|path| !self.config.is_ignored(&path))
	}

	pub fn is_monitored(&self, path: impl AsRef<Path>) -> bool {
		normalized(path.as_ref()).is_some_and(|path| self.registry.lock().is_monitored(&path))
	}

	pub fn has_observer(&self, path: impl AsRef<Path>) -> bool {
		normalized(path.as_ref()).is_some_and(|path| self.registry.lock().has_observer(&path))
	}

	pub fn observed_node(&self, path: impl AsRef<Path>) -> Option<NodeIdentity> {
		normalized(path.as_ref()).and_then(|path| self.registry.lock().observed_node(&path))
	}

	/// Number of kernel watches currently held.
	pub fn watch_count(&self) -> usize {
		self.registry.lock().watch_count()
	}

	/// Stops the event loop, releases every kernel watch and forgets every registration.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		if self.is_shutdown.swap(true, Ordering::AcqRel) {
			warn!("Watch service was already shut down;");
			return;
		}

		let maybe_handle = self.handle.lock().take();

		if let Some(handle) = maybe_handle {
			if self.stop_tx.send(()).await.is_err() {
				error!("Watch service stop channel closed;");
			}

			if let Err(e) = handle.await {
				error!(?e, "Failed to join watch service event loop;");
			}
		}

		self.registry.lock().clear();

		info!("Watch service shutdown");
	}
}

fn normalized(path: &Path) -> Option<PathBuf> {
	normalize(path)
		.map_err(|e| debug!(?e, "Unable to normalize path;"))
		.ok()
}

impl std::fmt::Debug for WatchService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WatchService")
			.field("config", &self.config)
			.field("registry", &self.registry)
			.field("is_shutdown", &self.is_shutdown)
			.finish_non_exhaustive()
	}
}

impl Drop for WatchService {
	fn drop(&mut self) {
		if self.handle.get_mut().take().is_some() && self.stop_tx.try_send(()).is_err() {
			error!("Unable to signal watch service event loop to stop;");
		}
	}
}
