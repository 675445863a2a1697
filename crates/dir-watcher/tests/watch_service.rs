#![allow(clippy::unwrap_used, clippy::panic)]

use sd_dir_watcher::{
	identity_of, ChannelListener, Error, Listener, WatchEvent, WatchService, WatchServiceConfig,
};

use std::{
	path::Path,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use tempfile::{tempdir, TempDir};
use tokio::{fs, time::sleep};
use tracing::debug;
use tracing_test::traced_test;

const HUNDRED_MILLIS: Duration = Duration::from_millis(100);

fn setup_service() -> (TempDir, WatchService) {
	let service = WatchService::with_config(WatchServiceConfig::empty())
		.expect("Failed to create watch service");

	(tempdir().unwrap(), service)
}

async fn expect_event(events_rx: &chan::Receiver<WatchEvent>, expected: &WatchEvent) {
	debug!(%expected, "Waiting for event;");
	let mut tries = 0;
	loop {
		match events_rx.try_recv() {
			Ok(event) => {
				debug!(%event, "Received event;");
				if &event == expected {
					debug!("Received expected event");
					break;
				}
			}
			Err(e) => {
				debug!(?e, "No event yet;");
				tries += 1;
				sleep(HUNDRED_MILLIS).await;
			}
		}

		if tries == 20 {
			panic!("No {expected} event received after 20 tries");
		}
	}
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
	for _ in 0..20 {
		if condition() {
			return;
		}
		sleep(HUNDRED_MILLIS).await;
	}

	panic!("Condition not met after 20 tries");
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn created_file_is_reported() {
	let (root, service) = setup_service();
	let (listener, events_rx) = ChannelListener::new();

	service.register(root.path(), &listener).unwrap();
	assert!(service.is_monitored(root.path()));

	let file_path = root.path().join("a.txt");
	fs::write(&file_path, "test").await.unwrap();

	expect_event(&events_rx, &WatchEvent::created(&file_path)).await;

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn only_remaining_listener_hears_modification() {
	let (root, service) = setup_service();
	let file_path = root.path().join("a.txt");
	fs::write(&file_path, "test").await.unwrap();

	let (first, first_rx) = ChannelListener::new();
	let (second, second_rx) = ChannelListener::new();

	service.register(root.path(), &first).unwrap();
	service.register(root.path(), &second).unwrap();
	service.unregister(root.path(), &first);
	assert_eq!(service.watch_count(), 1);

	fs::write(&file_path, "updated").await.unwrap();

	expect_event(&second_rx, &WatchEvent::modified(&file_path)).await;
	assert!(first_rx.is_empty());

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn new_subdirectory_is_watched_without_registering_it() {
	let (root, service) = setup_service();
	let (listener, events_rx) = ChannelListener::new();
	service.register(root.path(), &listener).unwrap();

	let sub = root.path().join("sub");
	fs::create_dir(&sub).await.unwrap();
	expect_event(&events_rx, &WatchEvent::created(&sub)).await;
	assert!(service.has_observer(&sub));
	assert!(!service.is_monitored(&sub));

	let grandchild = sub.join("x");
	fs::write(&grandchild, "test").await.unwrap();
	expect_event(&events_rx, &WatchEvent::created(&grandchild)).await;

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn moved_root_is_removed_and_siblings_survive() {
	let (root, service) = setup_service();
	let watched = root.path().join("t");
	let sibling = root.path().join("s");
	fs::create_dir(&watched).await.unwrap();
	fs::create_dir(&sibling).await.unwrap();

	let (listener, events_rx) = ChannelListener::new();
	let (sibling_listener, sibling_rx) = ChannelListener::new();
	service.register(&watched, &listener).unwrap();
	service.register(&sibling, &sibling_listener).unwrap();

	fs::rename(&watched, root.path().join("moved")).await.unwrap();

	expect_event(&events_rx, &WatchEvent::removed(&watched)).await;
	assert!(!service.is_monitored(&watched));
	assert!(service.is_monitored(&sibling));
	assert_eq!(service.watch_count(), 1);

	let file_path = sibling.join("still-here");
	fs::write(&file_path, "test").await.unwrap();
	expect_event(&sibling_rx, &WatchEvent::created(&file_path)).await;

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn deleted_root_tears_down_descendants() {
	let (root, service) = setup_service();
	let watched = root.path().join("d");
	let inner = watched.join("inner");
	fs::create_dir_all(&inner).await.unwrap();

	let (listener, events_rx) = ChannelListener::new();
	let (inner_listener, inner_rx) = ChannelListener::new();
	service.register(&watched, &listener).unwrap();
	service.register(&inner, &inner_listener).unwrap();

	fs::remove_dir_all(&watched).await.unwrap();

	expect_event(&events_rx, &WatchEvent::removed(&watched)).await;
	expect_event(&inner_rx, &WatchEvent::removed(&inner)).await;
	wait_until(|| service.watch_count() == 0).await;

	assert!(!service.is_monitored(&watched));
	assert!(!service.is_monitored(&inner));
	assert!(!service.has_observer(&inner));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn recreated_directory_gets_a_fresh_observer() {
	let (root, service) = setup_service();
	let watched = root.path().join("d");
	fs::create_dir(&watched).await.unwrap();

	let (first, _first_rx) = ChannelListener::new();
	service.register(&watched, &first).unwrap();

	// Created before the removal so the new directory can't reuse the old inode
	let replacement = root.path().join("replacement");
	fs::create_dir(&replacement).await.unwrap();
	fs::remove_dir_all(&watched).await.unwrap();
	fs::rename(&replacement, &watched).await.unwrap();

	let (second, _second_rx) = ChannelListener::new();
	service.register(&watched, &second).unwrap();

	assert_eq!(
		service.observed_node(&watched),
		Some(identity_of(&watched).unwrap())
	);
	assert!(service.is_monitored(&watched));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn aliased_paths_share_one_watch() {
	let (root, service) = setup_service();
	let target = root.path().join("target");
	let link = root.path().join("link");
	fs::create_dir(&target).await.unwrap();
	fs::symlink(&target, &link).await.unwrap();

	let (listener, events_rx) = ChannelListener::new();
	service.register(&target, &listener).unwrap();
	service.register(&link, &listener).unwrap();

	assert_eq!(service.watch_count(), 1);
	assert_eq!(service.observed_node(&target), service.observed_node(&link));

	let file_path = target.join("a.txt");
	fs::write(&file_path, "test").await.unwrap();
	expect_event(&events_rx, &WatchEvent::created(&file_path)).await;
	expect_event(&events_rx, &WatchEvent::created(link.join("a.txt"))).await;

	service.unregister(&target, &listener);
	assert_eq!(service.watch_count(), 1);
	service.unregister(&link, &listener);
	assert_eq!(service.watch_count(), 0);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn unregister_releases_child_watches_and_is_idempotent() {
	let (root, service) = setup_service();
	fs::create_dir(root.path().join("a")).await.unwrap();
	fs::create_dir(root.path().join("b")).await.unwrap();
	fs::write(root.path().join("file"), "test").await.unwrap();

	let (listener, _events_rx) = ChannelListener::new();
	service.register(root.path(), &listener).unwrap();
	assert_eq!(service.watch_count(), 3);
	assert!(service.has_observer(root.path().join("a")));

	service.unregister(root.path(), &listener);
	assert_eq!(service.watch_count(), 0);
	assert!(!service.is_monitored(root.path()));
	assert!(!service.has_observer(root.path().join("a")));

	service.unregister(root.path(), &listener);
	assert_eq!(service.watch_count(), 0);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn ignored_paths_are_never_watched() {
	let root = tempdir().unwrap();
	let ignored = root.path().join("ignored");
	fs::create_dir(&ignored).await.unwrap();

	let service = WatchService::with_config(WatchServiceConfig::default().with_ignored(&ignored))
		.unwrap();
	let (listener, _events_rx) = ChannelListener::new();

	assert!(!service.is_watchable("/proc/self"));
	assert!(!service.is_watchable(&ignored));
	assert!(service.is_watchable(root.path()));

	service.register(&ignored, &listener).unwrap();
	assert_eq!(service.watch_count(), 0);
	assert!(!service.is_monitored(&ignored));

	// ignored children of a watched directory are skipped too
	service.register(root.path(), &listener).unwrap();
	assert_eq!(service.watch_count(), 1);
	assert!(!service.has_observer(&ignored));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn missing_path_fails_without_leftovers() {
	let (root, service) = setup_service();
	let (listener, _events_rx) = ChannelListener::new();
	let missing = root.path().join("missing");

	assert!(matches!(
		service.register(&missing, &listener),
		Err(Error::NotFound(p)) if &*p == missing.as_path()
	));
	assert_eq!(service.watch_count(), 0);
	assert!(!service.is_monitored(&missing));

	service.shutdown().await;
}

struct RegisteringListener {
	service: Arc<WatchService>,
	inner: Arc<ChannelListener>,
}

impl Listener for RegisteringListener {
	fn on_event(&self, event: &WatchEvent) {
		if event.path().is_dir() {
			if let Err(e) = self.service.register(event.path(), &self.inner) {
				debug!(?e, "Unable to register from listener;");
			}
		}
	}
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn listeners_can_register_from_callbacks() {
	let (root, service) = setup_service();
	let service = Arc::new(service);
	let (inner, _inner_rx) = ChannelListener::new();

	let listener = Arc::new(RegisteringListener {
		service: Arc::clone(&service),
		inner,
	});
	service.register(root.path(), &listener).unwrap();

	let sub = root.path().join("sub");
	fs::create_dir(&sub).await.unwrap();

	wait_until(|| service.is_monitored(&sub)).await;

	// breaks the service <-> listener cycle
	service.shutdown().await;
}

#[derive(Default)]
struct PanicsOnce {
	panicked: AtomicBool,
}

impl Listener for PanicsOnce {
	fn on_event(&self, event: &WatchEvent) {
		if !self.panicked.swap(true, Ordering::AcqRel) {
			panic!("listener failed on {event}");
		}
	}
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn event_loop_survives_a_panicking_listener() {
	let (root, service) = setup_service();
	let faulty = Arc::new(PanicsOnce::default());
	let (listener, events_rx) = ChannelListener::new();

	service.register(root.path(), &faulty).unwrap();
	service.register(root.path(), &listener).unwrap();

	fs::write(root.path().join("a"), "test").await.unwrap();
	wait_until(|| faulty.panicked.load(Ordering::Acquire)).await;

	let file_path = root.path().join("b");
	fs::write(&file_path, "test").await.unwrap();
	expect_event(&events_rx, &WatchEvent::created(&file_path)).await;
	assert!(service.is_monitored(root.path()));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn shutdown_releases_everything() {
	let (root, service) = setup_service();
	fs::create_dir(root.path().join("a")).await.unwrap();

	let (listener, _events_rx) = ChannelListener::new();
	service.register(root.path(), &listener).unwrap();
	assert_eq!(service.watch_count(), 2);

	service.shutdown().await;
	assert_eq!(service.watch_count(), 0);
	assert!(!service.is_monitored(root.path()));
	assert!(matches!(
		service.register(root.path(), &listener),
		Err(Error::Shutdown)
	));

	// second call only warns
	service.shutdown().await;
}

#[test]
fn requires_a_runtime() {
	assert!(matches!(WatchService::new(), Err(Error::NoRuntime)));
}

#[test]
fn watch_event_path_helpers() {
	let event = WatchEvent::removed(Path::new("/tmp/t"));
	assert_eq!(event.path(), Path::new("/tmp/t"));
	assert_eq!(event.to_string(), "Removed(/tmp/t)");
}
