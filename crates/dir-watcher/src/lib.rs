//!
//! # Dir Watcher
//!
//! Live change notification for directory trees on Linux, built on inotify.
//!
//! inotify watches are per inode and not recursive. This crate turns them into what a file
//! browser needs:
//! - Registering a directory also watches its child directories, one level deep, and new
//!   subdirectories are watched as they appear. Events are delivered to listeners of the changed
//!   path and of all its ancestors;
//! - Paths aliasing one directory (hard links, bind mounts) share a single kernel watch;
//! - A directory deleted and recreated before its events were read is detected by inode identity,
//!   and the stale watch is replaced instead of silently going deaf;
//! - Hitting the kernel watch limit fails the registration cleanly, so callers can fall back to
//!   manual refresh.
//!
//! Events are hints: they can be coalesced, lost on queue overflow, or repeated (a deleted
//! directory may be reported `Removed` both by itself and by its parent). Consumers should batch
//! them and re-read the directory instead of applying them one by one.
//!
//! Listeners run on the service's event loop after its lock is released, so they can call
//! `register`/`unregister` themselves. An event snapshotted for delivery just before an
//! `unregister` may still reach the unregistered listener.
//!
//! ## Basic example
//!
//! ```no_run
//! use sd_dir_watcher::{ChannelListener, WatchService};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), sd_dir_watcher::Error> {
//!     let service = WatchService::new()?;
//!     let (listener, events_rx) = ChannelListener::new();
//!
//!     service.register("/home/user/Documents", &listener)?;
//!
//!     while let Ok(event) = events_rx.recv().await {
//!         println!("{event}, re-reading directory");
//!     }
//!
//!     service.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod config;
mod error;
mod event;
mod node;
mod observer;
mod path;
mod raw;
mod registry;
mod service;

pub use config::WatchServiceConfig;
pub use error::Error;
pub use event::{ChannelListener, Listener, WatchEvent, WatchEventKind};
pub use node::{identity_of, NodeIdentity};
pub use path::normalize;
pub use service::WatchService;
