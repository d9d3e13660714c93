//! Local-to-remote directory synchronization.

pub mod archive;
pub mod classifier;
pub mod ignore;
pub mod syncer;
pub mod transport;
pub mod watcher;

pub use classifier::{ChangeClassifier, Pass, PendingChange};
pub use ignore::{FileIgnoreProvider, IgnoreList, IgnoreProvider, NoIgnore};
pub use syncer::Syncer;
pub use transport::{AgentApi, HttpAgentApi, TransportSink, UploadTransport};
pub use watcher::{ChangeSink, LocalWatcher, WatchChannels, POLL_INTERVAL};
