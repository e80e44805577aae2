pub mod artifact;
pub mod config;
pub mod loader;
pub mod logging;
pub mod plugin;
pub mod protocol;  // 워커 stdin/stdout JSON-lines 프로토콜
pub mod routing;
pub mod serve;
pub mod signals;
pub mod supervisor;
pub mod vfs;
pub mod worker;

pub use artifact::{ArtifactMap, Asset};
pub use config::{SpawnConfig, WorkerConfig};
pub use plugin::{BuildOutcome, BuildStats, SpawnServerPlugin};
pub use protocol::ListeningAddress;
pub use routing::Routing;
pub use supervisor::{ReloadOutcome, Supervisor, SupervisorError, SupervisorEvent};
