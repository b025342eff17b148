//! Host agent building blocks.

pub mod agent;
pub mod guest;
pub mod host;
pub mod hypervisor;
pub mod instance;
pub mod mounts;
pub mod portfwd;
pub mod qemu;
pub mod qmp;
pub mod reporter;
pub mod requirements;
pub mod shutdown;
pub mod teardown;
pub mod transport;
pub mod watcher;

pub use agent::{AgentOptions, HostAgent};
pub use instance::Instance;
pub use reporter::{JsonLinesReporter, Reporter};
pub use shutdown::{ShutdownOutcome, ShutdownProtocol, ShutdownReport};
pub use teardown::{FnTeardown, Teardown, TeardownStack};
