//! Job scheduling on the agent: descriptors, process control, recovery
//! records and the instance manager tying them together.

pub mod descriptor;
pub mod manager;
pub mod process;
pub mod recovery;

pub use descriptor::{JobDescriptor, JobVersion};
pub use manager::{DEFAULT_WORKERS, ExitCodePolicy, JobManager, ManagerConfig};
pub use recovery::{RecordKind, RecoveryStore};
