pub mod archive;
pub mod executor;
pub mod image;
pub mod logging;
pub mod output;
pub mod runtime;
pub mod utils;

pub use archive::{pack, ArchiveEntry, PackedArchive, ENTRY_MODE};
pub use executor::{Executor, ExecutorSettings, InstanceGuard};
pub use image::ensure_image;
pub use logging::init_logging;
pub use output::{collect_output, demux_frames, CollectedOutput};
pub use utils::{with_retry, GracefulShutdown, RetryConfig};

pub use runtime::{ping_within, ContainerRuntime, DockerRuntime, LogStream, WaitStatus};

#[cfg(any(test, feature = "test-util"))]
pub use runtime::{MockRuntime, RuntimeCall, WaitBehavior};
