//! Extension preview runtime.
//!
//! Takes a generated browser-extension bundle and runs it as a live preview: the popup and
//! background scripts in simulated contexts, their privileged calls served by the executor,
//! and the content scripts injected into the page the user is looking at.

pub mod bundle_dir;
pub mod config;
pub mod errors;
pub mod popup;
pub mod runtime;
pub mod telemetry;

pub use bundle_dir::load_bundle_dir;
pub use config::{LogConfig, PreviewConfig};
pub use errors::PreviewError;
pub use popup::PopupContext;
pub use runtime::{ActivePreview, MountReport, PreviewRuntime};
pub use telemetry::{init_tracing, spawn_event_logger};

pub use background_sim::{BackgroundContext, BackgroundError};
pub use bundle_store::{BundleFile, BundleInput, PopupDocument};
pub use capability_shim::{CapabilityShim, NativeScriptEngine, ScriptEngine, ScriptScope};
pub use preview_core_types::{ErrorCode, HostPlatform, PageTarget, PreviewEvent};
pub use privileged_executor::{CdpPageHost, ExecutorConfig, PrivilegedExecutor};
