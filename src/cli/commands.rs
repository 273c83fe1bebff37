use clap::Subcommand;

use super::inject::InjectArgs;
use super::inspect::InspectArgs;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Mount a bundle directory and show its entry surfaces and resource handles
    Inspect(InspectArgs),

    /// Inject a bundle's content scripts into the active page of a running Chromium
    Inject(InjectArgs),
}
