pub mod completions;
pub mod export;
pub mod import;
pub mod ls;

use indicatif::{ProgressBar, ProgressStyle};
use k2s_addons_core::{resolve_install_dir, AddonsConfig};
use k2s_addons_node::CommandNode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Resolved install directory and config shared by the `addons` commands.
pub struct Context {
    pub install_dir: PathBuf,
    pub config: AddonsConfig,
}

impl Context {
    /// Node collaborator driven by the configured command templates.
    pub fn node(&self) -> Arc<CommandNode> {
        Arc::new(CommandNode::new(self.config.node_commands()))
    }
}

pub fn load_context(install_dir: Option<&Path>, config: Option<&Path>) -> Result<Context, String> {
    let install_dir = resolve_install_dir(install_dir).map_err(|e| e.to_string())?;
    let config = AddonsConfig::resolve(config, &install_dir).map_err(|e| e.to_string())?;
    debug!(
        "install dir {}, {} {}",
        install_dir.display(),
        config.tool_name,
        config.tool_version
    );
    Ok(Context {
        install_dir,
        config,
    })
}

pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("manifest error:") {
        EXIT_MANIFEST_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}
