use crate::{OAuthError, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Opens the authorization URL for the user
pub trait Browser: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Launches the platform's default browser
///
/// Must be called from within a tokio runtime, which reaps the launcher
/// process once it exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        info!("Launching browser for OAuth authorization");

        let mut last_error = None;
        for (program, args) in launchers() {
            debug!("Trying browser launcher: {}", program);
            match spawn_detached(program, args, url) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Browser launcher {} failed: {}", program, e);
                    last_error = Some(format!("{}: {}", program, e));
                }
            }
        }

        Err(OAuthError::InvalidConfiguration(format!(
            "No browser launcher available ({})",
            last_error.unwrap_or_else(|| "unsupported platform".to_string())
        )))
    }
}

/// Start `program` without waiting for it. The runtime reaps it on exit.
fn spawn_detached(program: &str, args: &[&str], url: &str) -> std::io::Result<()> {
    Command::new(program)
        .args(args)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
}

#[cfg(target_os = "windows")]
fn launchers() -> &'static [(&'static str, &'static [&'static str])] {
    &[("rundll32", &["url.dll,FileProtocolHandler"])]
}

#[cfg(target_os = "macos")]
fn launchers() -> &'static [(&'static str, &'static [&'static str])] {
    &[("open", &[])]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn launchers() -> &'static [(&'static str, &'static [&'static str])] {
    &[("xdg-open", &[]), ("gnome-open", &[]), ("kde-open", &[])]
}
