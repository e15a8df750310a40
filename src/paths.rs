use anyhow::Context;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "relay";

/// Where configuration lives, highest precedence first:
/// `$RELAY_HOME/config`, `$XDG_CONFIG_HOME/relay`, `$HOME/.config/relay`.
fn resolve_config_dir(
    relay_home: Option<OsString>,
    xdg_config_home: Option<OsString>,
    home: Option<OsString>,
) -> Option<PathBuf> {
    let non_empty = |v: Option<OsString>| v.filter(|s| !s.is_empty()).map(PathBuf::from);

    non_empty(relay_home)
        .map(|base| base.join("config"))
        .or_else(|| non_empty(xdg_config_home).map(|xdg| xdg.join(APP_DIR)))
        .or_else(|| non_empty(home).map(|h| h.join(".config").join(APP_DIR)))
}

fn ensure_dir(path: PathBuf) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path)
}

/// Resolve and create the config directory.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let dir = resolve_config_dir(
        env::var_os("RELAY_HOME"),
        env::var_os("XDG_CONFIG_HOME"),
        env::var_os("HOME"),
    )
    .context("cannot locate a config directory: set RELAY_HOME or HOME")?;
    ensure_dir(dir)
}

pub fn app_config_path() -> anyhow::Result<PathBuf> {
    Ok(app_config_in(&config_dir()?))
}

/// Endpoint description for the bridge provider.
pub fn bridge_config_path() -> anyhow::Result<PathBuf> {
    Ok(bridge_config_in(&config_dir()?))
}

fn app_config_in(dir: &Path) -> PathBuf {
    dir.join("config.toml")
}

fn bridge_config_in(dir: &Path) -> PathBuf {
    dir.join("remote_config.json")
}
