use anyhow::{Context, Result};
use directories::ProjectDirs;
use multilink_core::control::DaemonConfig;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "multilinkd.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("org", "Multilink", "multilinkd")
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Load the daemon config, falling back to defaults when the file is missing.
pub fn load(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    cfg.peer_id()
        .with_context(|| format!("invalid peer identity in {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &DaemonConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("multilinkd-config-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir.join("nested").join(CONFIG_FILE_NAME)
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let path = scratch_file("missing");
        let cfg = load(&path).expect("Failed to load defaults");
        assert_eq!(cfg.links.len(), DaemonConfig::default().links.len());
    }

    #[test]
    fn test_save_then_load() {
        let path = scratch_file("roundtrip");
        let mut cfg = DaemonConfig::default();
        cfg.peer_authname = "alice".to_string();
        cfg.short_seq = true;
        cfg.links[1].weight = 600;

        save(&path, &cfg, false).expect("Failed to save config");
        let loaded = load(&path).expect("Failed to load config");
        assert_eq!(loaded.peer_authname, "alice");
        assert!(loaded.short_seq);
        assert_eq!(loaded.links, cfg.links);
        assert_eq!(loaded.health_interval, cfg.health_interval);
    }

    #[test]
    fn test_save_refuses_overwrite() {
        let path = scratch_file("overwrite");
        let cfg = DaemonConfig::default();
        save(&path, &cfg, false).expect("Failed to save config");

        assert!(save(&path, &cfg, false).is_err());
        save(&path, &cfg, true).expect("Failed to overwrite config");
    }

    #[test]
    fn test_load_rejects_bad_discriminator() {
        let path = scratch_file("baddisc");
        ensure_parent_dir(&path).unwrap();
        fs::write(
            &path,
            "ingress_addr = \"127.0.0.1:6000\"\negress_addr = \"127.0.0.1:6001\"\nhealth_interval = \"5s\"\npeer_enddisc_b64 = \"***\"\n",
        )
        .unwrap();

        assert!(load(&path).is_err());
    }
}
