//! `homunculus doctor`: diagnose system health.

use homunculus_config::{AppConfig, ConfigError, RetrievalBackendKind};
use std::path::Path;

pub async fn run(
    config_path: Option<&Path>,
    loaded: Result<AppConfig, ConfigError>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Homunculus Doctor: System Diagnostics");
    println!("========================================\n");

    let mut issues = 0;

    let shown_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    let config = match loaded {
        Ok(config) => {
            if shown_path.exists() {
                println!("  ✅ Config file valid ({})", shown_path.display());
            } else {
                println!("  ⚠️  No config file at {}, using defaults", shown_path.display());
                issues += 1;
            }
            config
        }
        Err(e) => {
            println!("  ❌ Config file invalid: {e}");
            println!("\n  ⚠️  Fix the config first; remaining checks need it.");
            return Ok(());
        }
    };

    if config.model.has_api_key() {
        println!("  ✅ API key found in {}", config.model.api_key_env);
    } else {
        println!("  ⚠️  {} is not set", config.model.api_key_env);
        issues += 1;
    }

    let data_home = &config.runtime.data_home;
    if data_home.is_dir() {
        println!("  ✅ Data home exists ({})", data_home.display());
    } else {
        println!("  ⚠️  Data home {} does not exist yet (created on first run)", data_home.display());
    }

    if config.memory.backend == RetrievalBackendKind::Qmd {
        match find_on_path(&config.memory.qmd_binary) {
            Some(path) => println!("  ✅ qmd binary found ({})", path.display()),
            None => {
                println!(
                    "  ❌ qmd binary '{}' not found; install it or set memory.backend = \"builtin\"",
                    config.memory.qmd_binary
                );
                issues += 1;
            }
        }
    } else {
        println!("  ✅ Builtin retrieval index (no external binary needed)");
    }

    let allowed = config.channels.iter().filter(|c| c.allowed).count();
    if allowed == 0 {
        println!("  ⚠️  No allowed [[channels]] entries");
        issues += 1;
    } else {
        println!("  ✅ {allowed} channel(s) configured");
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}

fn find_on_path(binary: &str) -> Option<std::path::PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
}
