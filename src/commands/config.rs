use anyhow::Result;
use colored::Colorize;
use logrelay::config::{self, Config, TierLimit};
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the current configuration with header values masked
pub fn show(config_path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(config_path)?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
pub fn validate(config_path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = config::load_config(config_path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!(
        "  {}: {}:{}{}",
        "Listen".cyan(),
        cfg.server.host,
        cfg.server.port,
        cfg.server.endpoint
    );
    println!(
        "  {}: {}",
        "Rate Limiting".cyan(),
        if cfg.rate_limit.enabled {
            "enabled".green()
        } else {
            "disabled".red()
        }
    );
    for (name, tier) in [
        ("global", cfg.rate_limit.global),
        ("ip", cfg.rate_limit.ip),
        ("reporter", cfg.rate_limit.reporter),
        ("app", cfg.rate_limit.app),
    ] {
        println!("    {}: {}", name, describe_tier(tier));
    }
    println!("  {}: {}", "Sinks".cyan(), enabled_sinks(&cfg).join(", "));

    Ok(())
}

/// Mask values that commonly carry credentials
fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();
    for value in sanitized.http.headers.values_mut() {
        *value = mask_secret(value);
    }
    sanitized
}

/// Shows first 7 and last 4 characters, e.g. "Bearer abcdef123456" -> "Bearer ...3456"
fn mask_secret(value: &str) -> String {
    if value.chars().count() <= 11 {
        return "***".to_string();
    }

    let prefix: String = value.chars().take(7).collect();
    let suffix: String = value
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    format!("{}...{}", prefix, suffix)
}

fn describe_tier(tier: Option<TierLimit>) -> String {
    match tier {
        Some(t) if t.is_active() => format!("{} per {}s", t.limit, t.window_seconds),
        _ => "off".to_string(),
    }
}

fn enabled_sinks(cfg: &Config) -> Vec<&'static str> {
    let mut sinks = Vec::new();
    if cfg.console.enabled {
        sinks.push("console");
    }
    if cfg.file.enabled {
        sinks.push("file");
    }
    if cfg.http.enabled {
        sinks.push("http");
    }
    if sinks.is_empty() {
        sinks.push("none");
    }
    sinks
}
