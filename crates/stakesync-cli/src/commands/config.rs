use stakesync_core::util::parse_server_url;
use stakesync_core::ConflictResolutionStrategy;

use crate::config_profiles::{normalize_profile_name, CliProfilesConfig};
use crate::error::CliError;

pub fn normalize_server_url(raw: String) -> Result<String, CliError> {
    parse_server_url(&raw).map_err(|reason| CliError::Config(reason.to_string()))
}

pub fn run_config_init(
    profile: Option<&str>,
    server_url: Option<String>,
    api_token: Option<String>,
    default_strategy: Option<ConflictResolutionStrategy>,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile);

    let stored = config.profile_mut_or_default(&profile_name);
    if let Some(url) = server_url {
        stored.server_url = Some(normalize_server_url(url)?);
    }
    if api_token.is_some() {
        stored.api_token = api_token;
    }
    if default_strategy.is_some() {
        stored.default_strategy = default_strategy;
    }

    if !no_activate || normalize_profile_name(config.active_profile.as_deref()).is_none() {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save().map_err(CliError::Config)?;
    println!("Saved profile '{}' to {}", profile_name, path.display());
    Ok(())
}

pub fn run_config_show(profile: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile);

    println!("Profile: {profile_name}");
    let Some(stored) = config.profile(&profile_name) else {
        println!("  (not configured)");
        return Ok(());
    };
    println!(
        "  server_url: {}",
        stored.server_url().as_deref().unwrap_or("(unset)")
    );
    println!(
        "  api_token: {}",
        if stored.api_token().is_some() {
            "[REDACTED]"
        } else {
            "(unset)"
        }
    );
    println!(
        "  default_strategy: {}",
        stored
            .default_strategy
            .map_or_else(|| "(manual)".to_string(), |strategy| strategy.to_string())
    );
    Ok(())
}
