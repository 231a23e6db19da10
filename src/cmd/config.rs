//! Configuration view command for `rootcause config`.

use std::path::Path;

use anyhow::Result;

use rootcause::config::{DEFAULT_CONFIG_FILE, RcaConfig};

pub fn cmd_config(path: Option<&Path>) -> Result<()> {
    let source = match path {
        Some(path) => path.display().to_string(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => DEFAULT_CONFIG_FILE.to_string(),
        None => "defaults".to_string(),
    };
    let config = RcaConfig::resolve(path)?;

    println!("# rootcause configuration (source: {}, with env overrides)", source);
    println!("# secrets are not shown");
    println!();
    print!("{}", config.to_toml()?);

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!();
        for warning in &warnings {
            println!("# warning: {}", warning);
        }
    }
    Ok(())
}
