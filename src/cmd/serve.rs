//! Server command for `rootcause serve`.

use std::path::Path;

use anyhow::{Result, bail};

use rootcause::config::RcaConfig;
use rootcause::rca::capability::CapabilitySet;
use rootcause::rca::server::{ServerConfig, start_server};

/// CLI flags that take precedence over file and environment settings.
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: bool,
}

impl ServeOverrides {
    fn apply(self, config: &mut RcaConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.dev {
            config.server.dev = true;
        }
    }
}

pub async fn cmd_serve(path: Option<&Path>, overrides: ServeOverrides, dry_run: bool) -> Result<()> {
    let mut config = RcaConfig::resolve(path)?;
    overrides.apply(&mut config);

    let problems = config.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    let capabilities = if dry_run {
        tracing::warn!("dry run: capabilities replay canned output");
        CapabilitySet::scripted()
    } else {
        CapabilitySet::from_config(&config)
    };

    start_server(ServerConfig::from_config(&config), capabilities).await
}
