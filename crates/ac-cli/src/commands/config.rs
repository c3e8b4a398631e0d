use ac_core::config::Config;
use anyhow::Context;

/// Run the `config` subcommand: print the effective configuration.
pub fn run(config: &Config) -> anyhow::Result<()> {
    let text = config.to_toml().context("failed to render configuration")?;
    print!("{text}");
    Ok(())
}
