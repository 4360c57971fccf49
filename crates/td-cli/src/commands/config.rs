use td_core::config::Config;

/// Run the `config` subcommand: print the effective configuration.
pub fn run(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
