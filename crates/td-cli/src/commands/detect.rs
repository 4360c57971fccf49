use td_core::config::Config;
use td_session::patterns::PatternMatcher;

/// Run the `detect` subcommand: report which agent (if any) a typed line
/// would launch.
pub fn run(config: &Config, line: &str) -> anyhow::Result<()> {
    let matcher = PatternMatcher::from_config(&config.detection)?;
    match matcher.classify_input_line(line) {
        Some(hit) => {
            println!(
                "{}  (tier: {:?}, confidence: {:.2})",
                hit.agent, hit.tier, hit.confidence
            );
        }
        None => {
            let known: Vec<&str> = matcher.agents().collect();
            println!("no agent detected (known: {})", known.join(", "));
        }
    }
    Ok(())
}
