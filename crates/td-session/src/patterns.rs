use regex::Regex;
use td_core::config::DetectionConfig;
use thiserror::Error;

/// Confidence of an explicit launch-command match.
pub const COMMAND_CONFIDENCE: f64 = 0.95;
/// Confidence of a startup banner / version-string match.
pub const BANNER_CONFIDENCE: f64 = 0.9;

/// Detection tiers, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchTier {
    Keyword,
    StartupBanner,
    CommandPrefix,
}

impl MatchTier {
    /// Tiers strong enough to connect on a single match.
    pub fn is_high(self) -> bool {
        self >= MatchTier::StartupBanner
    }
}

/// A satisfied matcher: which agent, how, and how sure.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub agent: String,
    pub tier: MatchTier,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern {pattern:?} for {owner}: {source}")]
    InvalidRegex {
        owner: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
enum Rule {
    Command(String),
    Banner(Regex),
    Keyword(Regex),
}

#[derive(Debug)]
struct Matcher {
    tier: MatchTier,
    agent: String,
    rule: Rule,
}

/// Stateless, tiered classifier over input lines and output batches.
///
/// The matcher table is kept sorted strongest tier first; evaluation returns
/// the first satisfied entry.
#[derive(Debug)]
pub struct PatternMatcher {
    matchers: Vec<Matcher>,
    prompts: Vec<Regex>,
    keyword_confidence: f64,
    ansi: Regex,
}

fn compile(owner: &str, pattern: &str) -> Result<Regex, PatternError> {
    Regex::new(pattern).map_err(|source| PatternError::InvalidRegex {
        owner: owner.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

impl PatternMatcher {
    pub fn from_config(config: &DetectionConfig) -> Result<Self, PatternError> {
        let mut matchers = Vec::new();
        for agent in &config.agents {
            for command in &agent.commands {
                let command = command.trim();
                if !command.is_empty() {
                    matchers.push(Matcher {
                        tier: MatchTier::CommandPrefix,
                        agent: agent.name.clone(),
                        rule: Rule::Command(command.to_string()),
                    });
                }
            }
            for banner in &agent.banners {
                matchers.push(Matcher {
                    tier: MatchTier::StartupBanner,
                    agent: agent.name.clone(),
                    rule: Rule::Banner(compile(&agent.name, banner)?),
                });
            }
            for keyword in &agent.keywords {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
                matchers.push(Matcher {
                    tier: MatchTier::Keyword,
                    agent: agent.name.clone(),
                    rule: Rule::Keyword(compile(&agent.name, &pattern)?),
                });
            }
        }
        // Stable: within a tier, config order decides.
        matchers.sort_by(|a, b| b.tier.cmp(&a.tier));

        let prompts = config
            .prompt_patterns
            .iter()
            .map(|p| compile("prompt", p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            matchers,
            prompts,
            keyword_confidence: config.keyword_confidence,
            ansi: compile("ansi", r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")?,
        })
    }

    /// Classify one completed input line against the command-prefix tier.
    ///
    /// The first token matches when it equals the command or its path
    /// basename does (`/usr/local/bin/claude`); multi-word commands match as
    /// a prefix followed by a space or end of line.
    pub fn classify_input_line(&self, line: &str) -> Option<Detection> {
        let line = line.trim();
        let first = line.split_whitespace().next()?;
        let basename = first.rsplit(['/', '\\']).next().unwrap_or(first);

        self.matchers
            .iter()
            .filter(|m| m.tier == MatchTier::CommandPrefix)
            .find(|m| match &m.rule {
                Rule::Command(cmd) => {
                    first == cmd
                        || basename == cmd
                        || line == cmd
                        || line
                            .strip_prefix(cmd.as_str())
                            .is_some_and(|rest| rest.starts_with(' '))
                }
                _ => false,
            })
            .map(|m| self.detection(m))
    }

    /// Classify an output batch: banners first, then keywords.
    pub fn classify_output(&self, text: &str) -> Option<Detection> {
        let text = self.strip_ansi(text);
        self.matchers
            .iter()
            .filter(|m| m.tier != MatchTier::CommandPrefix)
            .find(|m| match &m.rule {
                Rule::Banner(re) | Rule::Keyword(re) => re.is_match(&text),
                Rule::Command(_) => false,
            })
            .map(|m| self.detection(m))
    }

    /// Whether the batch ends on a returned shell prompt.
    pub fn is_prompt_return(&self, text: &str) -> bool {
        let text = self.strip_ansi(text);
        let Some(last) = last_visible_line(&text) else {
            return false;
        };
        self.prompts.iter().any(|re| re.is_match(last))
    }

    pub fn agents(&self) -> impl Iterator<Item = &str> {
        let mut seen: Vec<&str> = Vec::new();
        for m in &self.matchers {
            if !seen.contains(&m.agent.as_str()) {
                seen.push(&m.agent);
            }
        }
        seen.into_iter()
    }

    fn detection(&self, m: &Matcher) -> Detection {
        let confidence = match m.tier {
            MatchTier::CommandPrefix => COMMAND_CONFIDENCE,
            MatchTier::StartupBanner => BANNER_CONFIDENCE,
            MatchTier::Keyword => self.keyword_confidence,
        };
        Detection {
            agent: m.agent.clone(),
            tier: m.tier,
            confidence,
        }
    }

    fn strip_ansi<'a>(&self, text: &'a str) -> std::borrow::Cow<'a, str> {
        self.ansi.replace_all(text, "")
    }
}

/// Last non-blank line; a bare `\r` rewinds to the start of the line, so
/// only the text after it counts.
fn last_visible_line(text: &str) -> Option<&str> {
    text.lines()
        .rev()
        .filter_map(|line| line.rsplit('\r').find(|seg| !seg.trim().is_empty()))
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_core::config::AgentSignature;

    fn matcher() -> PatternMatcher {
        PatternMatcher::from_config(&DetectionConfig::default()).unwrap()
    }

    #[test]
    fn command_prefix_matches_first_token() {
        let m = matcher();
        let d = m.classify_input_line("claude --resume").unwrap();
        assert_eq!(d.agent, "claude");
        assert_eq!(d.tier, MatchTier::CommandPrefix);
        assert_eq!(d.confidence, COMMAND_CONFIDENCE);

        assert_eq!(m.classify_input_line("  codex").unwrap().agent, "codex");
        assert_eq!(
            m.classify_input_line("/usr/local/bin/gemini -p hi").unwrap().agent,
            "gemini"
        );
    }

    #[test]
    fn command_prefix_ignores_mentions() {
        let m = matcher();
        assert!(m.classify_input_line("echo claude").is_none());
        assert!(m.classify_input_line("claudette").is_none());
        assert!(m.classify_input_line("").is_none());
    }

    #[test]
    fn multi_word_commands_match_as_prefix() {
        let cfg = DetectionConfig {
            agents: vec![AgentSignature {
                name: "X".into(),
                commands: vec!["npx agent-x".into()],
                banners: vec![],
                keywords: vec![],
            }],
            ..DetectionConfig::default()
        };
        let m = PatternMatcher::from_config(&cfg).unwrap();
        assert_eq!(m.classify_input_line("npx agent-x --fast").unwrap().agent, "X");
        assert!(m.classify_input_line("npx agent-xyz").is_none());
    }

    #[test]
    fn banner_outranks_keyword() {
        let m = matcher();
        let d = m.classify_output("codex says hi\r\nWelcome to Claude Code!\r\n").unwrap();
        assert_eq!(d.agent, "claude");
        assert_eq!(d.tier, MatchTier::StartupBanner);
        assert!(d.tier.is_high());
    }

    #[test]
    fn keyword_is_low_confidence() {
        let m = matcher();
        let d = m.classify_output("thinking with Gemini...").unwrap();
        assert_eq!(d.agent, "gemini");
        assert_eq!(d.tier, MatchTier::Keyword);
        assert!(!d.tier.is_high());
        assert_eq!(d.confidence, 0.4);
        assert!(m.classify_output("total 0\r\ndrwxr-xr-x  2 me staff").is_none());
    }

    #[test]
    fn banners_survive_color_codes() {
        let m = matcher();
        let d = m.classify_output("\x1b[1;35mOpenAI Codex\x1b[0m v0.3").unwrap();
        assert_eq!(d.agent, "codex");
        assert_eq!(d.tier, MatchTier::StartupBanner);
    }

    #[test]
    fn prompt_return_on_last_line() {
        let m = matcher();
        assert!(m.is_prompt_return("bye!\r\nuser@host:~/src$ "));
        assert!(m.is_prompt_return("done\n\x1b[32m❯\x1b[0m "));
        assert!(m.is_prompt_return("$ "));
        assert!(m.is_prompt_return("PS C:\\Users\\me> "));
        assert!(m.is_prompt_return("bash-5.2$ \r\n\r\n"));
        assert!(!m.is_prompt_return("user@host:~$ ls\r\nCargo.toml  src\r\n"));
        assert!(!m.is_prompt_return("  \r\n"));
    }

    #[test]
    fn agent_ui_lines_are_not_prompts() {
        let m = matcher();
        assert!(m.is_prompt_return("~/src/app on main ❯ "));
        assert!(!m.is_prompt_return("> "));
        assert!(!m.is_prompt_return("│ > "));
        assert!(!m.is_prompt_return("│ ❯ "));
        assert!(!m.is_prompt_return("Continue?\r\n  ❯ 1. Yes, proceed"));
        assert!(!m.is_prompt_return("Tokens used: 12% of context"));
    }

    #[test]
    fn invalid_regex_names_its_owner() {
        let mut cfg = DetectionConfig::default();
        cfg.agents[1].banners.push("(broken".into());
        match PatternMatcher::from_config(&cfg) {
            Err(PatternError::InvalidRegex { owner, .. }) => assert_eq!(owner, "codex"),
            other => panic!("expected InvalidRegex, got: {other:?}"),
        }
    }

    #[test]
    fn agents_are_listed_once_each() {
        let m = matcher();
        let agents: Vec<_> = m.agents().collect();
        assert_eq!(agents, vec!["claude", "codex", "gemini", "opencode"]);
    }
}
