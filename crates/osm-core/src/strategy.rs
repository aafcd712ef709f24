use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DdlStrategy {
    #[default]
    Vitess,
    GhOst,
    PtOsc,
    Mysql,
    Direct,
}

impl DdlStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlStrategy::Vitess => "vitess",
            DdlStrategy::GhOst => "gh-ost",
            DdlStrategy::PtOsc => "pt-osc",
            DdlStrategy::Mysql => "mysql",
            DdlStrategy::Direct => "direct",
        }
    }

    /// Direct migrations bypass the scheduler entirely.
    pub fn is_direct(&self) -> bool {
        matches!(self, DdlStrategy::Direct)
    }
}

impl fmt::Display for DdlStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DdlStrategy {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "" | "vitess" | "online" => Ok(DdlStrategy::Vitess),
            "gh-ost" | "ghost" => Ok(DdlStrategy::GhOst),
            "pt-osc" => Ok(DdlStrategy::PtOsc),
            "mysql" => Ok(DdlStrategy::Mysql),
            "direct" => Ok(DdlStrategy::Direct),
            other => Err(CoreError::InvalidStrategy(format!(
                "unknown strategy: {other}"
            ))),
        }
    }
}

/// Scheduling-relevant flags of a DDL strategy. Flags the scheduler does not
/// interpret are kept verbatim in `executor_flags` for the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyOptions {
    pub strategy: DdlStrategy,
    #[serde(default)]
    pub allow_concurrent: bool,
    #[serde(default)]
    pub postpone_launch: bool,
    #[serde(default)]
    pub postpone_completion: bool,
    #[serde(default)]
    pub prefer_instant_ddl: bool,
    #[serde(default)]
    pub executor_flags: Vec<String>,
}

impl StrategyOptions {
    /// Parses a strategy setting such as `vitess --allow-concurrent -postpone-completion`.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let mut tokens = input.split_whitespace().peekable();
        let strategy = match tokens.peek() {
            Some(first) if !first.starts_with('-') => {
                let strategy = first.parse::<DdlStrategy>()?;
                tokens.next();
                strategy
            }
            _ => DdlStrategy::default(),
        };

        let mut options = StrategyOptions {
            strategy,
            ..StrategyOptions::default()
        };

        for token in tokens {
            let Some(flag) = token.strip_prefix("--").or_else(|| token.strip_prefix('-')) else {
                return Err(CoreError::InvalidStrategy(format!(
                    "expected flag, found {token:?}"
                )));
            };
            match flag {
                "allow-concurrent" => options.allow_concurrent = true,
                "postpone-launch" => options.postpone_launch = true,
                "postpone-completion" => options.postpone_completion = true,
                "prefer-instant-ddl" => options.prefer_instant_ddl = true,
                "" => {
                    return Err(CoreError::InvalidStrategy(
                        "empty flag in strategy".to_string(),
                    ))
                }
                _ => options.executor_flags.push(format!("--{flag}")),
            }
        }

        Ok(options)
    }

    pub fn to_setting_string(&self) -> String {
        let mut parts = vec![self.strategy.as_str().to_string()];
        if self.allow_concurrent {
            parts.push("--allow-concurrent".to_string());
        }
        if self.postpone_launch {
            parts.push("--postpone-launch".to_string());
        }
        if self.postpone_completion {
            parts.push("--postpone-completion".to_string());
        }
        if self.prefer_instant_ddl {
            parts.push("--prefer-instant-ddl".to_string());
        }
        parts.extend(self.executor_flags.iter().cloned());
        parts.join(" ")
    }
}

impl FromStr for StrategyOptions {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        StrategyOptions::parse(input)
    }
}
