//! User-Agent selection.
//!
//! A fixed agent is sent unless random agents are enabled, in which case a
//! new one is drawn from a built-in list on the first request and then every
//! `interval` requests.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::thread_rng;

pub const DEFAULT_ROTATION_INTERVAL: u64 = 10;

/// `CarpetBag v<crate version>`.
pub fn default_user_agent() -> String {
    format!("CarpetBag v{}", crate::VERSION)
}

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
        "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
    ]
});

/// Built-in pool used for random agents.
pub fn user_agents() -> &'static [&'static str] {
    &USER_AGENTS
}

/// Picks a random agent, avoiding `exclude` when another choice exists.
pub fn random_user_agent(exclude: Option<&str>) -> &'static str {
    let candidates: Vec<&'static str> = USER_AGENTS
        .iter()
        .copied()
        .filter(|agent| Some(*agent) != exclude)
        .collect();

    let mut rng = thread_rng();
    candidates
        .choose(&mut rng)
        .or_else(|| USER_AGENTS.choose(&mut rng))
        .copied()
        .unwrap_or("")
}

/// Decides which agent goes on each request.
#[derive(Debug, Clone)]
pub struct UserAgentRotator {
    fixed: Option<String>,
    random: bool,
    interval: u64,
    current: Option<String>,
    since_rotation: u64,
}

impl Default for UserAgentRotator {
    fn default() -> Self {
        Self::fixed(default_user_agent())
    }
}

impl UserAgentRotator {
    pub fn fixed(agent: impl Into<String>) -> Self {
        Self {
            fixed: Some(agent.into()),
            random: false,
            interval: DEFAULT_ROTATION_INTERVAL,
            current: None,
            since_rotation: 0,
        }
    }

    pub fn random(interval: u64) -> Self {
        Self {
            fixed: None,
            random: true,
            interval: interval.max(1),
            current: None,
            since_rotation: 0,
        }
    }

    pub fn set_fixed(&mut self, agent: Option<String>) {
        self.fixed = agent;
    }

    pub fn set_random(&mut self, random: bool) {
        self.random = random;
    }

    pub fn is_random(&self) -> bool {
        self.random
    }

    /// Agent for the next request. A fixed agent always wins over random.
    pub fn next_agent(&mut self) -> Option<String> {
        if let Some(agent) = &self.fixed {
            return Some(agent.clone());
        }
        if !self.random {
            return None;
        }

        if self.current.is_none() || self.since_rotation >= self.interval {
            let agent = random_user_agent(self.current.as_deref());
            log::debug!("rotating user agent to {agent}");
            self.current = Some(agent.to_string());
            self.since_rotation = 0;
        }
        self.since_rotation += 1;
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_carries_version() {
        assert_eq!(default_user_agent(), format!("CarpetBag v{}", env!("CARGO_PKG_VERSION")));
        let mut rotator = UserAgentRotator::default();
        assert_eq!(rotator.next_agent(), Some(default_user_agent()));
    }

    #[test]
    fn random_agent_avoids_excluded() {
        let first = user_agents()[0];
        for _ in 0..20 {
            assert_ne!(random_user_agent(Some(first)), first);
        }
    }

    #[test]
    fn random_rotation_holds_for_interval() {
        let mut rotator = UserAgentRotator::random(3);
        let first = rotator.next_agent().unwrap();
        assert_eq!(rotator.next_agent().unwrap(), first);
        assert_eq!(rotator.next_agent().unwrap(), first);
        let fourth = rotator.next_agent().unwrap();
        assert_ne!(fourth, first);
        assert!(user_agents().contains(&fourth.as_str()));
    }

    #[test]
    fn neither_fixed_nor_random_sends_nothing() {
        let mut rotator = UserAgentRotator::fixed("x");
        rotator.set_fixed(None);
        assert_eq!(rotator.next_agent(), None);
    }
}
