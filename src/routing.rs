//! Minimal reference [`TurnRouter`]: a keyword/length heuristic plus a
//! thread-name generator, driven by [`TurnRoutingMode`]. A deployment that
//! wants model-backed routing (`ai` mode) supplies its own `TurnRouter`
//! instead — this one exists so `heuristic` and `off` are usable out of the
//! box.

use async_trait::async_trait;
use tracing::warn;

use crate::collaborators::{CommonFields, RoutingDecision, TurnRouter};
use crate::config::{RoutingConfig, TurnRoutingMode};
use crate::error::OrchestratorError;

const THREAD_NAME_MAX_LEN: usize = 60;

pub struct HeuristicTurnRouter {
    mode: TurnRoutingMode,
}

impl HeuristicTurnRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { mode: config.mode }
    }

    fn heuristic_decision(content: &str) -> RoutingDecision {
        let trimmed = content.trim();
        if trimmed.ends_with('?') {
            return RoutingDecision {
                should_respond: true,
                reason: "heuristic: message looks like a question".to_string(),
            };
        }
        if trimmed.len() < 3 {
            return RoutingDecision {
                should_respond: false,
                reason: "heuristic: message too short to be a turn".to_string(),
            };
        }
        RoutingDecision {
            should_respond: true,
            reason: "heuristic: thread already owned, treating as a turn".to_string(),
        }
    }
}

#[async_trait]
impl TurnRouter for HeuristicTurnRouter {
    async fn should_respond(&self, common: &CommonFields) -> Result<RoutingDecision, OrchestratorError> {
        match self.mode {
            TurnRoutingMode::Off => Ok(RoutingDecision {
                should_respond: false,
                reason: "turn routing disabled".to_string(),
            }),
            TurnRoutingMode::Heuristic => Ok(Self::heuristic_decision(&common.content)),
            TurnRoutingMode::Ai => {
                warn!("turn_routing_mode=ai has no built-in classifier, falling back to heuristic");
                Ok(Self::heuristic_decision(&common.content))
            }
        }
    }

    async fn generate_thread_name(&self, content: &str) -> Result<String, OrchestratorError> {
        let first_line = content.lines().next().unwrap_or("").trim();
        let name = if first_line.is_empty() {
            "New session".to_string()
        } else if first_line.chars().count() > THREAD_NAME_MAX_LEN {
            let truncated: String = first_line.chars().take(THREAD_NAME_MAX_LEN - 1).collect();
            format!("{truncated}…")
        } else {
            first_line.to_string()
        };
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(content: &str) -> CommonFields {
        CommonFields {
            message_id: "m1".into(),
            channel_id: "c1".into(),
            guild_id: "g1".into(),
            author_id: "u1".into(),
            author_is_bot: false,
            mentions_everyone: false,
            mentioned_user_ids: Vec::new(),
            mentioned_role_ids: Vec::new(),
            bot_user_id: "bot".into(),
            bot_role_id: None,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn off_mode_never_responds() {
        let router = HeuristicTurnRouter::new(RoutingConfig {
            mode: TurnRoutingMode::Off,
        });
        let decision = router.should_respond(&common("are we done?")).await.unwrap();
        assert!(!decision.should_respond);
    }

    #[tokio::test]
    async fn heuristic_mode_responds_to_questions() {
        let router = HeuristicTurnRouter::new(RoutingConfig {
            mode: TurnRoutingMode::Heuristic,
        });
        let decision = router.should_respond(&common("what's next?")).await.unwrap();
        assert!(decision.should_respond);
    }

    #[tokio::test]
    async fn heuristic_mode_ignores_tiny_messages() {
        let router = HeuristicTurnRouter::new(RoutingConfig {
            mode: TurnRoutingMode::Heuristic,
        });
        let decision = router.should_respond(&common("ok")).await.unwrap();
        assert!(!decision.should_respond);
    }

    #[tokio::test]
    async fn ai_mode_falls_back_to_heuristic() {
        let router = HeuristicTurnRouter::new(RoutingConfig {
            mode: TurnRoutingMode::Ai,
        });
        let decision = router.should_respond(&common("hmm?")).await.unwrap();
        assert!(decision.should_respond);
    }

    #[tokio::test]
    async fn thread_name_truncates_long_first_line() {
        let router = HeuristicTurnRouter::new(RoutingConfig::default());
        let long = "x".repeat(100);
        let name = router.generate_thread_name(&long).await.unwrap();
        assert!(name.chars().count() <= THREAD_NAME_MAX_LEN);
        assert!(name.ends_with('…'));
    }

    #[tokio::test]
    async fn thread_name_uses_first_line_only() {
        let router = HeuristicTurnRouter::new(RoutingConfig::default());
        let name = router.generate_thread_name("fix the bug\nmore detail").await.unwrap();
        assert_eq!(name, "fix the bug");
    }

    #[tokio::test]
    async fn empty_content_gets_default_name() {
        let router = HeuristicTurnRouter::new(RoutingConfig::default());
        let name = router.generate_thread_name("").await.unwrap();
        assert_eq!(name, "New session");
    }
}
