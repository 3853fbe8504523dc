// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tracing::debug;

use crate::{AgentKind, AgentRegistry};

/// Routes a request to an agent kind.
///
/// An explicit kind from the request always wins.  Otherwise the first user
/// message is scored against each profile's keyword list; candidates at the
/// top score tie-break deterministically by profile priority (lower wins).
/// With no candidate above the threshold the request goes to Personal.
pub struct Router {
    /// Minimum keyword hits before a kind is considered a candidate.
    threshold: usize,
}

impl Router {
    pub fn new() -> Self {
        Self { threshold: 1 }
    }

    pub fn route(
        &self,
        registry: &AgentRegistry,
        explicit: Option<AgentKind>,
        first_message: &str,
    ) -> AgentKind {
        if let Some(kind) = explicit {
            return kind;
        }
        self.classify(registry, first_message)
    }

    /// Destination agent for transcribed voice input.  Voice itself is a
    /// capture role, never a destination.
    pub fn voice_destination(&self, registry: &AgentRegistry, transcript: &str) -> AgentKind {
        let kind = self.classify(registry, transcript);
        if kind == AgentKind::Voice {
            AgentKind::Personal
        } else {
            kind
        }
    }

    fn classify(&self, registry: &AgentRegistry, message: &str) -> AgentKind {
        let text = message.to_lowercase();
        let mut best: Option<(usize, u8, AgentKind)> = None;
        for profile in registry.profiles() {
            let score = profile
                .keywords
                .iter()
                .filter(|kw| text.contains(&kw.to_lowercase()))
                .count();
            if score < self.threshold {
                continue;
            }
            let candidate = (score, profile.priority, profile.kind);
            best = match best {
                None => Some(candidate),
                // Higher score wins; equal score falls to lower priority.
                Some((s, p, _)) if score > s || (score == s && profile.priority < p) => {
                    Some(candidate)
                }
                keep => keep,
            };
        }
        let kind = best.map(|(_, _, k)| k).unwrap_or(AgentKind::Personal);
        debug!(%kind, "routed request by message classification");
        kind
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (AgentRegistry, Router) {
        (AgentRegistry::new(), Router::new())
    }

    #[test]
    fn explicit_kind_always_wins() {
        let (reg, router) = setup();
        let kind = router.route(&reg, Some(AgentKind::Commerce), "invite my family");
        assert_eq!(kind, AgentKind::Commerce);
    }

    #[test]
    fn family_keywords_route_to_family() {
        let (reg, router) = setup();
        assert_eq!(
            router.route(&reg, None, "Please invite my sister to the family group"),
            AgentKind::Family
        );
    }

    #[test]
    fn commerce_keywords_route_to_commerce() {
        let (reg, router) = setup();
        assert_eq!(
            router.route(&reg, None, "What is the price of the new blender?"),
            AgentKind::Commerce
        );
    }

    #[test]
    fn unclassified_message_falls_back_to_personal() {
        let (reg, router) = setup();
        assert_eq!(router.route(&reg, None, "Hello there"), AgentKind::Personal);
    }

    #[test]
    fn higher_keyword_score_beats_priority() {
        let (reg, router) = setup();
        // Two workspace hits against one family hit.
        assert_eq!(
            router.route(&reg, None, "family project budget planning"),
            AgentKind::Workspace
        );
    }

    #[test]
    fn equal_scores_tie_break_by_priority() {
        let (reg, router) = setup();
        // "reminder" (personal, priority 1) vs "invite" (family, priority 2):
        // one hit each, Personal must win deterministically.
        let kind = router.route(&reg, None, "set a reminder to invite them");
        assert_eq!(kind, AgentKind::Personal);
    }

    #[test]
    fn classification_is_deterministic() {
        let (reg, router) = setup();
        let first = router.route(&reg, None, "buy a gift for my family");
        for _ in 0..10 {
            assert_eq!(router.route(&reg, None, "buy a gift for my family"), first);
        }
    }

    #[test]
    fn voice_destination_never_returns_voice() {
        let (reg, router) = setup();
        let kind = router.voice_destination(&reg, "completely unrelated text");
        assert_ne!(kind, AgentKind::Voice);
    }
}
