use serde::{Deserialize, Serialize};

/// One participant's stance in a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub agent_id: String,
    pub text: String,
}

impl Position {
    pub fn new(agent_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateRound {
    pub round: u32,
    pub positions: Vec<Position>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub topic: String,
    pub consensus_reached: bool,
    /// The agreed position, when consensus was reached.
    pub decision: Option<String>,
    /// Fraction of participants backing the largest group.
    pub support: f64,
    pub rounds: u32,
    /// Agent ids outside the agreeing group.
    pub dissenting: Vec<String>,
}

/// Judges whether two positions say the same thing.
pub trait Moderator: Send + Sync + 'static {
    fn equivalent(&self, a: &str, b: &str) -> bool;

    fn summarize(&self, positions: &[Position]) -> String {
        positions
            .iter()
            .map(|p| format!("{}: {}", p.agent_id, p.text))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Positions are equivalent when they match after trimming, lowercasing
/// and collapsing whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizingModerator;

impl NormalizingModerator {
    pub fn normalize(text: &str) -> String {
        text.split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Moderator for NormalizingModerator {
    fn equivalent(&self, a: &str, b: &str) -> bool {
        Self::normalize(a) == Self::normalize(b)
    }
}

/// Bounded multi-round debate among a fixed set of participants.
pub struct DebateSession {
    topic: String,
    participants: Vec<String>,
    max_rounds: u32,
    quorum: f64,
    rounds: Vec<DebateRound>,
}

impl DebateSession {
    pub fn new(topic: impl Into<String>, participants: Vec<String>, max_rounds: u32, quorum: f64) -> Self {
        Self {
            topic: topic.into(),
            participants,
            max_rounds: max_rounds.max(1),
            quorum,
            rounds: vec![],
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn rounds(&self) -> &[DebateRound] {
        &self.rounds
    }

    pub fn next_round(&self) -> u32 {
        self.rounds.len() as u32 + 1
    }

    /// Whether another round may run: budget left and quorum not yet met.
    pub fn should_continue(&self, moderator: &dyn Moderator) -> bool {
        (self.rounds.len() as u32) < self.max_rounds && !self.quorum_met(moderator)
    }

    pub fn record(&mut self, positions: Vec<Position>, moderator: &dyn Moderator) -> &DebateRound {
        let summary = moderator.summarize(&positions);
        let round = self.next_round();
        self.rounds.push(DebateRound {
            round,
            positions,
            summary,
        });
        &self.rounds[self.rounds.len() - 1]
    }

    /// Group the latest round's positions into equivalence classes, largest
    /// first. Ties keep the order in which each class first appeared.
    fn groups(&self, moderator: &dyn Moderator) -> Vec<Vec<&Position>> {
        let mut groups: Vec<Vec<&Position>> = Vec::new();
        let Some(last) = self.rounds.last() else {
            return groups;
        };
        for pos in &last.positions {
            match groups
                .iter_mut()
                .find(|g| moderator.equivalent(&g[0].text, &pos.text))
            {
                Some(group) => group.push(pos),
                None => groups.push(vec![pos]),
            }
        }
        groups.sort_by(|a, b| b.len().cmp(&a.len()));
        groups
    }

    fn support(&self, group_len: usize) -> f64 {
        if self.participants.is_empty() {
            return 0.0;
        }
        group_len as f64 / self.participants.len() as f64
    }

    pub fn quorum_met(&self, moderator: &dyn Moderator) -> bool {
        self.groups(moderator)
            .first()
            .map(|g| self.support(g.len()) >= self.quorum)
            .unwrap_or(false)
    }

    /// Decide from the final round. Without consensus, every participant
    /// outside a strict plurality is dissenting; with no plurality at all,
    /// everyone is.
    pub fn decide(&self, moderator: &dyn Moderator) -> ConsensusDecision {
        let groups = self.groups(moderator);
        let top = groups.first();
        let support = top.map(|g| self.support(g.len())).unwrap_or(0.0);
        let reached = top.is_some() && support >= self.quorum;

        let plurality = match groups.as_slice() {
            [first, second, ..] if first.len() == second.len() => None,
            [first, ..] => Some(first),
            [] => None,
        };
        let majority: Vec<&str> = plurality
            .map(|g| g.iter().map(|p| p.agent_id.as_str()).collect())
            .unwrap_or_default();
        let dissenting = self
            .participants
            .iter()
            .filter(|id| !majority.contains(&id.as_str()))
            .cloned()
            .collect();

        ConsensusDecision {
            topic: self.topic.clone(),
            consensus_reached: reached,
            decision: if reached {
                top.map(|g| g[0].text.clone())
            } else {
                None
            },
            support,
            rounds: self.rounds.len() as u32,
            dissenting,
        }
    }
}
