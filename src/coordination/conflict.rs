//! Conflict recording and pluggable resolution strategies.
//!
//! Competing claims over a resource or task are recorded as conflicts and
//! settled by a strategy: highest priority, earliest claim, or a vote among
//! the participants. Auto-resolution is best-effort and never propagates
//! failure back to the reporter. Unresolved conflicts age out of the table
//! after the retention window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConflictConfig;
use crate::error::{Result, WardenError};

use super::types::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Resource,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Highest-priority claimant wins.
    #[default]
    Priority,
    /// Earliest claim wins.
    Timestamp,
    /// Majority vote among the participants.
    Voting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub agent: AgentId,
    pub priority: i32,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(agent: impl Into<AgentId>, priority: i32) -> Self {
        Self {
            agent: agent.into(),
            priority,
            claimed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub winner: AgentId,
    pub strategy: ResolutionStrategy,
    pub rationale: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub kind: ConflictKind,
    /// The contested resource or task id.
    pub subject: String,
    pub claims: Vec<Claim>,
    pub resolution: Option<Resolution>,
    pub reported_at: DateTime<Utc>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn participants(&self) -> Vec<&AgentId> {
        self.claims.iter().map(|c| &c.agent).collect()
    }
}

pub struct ConflictResolver {
    conflicts: RwLock<HashMap<String, Conflict>>,
    default_strategy: ResolutionStrategy,
    retention: Duration,
    resolved: AtomicU64,
}

impl ConflictResolver {
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            conflicts: RwLock::new(HashMap::new()),
            default_strategy: config.default_strategy,
            retention: Duration::hours(config.retention_hours as i64),
            resolved: AtomicU64::new(0),
        }
    }

    /// Record a conflict over a resource or task.
    pub fn report(
        &self,
        kind: ConflictKind,
        subject: impl Into<String>,
        claims: Vec<Claim>,
    ) -> Result<Conflict> {
        if claims.is_empty() {
            return Err(WardenError::Conflict(
                "conflict reported with no claims".to_string(),
            ));
        }

        let conflict = Conflict {
            id: Uuid::new_v4().to_string(),
            kind,
            subject: subject.into(),
            claims,
            resolution: None,
            reported_at: Utc::now(),
        };

        debug!(
            conflict_id = %conflict.id,
            subject = %conflict.subject,
            participants = conflict.claims.len(),
            "Conflict reported"
        );
        self.conflicts
            .write()
            .insert(conflict.id.clone(), conflict.clone());
        Ok(conflict)
    }

    /// Resolve with an explicit strategy. `Voting` requires ballots and is
    /// rejected here; use [`resolve_with_votes`](Self::resolve_with_votes).
    pub fn resolve(&self, conflict_id: &str, strategy: ResolutionStrategy) -> Result<Resolution> {
        if strategy == ResolutionStrategy::Voting {
            return Err(WardenError::Conflict(
                "voting resolution requires ballots".to_string(),
            ));
        }
        self.resolve_inner(conflict_id, strategy, None)
    }

    /// Resolve by majority vote. Ballots map voter to candidate; only
    /// participant ballots count and the winner needs a strict majority.
    pub fn resolve_with_votes(
        &self,
        conflict_id: &str,
        votes: &HashMap<AgentId, AgentId>,
    ) -> Result<Resolution> {
        self.resolve_inner(conflict_id, ResolutionStrategy::Voting, Some(votes))
    }

    /// Attempt resolution with the configured default strategy. Failure is
    /// logged and swallowed; the reporter is never penalized.
    pub fn auto_resolve(&self, conflict_id: &str) -> Option<Resolution> {
        let result = match self.default_strategy {
            ResolutionStrategy::Voting => {
                // A vote cannot be synthesized; fall back to priority.
                self.resolve_inner(conflict_id, ResolutionStrategy::Priority, None)
            }
            strategy => self.resolve_inner(conflict_id, strategy, None),
        };

        match result {
            Ok(resolution) => Some(resolution),
            Err(e) => {
                warn!(conflict_id, error = %e, "Auto-resolution failed");
                None
            }
        }
    }

    fn resolve_inner(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        votes: Option<&HashMap<AgentId, AgentId>>,
    ) -> Result<Resolution> {
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts
            .get_mut(conflict_id)
            .ok_or_else(|| WardenError::Conflict(format!("conflict not found: {conflict_id}")))?;

        if let Some(existing) = &conflict.resolution {
            return Ok(existing.clone());
        }

        let (winner, rationale) = match strategy {
            ResolutionStrategy::Priority => Self::pick_by_priority(&conflict.claims),
            ResolutionStrategy::Timestamp => Self::pick_by_timestamp(&conflict.claims),
            ResolutionStrategy::Voting => {
                let votes = votes.ok_or_else(|| {
                    WardenError::Conflict("voting resolution requires ballots".to_string())
                })?;
                Self::pick_by_votes(&conflict.claims, votes)?
            }
        };

        let resolution = Resolution {
            winner: winner.clone(),
            strategy,
            rationale,
            resolved_at: Utc::now(),
        };
        conflict.resolution = Some(resolution.clone());
        self.resolved.fetch_add(1, Ordering::Relaxed);
        debug!(
            conflict_id,
            winner = %resolution.winner,
            strategy = ?strategy,
            "Conflict resolved"
        );
        Ok(resolution)
    }

    fn pick_by_priority(claims: &[Claim]) -> (&AgentId, String) {
        let winner = claims
            .iter()
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.claimed_at.cmp(&a.claimed_at))
                    .then_with(|| b.agent.cmp(&a.agent))
            })
            .expect("claims checked non-empty at report time");
        (
            &winner.agent,
            format!(
                "highest priority claim ({}) among {} participants",
                winner.priority,
                claims.len()
            ),
        )
    }

    fn pick_by_timestamp(claims: &[Claim]) -> (&AgentId, String) {
        let winner = claims
            .iter()
            .min_by(|a, b| {
                a.claimed_at
                    .cmp(&b.claimed_at)
                    .then_with(|| a.agent.cmp(&b.agent))
            })
            .expect("claims checked non-empty at report time");
        (
            &winner.agent,
            format!("earliest claim at {}", winner.claimed_at.to_rfc3339()),
        )
    }

    fn pick_by_votes<'a>(
        claims: &'a [Claim],
        votes: &HashMap<AgentId, AgentId>,
    ) -> Result<(&'a AgentId, String)> {
        let participants: Vec<&AgentId> = claims.iter().map(|c| &c.agent).collect();

        let mut tally: HashMap<&AgentId, usize> = HashMap::new();
        for (voter, candidate) in votes {
            if participants.contains(&voter) && participants.contains(&candidate) {
                *tally.entry(candidate).or_insert(0) += 1;
            }
        }

        let quorum = participants.len() / 2 + 1;
        let winner = tally
            .iter()
            .filter(|(_, count)| **count >= quorum)
            .max_by_key(|(_, count)| **count)
            .map(|(agent, _)| *agent);

        match winner {
            Some(agent) => {
                let count = tally[agent];
                let winner = claims
                    .iter()
                    .map(|c| &c.agent)
                    .find(|a| *a == agent)
                    .expect("winner tallied from participant ballots");
                Ok((
                    winner,
                    format!(
                        "{count} of {} votes (quorum {quorum})",
                        participants.len()
                    ),
                ))
            }
            None => Err(WardenError::Conflict(format!(
                "no candidate reached quorum of {quorum}"
            ))),
        }
    }

    pub fn get(&self, conflict_id: &str) -> Option<Conflict> {
        self.conflicts.read().get(conflict_id).cloned()
    }

    pub fn open_conflicts(&self) -> Vec<Conflict> {
        self.conflicts
            .read()
            .values()
            .filter(|c| !c.is_resolved())
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.conflicts
            .read()
            .values()
            .filter(|c| !c.is_resolved())
            .count()
    }

    pub fn resolved_total(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    /// Purge resolved conflicts and unresolved ones past the retention
    /// window. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut conflicts = self.conflicts.write();
        let before = conflicts.len();
        conflicts.retain(|_, c| !c.is_resolved() && c.reported_at > cutoff);
        let removed = before - conflicts.len();
        if removed > 0 {
            debug!(removed, "Conflict retention sweep");
        }
        removed
    }
}
