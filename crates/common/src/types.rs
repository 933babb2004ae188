// Core domain types shared across all Chronicle crates.

use serde::{Deserialize, Serialize};

/// Encounter family a challenge belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    /// Six-stage party raid.
    Theatre,
    /// Twelve-wave solo gauntlet.
    Colosseum,
}

impl ChallengeType {
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Theatre => "theatre",
            Self::Colosseum => "colosseum",
        }
    }

    /// First real stage of this encounter family.
    pub const fn first_stage(self) -> Stage {
        match self {
            Self::Theatre => Stage::TheatreMaiden,
            Self::Colosseum => Stage::ColosseumWave1,
        }
    }

    /// Final stage; completing it completes the challenge.
    pub const fn final_stage(self) -> Stage {
        match self {
            Self::Theatre => Stage::TheatreVerzik,
            Self::Colosseum => Stage::ColosseumWave12,
        }
    }
}

/// Difficulty/mode of a challenge. Not every encounter family has modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeMode {
    Entry,
    Regular,
    Hard,
}

/// Discrete sub-encounter within a challenge. Discriminants give stages a
/// total order within their encounter family, so "strictly earlier stage"
/// comparisons are plain `<`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unknown = 0,

    TheatreMaiden = 10,
    TheatreBloat = 11,
    TheatreNylocas = 12,
    TheatreSotetseg = 13,
    TheatreXarpus = 14,
    TheatreVerzik = 15,

    ColosseumWave1 = 30,
    ColosseumWave2 = 31,
    ColosseumWave3 = 32,
    ColosseumWave4 = 33,
    ColosseumWave5 = 34,
    ColosseumWave6 = 35,
    ColosseumWave7 = 36,
    ColosseumWave8 = 37,
    ColosseumWave9 = 38,
    ColosseumWave10 = 39,
    ColosseumWave11 = 40,
    ColosseumWave12 = 41,
}

impl Stage {
    /// Next stage within the same encounter family, if any.
    pub const fn next(self) -> Option<Stage> {
        match self {
            Self::TheatreMaiden => Some(Self::TheatreBloat),
            Self::TheatreBloat => Some(Self::TheatreNylocas),
            Self::TheatreNylocas => Some(Self::TheatreSotetseg),
            Self::TheatreSotetseg => Some(Self::TheatreXarpus),
            Self::TheatreXarpus => Some(Self::TheatreVerzik),
            Self::ColosseumWave1 => Some(Self::ColosseumWave2),
            Self::ColosseumWave2 => Some(Self::ColosseumWave3),
            Self::ColosseumWave3 => Some(Self::ColosseumWave4),
            Self::ColosseumWave4 => Some(Self::ColosseumWave5),
            Self::ColosseumWave5 => Some(Self::ColosseumWave6),
            Self::ColosseumWave6 => Some(Self::ColosseumWave7),
            Self::ColosseumWave7 => Some(Self::ColosseumWave8),
            Self::ColosseumWave8 => Some(Self::ColosseumWave9),
            Self::ColosseumWave9 => Some(Self::ColosseumWave10),
            Self::ColosseumWave10 => Some(Self::ColosseumWave11),
            Self::ColosseumWave11 => Some(Self::ColosseumWave12),
            _ => None,
        }
    }
}

/// Progress of the stage a party is currently in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Entered,
    Started,
    Completed,
    Wiped,
}

/// Overall status of a challenge attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    InProgress,
    Completed,
    Reset,
    Wiped,
    Abandoned,
}

impl ChallengeStatus {
    /// True once the challenge can no longer change.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// How a session relates to the challenge it is streaming for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    Participant,
    Spectator,
}

/// A recorded timing split within a challenge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "split", rename_all = "snake_case")]
pub enum SplitType {
    /// Duration of one stage, in ticks.
    Stage { stage: Stage },
    /// Full challenge duration, in ticks.
    Overall,

    // Theatre sub-splits, derived from intra-stage phase transitions.
    /// Tick of the maiden 70% crab spawn.
    MaidenSeventies,
    /// Tick of the maiden 50% crab spawn.
    MaidenFifties,
    /// Tick of the maiden 30% crab spawn.
    MaidenThirties,
    /// Tick the nylocas boss spawned on.
    NyloBossSpawn,
    /// Duration of the nylocas boss fight.
    NyloBoss,
    /// Duration of sotetseg's final phase, after the second maze.
    SotetsegPhaseThree,
    /// Tick of xarpus's screech.
    XarpusScreech,
    /// Duration of xarpus's post-screech phase.
    XarpusPhaseThree,
    /// Tick of verzik's first red crab spawn.
    VerzikReds,
    /// Duration of verzik's final phase.
    VerzikPhaseThree,
}

/// Normalize an in-game name for identity comparisons: lowercased, with
/// whitespace collapsed to underscores.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
}

/// Deterministic join/create key for a party attempting an encounter.
///
/// Membership, not ordering, identifies the party: names are normalized and
/// sorted before joining, so any ordering or casing of the same members
/// yields the same fingerprint. The key is immutable for the lifetime of a
/// challenge even if a member is later renamed elsewhere.
pub fn party_fingerprint(challenge: ChallengeType, party: &[String]) -> String {
    let mut members: Vec<String> = party.iter().map(|name| normalize_name(name)).collect();
    members.sort();
    format!("{}:{}", challenge.tag(), members.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_order_and_casing() {
        let forward = party_fingerprint(
            ChallengeType::Theatre,
            &["Alice".to_string(), "bob jones".to_string()],
        );
        let reversed = party_fingerprint(
            ChallengeType::Theatre,
            &["BOB Jones".to_string(), "alice".to_string()],
        );
        assert_eq!(forward, reversed);
        assert_eq!(forward, "theatre:alice-bob_jones");
    }

    #[test]
    fn fingerprint_distinguishes_challenge_type() {
        let party = vec!["Solo".to_string()];
        assert_ne!(
            party_fingerprint(ChallengeType::Theatre, &party),
            party_fingerprint(ChallengeType::Colosseum, &party),
        );
    }

    #[test]
    fn stage_ordering_within_family() {
        assert!(Stage::TheatreMaiden < Stage::TheatreBloat);
        assert!(Stage::ColosseumWave1 < Stage::ColosseumWave12);
        assert_eq!(Stage::TheatreXarpus.next(), Some(Stage::TheatreVerzik));
        assert_eq!(Stage::TheatreVerzik.next(), None);
        assert_eq!(Stage::ColosseumWave12.next(), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ChallengeStatus::InProgress.is_terminal());
        assert!(ChallengeStatus::Completed.is_terminal());
        assert!(ChallengeStatus::Abandoned.is_terminal());
    }
}
