// Typed telemetry events.
//
// Events arrive already decoded from the wire payload; the server only
// cares about their tick, the stage they belong to, and the closed set of
// kinds below.

use serde::{Deserialize, Serialize};

use crate::types::{ChallengeMode, Stage, StageStatus};

/// One decoded telemetry event from a game client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeEvent {
    /// Game tick the event occurred on, relative to the start of its stage.
    pub tick: u32,
    /// Stage the reporting client believes it is in.
    pub stage: Stage,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The closed set of event kinds the aggregation core understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Stage lifecycle transition.
    StageUpdate(StageUpdate),
    /// Intra-stage phase transition. Sub-splits are derived from these.
    StagePhase { phase: StagePhase },
    /// Mid-stream challenge metadata correction (e.g. late mode detection).
    ChallengeUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ChallengeMode>,
    },
    /// Per-tick state for one party member.
    PlayerUpdate { username: String },
    /// A party member died.
    PlayerDeath { username: String },
    NpcSpawn { npc_id: u64, room_id: u64 },
    NpcDeath { npc_id: u64, room_id: u64 },
    /// Colosseum wave handicap selection.
    HandicapChoice { handicap: Handicap },
}

/// Stage lifecycle transition reported by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageUpdate {
    pub status: StageStatus,
    /// Whether the reporting client observed the stage from its first tick.
    pub accurate: bool,
    /// Stage duration in ticks as measured by the game itself, when the
    /// client could read it. Present only on `Completed`/`Wiped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_ticks: Option<u32>,
}

/// Named phase transition within a stage, reported by clients that can
/// observe it. Each phase belongs to exactly one stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    MaidenSeventies,
    MaidenFifties,
    MaidenThirties,
    NyloBossSpawn,
    SotetsegMazeTwo,
    XarpusScreech,
    VerzikReds,
    VerzikPhaseTwoEnd,
}

impl StagePhase {
    /// The stage this phase occurs in.
    pub const fn stage(self) -> Stage {
        match self {
            Self::MaidenSeventies | Self::MaidenFifties | Self::MaidenThirties => {
                Stage::TheatreMaiden
            }
            Self::NyloBossSpawn => Stage::TheatreNylocas,
            Self::SotetsegMazeTwo => Stage::TheatreSotetseg,
            Self::XarpusScreech => Stage::TheatreXarpus,
            Self::VerzikReds | Self::VerzikPhaseTwoEnd => Stage::TheatreVerzik,
        }
    }
}

/// Colosseum wave modifiers. Choosing an already-held handicap levels it up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Handicap {
    Bees,
    Blasphemy,
    Doom,
    DynamicDuo,
    Frailty,
    Mantimayhem,
    Myopia,
    Quartet,
    RedFlag,
    Reentry,
    Relentless,
    SolarFlare,
    Totemic,
    Volatility,
}
