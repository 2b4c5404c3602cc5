//! Domain event model for the horde telemetry pipeline

pub mod parser;
pub mod processor;

pub use parser::EventParser;
pub use processor::EventProcessor;

use serde::{Deserialize, Serialize};

use crate::util::time::unix_millis;

/// Game titles the wire format is known for. The guid representation on the
/// wire differs per title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Game {
    T4,
    T5,
    T6,
    IW4,
}

impl Game {
    /// Number style used for guid fields emitted by this game.
    pub fn guid_number_style(self) -> GuidNumberStyle {
        match self {
            Game::T6 => GuidNumberStyle::Decimal,
            Game::T4 | Game::T5 | Game::IW4 => GuidNumberStyle::Hex,
        }
    }
}

impl std::fmt::Display for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Game::T4 => "T4",
            Game::T5 => "T5",
            Game::T6 => "T6",
            Game::IW4 => "IW4",
        };
        f.write_str(tag)
    }
}

impl std::str::FromStr for Game {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "T4" => Ok(Game::T4),
            "T5" => Ok(Game::T5),
            "T6" => Ok(Game::T6),
            "IW4" => Ok(Game::IW4),
            other => Err(format!("unknown game '{other}'")),
        }
    }
}

/// Wire representation of guid fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidNumberStyle {
    Decimal,
    Hex,
}

/// Transient identity of a client as carried on one event. Rebuilt per event
/// from raw fields; the stable key is `network_id` (+ game once annotated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub network_id: i64,
    pub slot: i32,
    pub team: String,
    pub name: String,
    /// Stamped by the processor from the owning server before dispatch.
    pub game: Option<Game>,
}

impl ClientIdentity {
    pub fn key(&self, fallback: Game) -> (i64, Game) {
        (self.network_id, self.game.unwrap_or(fallback))
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.network_id)
    }
}

/// How a dynamic stat tag value should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatUpdateMode {
    Absolute,
    Increment,
    Decrement,
}

/// A typed domain event parsed from one raw script-event line.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    PlayerKilled {
        victim: ClientIdentity,
        attacker: ClientIdentity,
        weapon: String,
        damage: i64,
        means_of_death: String,
        hit_location: String,
    },
    PlayerDamaged {
        victim: ClientIdentity,
        attacker: ClientIdentity,
        weapon: String,
        damage: i64,
        means_of_death: String,
        hit_location: String,
    },
    ZombieKilled {
        victim: ClientIdentity,
        attacker: ClientIdentity,
        weapon: String,
        damage: i64,
        means_of_death: String,
        hit_location: String,
    },
    ZombieDamaged {
        victim: ClientIdentity,
        attacker: ClientIdentity,
        weapon: String,
        damage: i64,
        means_of_death: String,
        hit_location: String,
    },
    PlayerDowned {
        client: ClientIdentity,
    },
    PlayerRevived {
        revived: ClientIdentity,
        reviver: ClientIdentity,
    },
    PlayerConsumedPerk {
        client: ClientIdentity,
        perk_name: String,
    },
    PlayerGrabbedPowerup {
        client: ClientIdentity,
        powerup_name: String,
    },
    PlayerRoundData {
        client: ClientIdentity,
        total_score: i64,
        current_score: i64,
        current_round: i32,
        is_game_over: bool,
    },
    RoundEnd {
        round_number: i32,
    },
    PlayerStatUpdated {
        client: ClientIdentity,
        mode: StatUpdateMode,
        stat_tag: String,
        stat_value: i64,
    },
}

/// Identity of the game server a feed belongs to, established by the ingest
/// hello line and carried into every state-manager call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerContext {
    pub server_id: i64,
    pub game: Game,
    pub map_name: Option<String>,
}

/// Generic kill/damage shape re-emitted to the external stats bus after an
/// event has been processed. Consumers live outside this crate; we only
/// guarantee the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticEvent {
    pub kind: SyntheticKind,
    pub origin: Option<ClientIdentity>,
    pub target: Option<ClientIdentity>,
    pub weapon: Option<String>,
    pub damage: Option<i64>,
    pub means_of_death: Option<String>,
    pub hit_location: Option<String>,
    pub round_number: Option<i32>,
    pub source: &'static str,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    Kill,
    Damage,
    RoundEnd,
}

impl SyntheticEvent {
    pub fn new(kind: SyntheticKind) -> Self {
        Self {
            kind,
            origin: None,
            target: None,
            weapon: None,
            damage: None,
            means_of_death: None,
            hit_location: None,
            round_number: None,
            source: "script",
            timestamp_ms: unix_millis(),
        }
    }

    /// Pseudo-identity used for the non-player side of a synthetic event.
    pub fn zombie_identity(game: Game) -> ClientIdentity {
        ClientIdentity {
            network_id: 0,
            slot: -1,
            team: "axis".to_string(),
            name: "Zombie".to_string(),
            game: Some(game),
        }
    }
}
