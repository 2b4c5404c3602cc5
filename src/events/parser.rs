//! Script-event line parser
//!
//! Raw lines are ASCII, `;`-separated: `field0` is a sequence id (unused),
//! `field1` is a short opcode, the rest is positional per opcode. Field order
//! and count are part of the wire contract.

use tracing::{debug, warn};

use super::{ClientIdentity, Game, GameEvent, GuidNumberStyle, StatUpdateMode};

const DATA_SEPARATOR: char = ';';

/// Parse failures that matter beyond a single dropped line.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Too few fields or an unparseable numeric field. Handled internally by
    /// dropping the event; never escapes `parse_script_event`.
    #[error("malformed event data: {0}")]
    Malformed(String),

    /// The stat-update mode character was not one of `+`, `-`, `=`. This
    /// indicates a wire-protocol mismatch and is surfaced to the caller.
    #[error("'{0}' is not a valid stat update mode")]
    UnknownStatUpdateMode(char),
}

/// Converts one raw script-event line into a typed [`GameEvent`].
pub struct EventParser {
    game: Game,
}

impl EventParser {
    pub fn new(game: Game) -> Self {
        Self { game }
    }

    /// Parse a raw line. `Ok(None)` means the line was ignorable (too short,
    /// unknown opcode, or malformed fields); only a bad stat-update mode is
    /// an error.
    pub fn parse_script_event(&self, raw: &str) -> Result<Option<GameEvent>, ParseError> {
        let fields: Vec<&str> = raw.split(DATA_SEPARATOR).collect();

        if fields.len() < 2 {
            debug!(data = raw, "ignoring script event, not enough data");
            return Ok(None);
        }

        let opcode = fields[1];
        let data = &fields[2..];

        let parsed = match opcode {
            "K" => self.parse_kill_shape(data).map(
                |(victim, attacker, weapon, damage, means_of_death, hit_location)| {
                    GameEvent::PlayerKilled {
                        victim,
                        attacker,
                        weapon,
                        damage,
                        means_of_death,
                        hit_location,
                    }
                },
            ),
            "D" => self.parse_kill_shape(data).map(
                |(victim, attacker, weapon, damage, means_of_death, hit_location)| {
                    GameEvent::PlayerDamaged {
                        victim,
                        attacker,
                        weapon,
                        damage,
                        means_of_death,
                        hit_location,
                    }
                },
            ),
            "AK" => self.parse_kill_shape(data).map(
                |(victim, attacker, weapon, damage, means_of_death, hit_location)| {
                    GameEvent::ZombieKilled {
                        victim,
                        attacker,
                        weapon,
                        damage,
                        means_of_death,
                        hit_location,
                    }
                },
            ),
            "AD" => self.parse_kill_shape(data).map(
                |(victim, attacker, weapon, damage, means_of_death, hit_location)| {
                    GameEvent::ZombieDamaged {
                        victim,
                        attacker,
                        weapon,
                        damage,
                        means_of_death,
                        hit_location,
                    }
                },
            ),
            "PD" => self
                .parse_actor(data)
                .map(|client| GameEvent::PlayerDowned { client }),
            "PR" => self.parse_actor_pair(data).map(|(revived, reviver)| {
                GameEvent::PlayerRevived { revived, reviver }
            }),
            "PC" => self.parse_actor_with_trailing(data).map(|(client, perk_name)| {
                GameEvent::PlayerConsumedPerk { client, perk_name }
            }),
            "PG" => self
                .parse_actor_with_trailing(data)
                .map(|(client, powerup_name)| GameEvent::PlayerGrabbedPowerup {
                    client,
                    powerup_name,
                }),
            "RD" => self.parse_round_data(data),
            "RC" => parse_round_complete(data),
            "SU" => return self.parse_stat_updated(data).map(Some),
            other => {
                warn!(opcode = other, "no parser registered for script event type");
                return Ok(None);
            }
        };

        match parsed {
            Ok(event) => Ok(Some(event)),
            Err(ParseError::Malformed(detail)) => {
                debug!(data = raw, detail, "dropping malformed script event");
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Victim identity (fields 0-3), attacker identity (4-7), weapon (8),
    /// damage (9), means-of-death (10), hit location (11).
    #[allow(clippy::type_complexity)]
    fn parse_kill_shape(
        &self,
        data: &[&str],
    ) -> Result<(ClientIdentity, ClientIdentity, String, i64, String, String), ParseError> {
        let victim = self.parse_identity(data, 0)?;
        let attacker = self.parse_identity(data, 4)?;
        let weapon = field(data, 8)?.to_string();
        let damage = parse_int(field(data, 9)?)?;
        let means_of_death = field(data, 10)?.to_string();
        let hit_location = field(data, 11)?.to_string();

        Ok((victim, attacker, weapon, damage, means_of_death, hit_location))
    }

    fn parse_actor(&self, data: &[&str]) -> Result<ClientIdentity, ParseError> {
        self.parse_identity(data, 0)
    }

    fn parse_actor_pair(
        &self,
        data: &[&str],
    ) -> Result<(ClientIdentity, ClientIdentity), ParseError> {
        Ok((self.parse_identity(data, 0)?, self.parse_identity(data, 4)?))
    }

    fn parse_actor_with_trailing(
        &self,
        data: &[&str],
    ) -> Result<(ClientIdentity, String), ParseError> {
        let client = self.parse_identity(data, 0)?;
        let trailing = data
            .last()
            .ok_or_else(|| ParseError::Malformed("missing trailing field".to_string()))?;
        Ok((client, trailing.to_string()))
    }

    fn parse_round_data(&self, data: &[&str]) -> Result<GameEvent, ParseError> {
        let client = self.parse_identity(data, 0)?;

        Ok(GameEvent::PlayerRoundData {
            client,
            total_score: parse_int(field(data, 4)?)?,
            current_score: parse_int(field(data, 5)?)?,
            current_round: parse_int32(field(data, 6)?)?,
            is_game_over: field(data, 7)? == "1",
        })
    }

    fn parse_stat_updated(&self, data: &[&str]) -> Result<GameEvent, ParseError> {
        let client = self.parse_identity(data, 0)?;

        if data.len() < 2 {
            return Err(ParseError::Malformed("stat update missing fields".to_string()));
        }

        let stat_tag = data[data.len() - 2].to_string();
        let raw_value = data[data.len() - 1];
        let mode_char = raw_value
            .chars()
            .next()
            .ok_or_else(|| ParseError::Malformed("empty stat value".to_string()))?;

        let mode = match mode_char {
            '+' => StatUpdateMode::Increment,
            '-' => StatUpdateMode::Decrement,
            '=' => StatUpdateMode::Absolute,
            other => return Err(ParseError::UnknownStatUpdateMode(other)),
        };

        let stat_value = parse_int(&raw_value[1..])?;

        Ok(GameEvent::PlayerStatUpdated {
            client,
            mode,
            stat_tag,
            stat_value,
        })
    }

    /// Parse a bare identity block, as carried by the feed's client
    /// join/quit lines.
    pub fn parse_client_identity(&self, data: &[&str]) -> Result<ClientIdentity, ParseError> {
        self.parse_identity(data, 0)
    }

    /// Identity block: guid, slot, team, name starting at `offset`.
    fn parse_identity(&self, data: &[&str], offset: usize) -> Result<ClientIdentity, ParseError> {
        let guid = convert_guid(field(data, offset)?, self.game.guid_number_style())?;
        let slot = parse_int32(field(data, offset + 1)?)?;
        let team = field(data, offset + 2)?.to_string();
        let name = field(data, offset + 3)?.to_string();

        Ok(ClientIdentity {
            network_id: guid,
            slot,
            team,
            name,
            game: None,
        })
    }
}

fn parse_round_complete(data: &[&str]) -> Result<GameEvent, ParseError> {
    Ok(GameEvent::RoundEnd {
        round_number: parse_int32(field(data, 0)?)?,
    })
}

fn field<'a>(data: &[&'a str], index: usize) -> Result<&'a str, ParseError> {
    data.get(index)
        .copied()
        .ok_or_else(|| ParseError::Malformed(format!("missing field at index {index}")))
}

fn parse_int(raw: &str) -> Result<i64, ParseError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ParseError::Malformed(format!("'{raw}' is not an integer")))
}

fn parse_int32(raw: &str) -> Result<i32, ParseError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| ParseError::Malformed(format!("'{raw}' is not a 32-bit integer")))
}

/// Convert a wire guid to the canonical integer identity. T6 reports decimal
/// guids, the older titles report hex.
fn convert_guid(raw: &str, style: GuidNumberStyle) -> Result<i64, ParseError> {
    let trimmed = raw.trim();
    let parsed = match style {
        GuidNumberStyle::Decimal => trimmed.parse::<u64>().ok(),
        GuidNumberStyle::Hex => {
            u64::from_str_radix(trimmed.trim_start_matches("0x").trim_start_matches("0X"), 16).ok()
        }
    };

    parsed
        .map(|value| value as i64)
        .ok_or_else(|| ParseError::Malformed(format!("'{raw}' is not a valid guid")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> EventParser {
        EventParser::new(Game::T6)
    }

    #[test]
    fn parses_round_complete() {
        let event = parser().parse_script_event("1;RC;7").unwrap().unwrap();
        assert_eq!(event, GameEvent::RoundEnd { round_number: 7 });
    }

    #[test]
    fn parses_kill_event_fields() {
        let raw = "77;K;1001;0;Allies;Bob;2002;1;Axis;Alice;ar_carbine;45;MOD_RIFLE_BULLET;torso";
        let event = parser().parse_script_event(raw).unwrap().unwrap();

        match event {
            GameEvent::PlayerKilled {
                victim,
                attacker,
                weapon,
                damage,
                means_of_death,
                hit_location,
            } => {
                assert_eq!(victim.network_id, 1001);
                assert_eq!(victim.name, "Bob");
                assert_eq!(attacker.network_id, 2002);
                assert_eq!(attacker.team, "Axis");
                assert_eq!(weapon, "ar_carbine");
                assert_eq!(damage, 45);
                assert_eq!(means_of_death, "MOD_RIFLE_BULLET");
                assert_eq!(hit_location, "torso");
            }
            other => panic!("expected PlayerKilled, got {other:?}"),
        }
    }

    #[test]
    fn parses_hex_guids_for_older_titles() {
        let raw = "1;PD;deadbeef;2;Allies;Carol";
        let event = EventParser::new(Game::T4)
            .parse_script_event(raw)
            .unwrap()
            .unwrap();

        match event {
            GameEvent::PlayerDowned { client } => {
                assert_eq!(client.network_id, 0xdeadbeef);
            }
            other => panic!("expected PlayerDowned, got {other:?}"),
        }
    }

    #[test]
    fn parses_round_data() {
        let raw = "5;RD;1001;0;Allies;Bob;5400;1200;12;1";
        let event = parser().parse_script_event(raw).unwrap().unwrap();

        assert_eq!(
            event,
            GameEvent::PlayerRoundData {
                client: ClientIdentity {
                    network_id: 1001,
                    slot: 0,
                    team: "Allies".to_string(),
                    name: "Bob".to_string(),
                    game: None,
                },
                total_score: 5400,
                current_score: 1200,
                current_round: 12,
                is_game_over: true,
            }
        );
    }

    #[test]
    fn parses_stat_update_modes() {
        for (raw_value, mode, value) in [
            ("+3", StatUpdateMode::Increment, 3),
            ("-4", StatUpdateMode::Decrement, 4),
            ("=10", StatUpdateMode::Absolute, 10),
        ] {
            let raw = format!("9;SU;1001;0;Allies;Bob;custom_x;{raw_value}");
            let event = parser().parse_script_event(&raw).unwrap().unwrap();

            match event {
                GameEvent::PlayerStatUpdated {
                    mode: parsed_mode,
                    stat_tag,
                    stat_value,
                    ..
                } => {
                    assert_eq!(parsed_mode, mode);
                    assert_eq!(stat_tag, "custom_x");
                    assert_eq!(stat_value, value);
                }
                other => panic!("expected PlayerStatUpdated, got {other:?}"),
            }
        }
    }

    #[test]
    fn bad_stat_update_mode_is_an_error() {
        let raw = "9;SU;1001;0;Allies;Bob;custom_x;*3";
        let result = parser().parse_script_event(raw);
        assert!(matches!(result, Err(ParseError::UnknownStatUpdateMode('*'))));
    }

    #[test]
    fn too_few_fields_is_ignored() {
        assert!(parser().parse_script_event("77").unwrap().is_none());
    }

    #[test]
    fn unknown_opcode_is_ignored() {
        assert!(parser().parse_script_event("77;ZZ;what").unwrap().is_none());
    }

    #[test]
    fn malformed_damage_is_dropped() {
        let raw = "77;K;1001;0;Allies;Bob;2002;1;Axis;Alice;ar_carbine;lots;MOD;torso";
        assert!(parser().parse_script_event(raw).unwrap().is_none());
    }

    #[test]
    fn out_of_range_round_and_slot_are_dropped() {
        // round numbers and slots are 32-bit; larger values are malformed,
        // not truncated
        assert!(parser()
            .parse_script_event("1;RC;4294967296")
            .unwrap()
            .is_none());
        assert!(parser()
            .parse_script_event("2;PD;1001;99999999999;Allies;Bob")
            .unwrap()
            .is_none());
    }

    #[test]
    fn perk_event_takes_trailing_field() {
        let raw = "3;PC;1001;0;Allies;Bob;specialty_juggernaut";
        let event = parser().parse_script_event(raw).unwrap().unwrap();

        match event {
            GameEvent::PlayerConsumedPerk { perk_name, .. } => {
                assert_eq!(perk_name, "specialty_juggernaut");
            }
            other => panic!("expected PlayerConsumedPerk, got {other:?}"),
        }
    }
}
