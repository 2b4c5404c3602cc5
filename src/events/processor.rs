//! Typed event handlers
//!
//! Applies each [`GameEvent`] to the live state: per-round counters for
//! combat events, the full aggregation pass on round data, lazy stat-tag
//! updates, and the normalized skill score. Kill, damage and round-end
//! events are additionally re-emitted in a generic shape on an outbound
//! channel for external consumers.

use std::cmp;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::records::{
    AggregateStatRecord, EventLogType, MatchClientStatRecord, QueuedRecord, RoundStatRecord,
    Shared, RECORD_KEYS, SKILL_KEYS,
};
use crate::state::{ClientStateManager, LiveState, RoundState};
use crate::store::StatsGateway;

use super::{
    ClientIdentity, Game, GameEvent, ServerContext, StatUpdateMode, SyntheticEvent, SyntheticKind,
};

/// Rounds folded into the lifetime moving averages before the weight flattens.
pub const ROUNDS_CONSIDERED: i64 = 200;

pub struct EventProcessor<G> {
    state: Arc<ClientStateManager<G>>,
    synthetic_tx: mpsc::UnboundedSender<SyntheticEvent>,
}

impl<G: StatsGateway> EventProcessor<G> {
    pub fn new(
        state: Arc<ClientStateManager<G>>,
        synthetic_tx: mpsc::UnboundedSender<SyntheticEvent>,
    ) -> Self {
        Self {
            state,
            synthetic_tx,
        }
    }

    pub async fn process_event(&self, event: GameEvent, server: &ServerContext) {
        let mut event = event;
        annotate_identities(&mut event, server.game);

        {
            let mut live = self.state.live().await;
            match &event {
                GameEvent::PlayerKilled { victim, damage, .. } => {
                    self.on_player_killed(&mut live, server, victim, *damage);
                }
                GameEvent::PlayerDamaged { victim, damage, .. } => {
                    self.on_player_damaged(&mut live, server, victim, *damage);
                }
                GameEvent::ZombieKilled {
                    attacker,
                    damage,
                    means_of_death,
                    hit_location,
                    ..
                } => {
                    self.on_zombie_killed(
                        &mut live,
                        server,
                        attacker,
                        *damage,
                        means_of_death,
                        hit_location,
                    );
                }
                GameEvent::ZombieDamaged {
                    attacker,
                    damage,
                    means_of_death,
                    hit_location,
                    ..
                } => {
                    self.on_zombie_damaged(
                        &mut live,
                        server,
                        attacker,
                        *damage,
                        means_of_death,
                        hit_location,
                    );
                }
                GameEvent::PlayerDowned { client } => {
                    self.on_player_downed(&mut live, server, client);
                }
                GameEvent::PlayerRevived { reviver, .. } => {
                    self.on_player_revived(&mut live, server, reviver);
                }
                GameEvent::PlayerConsumedPerk { client, perk_name } => {
                    self.on_player_consumed_perk(&mut live, server, client, perk_name);
                }
                GameEvent::PlayerGrabbedPowerup {
                    client,
                    powerup_name,
                } => {
                    self.on_player_grabbed_powerup(&mut live, server, client, powerup_name);
                }
                GameEvent::PlayerRoundData {
                    client,
                    total_score,
                    current_score,
                    current_round,
                    is_game_over,
                } => {
                    self.on_player_round_data(
                        &mut live,
                        server,
                        client,
                        *total_score,
                        *current_score,
                        *current_round,
                        *is_game_over,
                    );
                }
                GameEvent::RoundEnd { round_number } => {
                    self.state
                        .start_next_round(&mut live, server.server_id, *round_number);
                }
                GameEvent::PlayerStatUpdated {
                    client,
                    mode,
                    stat_tag,
                    stat_value,
                } => {
                    self.on_player_stat_updated(
                        &mut live, server, client, *mode, stat_tag, *stat_value,
                    );
                }
            }
        }

        self.emit_synthetic(&event, server.game);
    }

    fn on_player_killed(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        victim: &ClientIdentity,
        damage: i64,
    ) {
        let handled = self.run_calculation(live, server, victim, |curr| {
            let mut round = curr.record.lock();
            round.totals.deaths += 1;
            round.totals.damage_received += damage;
            drop(round);
            curr.died_at = Some(Utc::now());
        });

        if handled {
            self.state.track_event_for_log(
                live,
                server.server_id,
                EventLogType::Died,
                Some(victim),
                None,
                Some(damage as f64),
                None,
            );
        }
    }

    fn on_player_damaged(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        victim: &ClientIdentity,
        damage: i64,
    ) {
        let handled = self.run_calculation(live, server, victim, |curr| {
            curr.record.lock().totals.damage_received += damage;
        });

        if handled {
            self.state.track_event_for_log(
                live,
                server.server_id,
                EventLogType::DamageTaken,
                Some(victim),
                None,
                Some(damage as f64),
                None,
            );
        }
    }

    fn on_zombie_killed(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        attacker: &ClientIdentity,
        damage: i64,
        means_of_death: &str,
        hit_location: &str,
    ) {
        self.run_calculation(live, server, attacker, |curr| {
            let mut round = curr.record.lock();
            round.totals.kills += 1;
            round.totals.damage_dealt += damage;

            if is_headshot(hit_location, means_of_death) {
                round.totals.headshots += 1;
                round.totals.headshot_kills += 1;
            }

            if means_of_death == "MOD_MELEE" {
                round.totals.melees += 1;
            }
            drop(round);

            curr.hits += 1;
        });
    }

    fn on_zombie_damaged(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        attacker: &ClientIdentity,
        damage: i64,
        means_of_death: &str,
        hit_location: &str,
    ) {
        self.run_calculation(live, server, attacker, |curr| {
            let mut round = curr.record.lock();
            round.totals.damage_dealt += damage;

            if is_headshot(hit_location, means_of_death) {
                round.totals.headshots += 1;
            }

            if means_of_death == "MOD_MELEE" {
                round.totals.melees += 1;
            }
            drop(round);

            curr.hits += 1;
        });
    }

    fn on_player_downed(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        client: &ClientIdentity,
    ) {
        let handled = self.run_calculation(live, server, client, |curr| {
            curr.record.lock().totals.downs += 1;
        });

        if handled {
            self.state.track_event_for_log(
                live,
                server.server_id,
                EventLogType::Downed,
                Some(client),
                None,
                None,
                None,
            );
        }
    }

    fn on_player_revived(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        reviver: &ClientIdentity,
    ) {
        let handled = self.run_calculation(live, server, reviver, |curr| {
            curr.record.lock().totals.revives += 1;
        });

        if handled {
            self.state.track_event_for_log(
                live,
                server.server_id,
                EventLogType::Revived,
                Some(reviver),
                None,
                None,
                None,
            );
        }
    }

    fn on_player_consumed_perk(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        client: &ClientIdentity,
        perk_name: &str,
    ) {
        let handled = self.run_calculation(live, server, client, |curr| {
            curr.record.lock().totals.perks_consumed += 1;
        });

        if handled {
            self.state.track_event_for_log(
                live,
                server.server_id,
                EventLogType::PerkConsumed,
                Some(client),
                None,
                None,
                Some(perk_name.to_string()),
            );
        }
    }

    fn on_player_grabbed_powerup(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        client: &ClientIdentity,
        powerup_name: &str,
    ) {
        let handled = self.run_calculation(live, server, client, |curr| {
            curr.record.lock().totals.powerups_grabbed += 1;
        });

        if handled {
            self.state.track_event_for_log(
                live,
                server.server_id,
                EventLogType::PowerupGrabbed,
                Some(client),
                None,
                None,
                Some(powerup_name.to_string()),
            );
        }
    }

    fn on_player_stat_updated(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        client: &ClientIdentity,
        mode: StatUpdateMode,
        stat_tag: &str,
        stat_value: i64,
    ) {
        let Some(tag_value) =
            self.state
                .stat_tag_value_for_client(live, client, server.game, stat_tag)
        else {
            warn!(tag = stat_tag, client = %client, "cannot update stat value, no entry exists");
            return;
        };

        let mut value = tag_value.lock();
        let current = value.stat_value.unwrap_or(0);
        value.stat_value = Some(match mode {
            StatUpdateMode::Absolute => stat_value,
            StatUpdateMode::Increment => current + stat_value,
            StatUpdateMode::Decrement => current - stat_value,
        });
        let persisted = value.meta.id.is_some();
        drop(value);

        // unpersisted values are already queued as new
        if persisted {
            self.state
                .track_updated_state(QueuedRecord::TagValue(tag_value));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_player_round_data(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        client: &ClientIdentity,
        total_score: i64,
        current_score: i64,
        current_round: i32,
        is_game_over: bool,
    ) {
        let (network_id, game) = client.key(server.game);

        let Some(match_state) = live.state_for_client(network_id, game) else {
            warn!(client = %client, "no active horde match for client");
            return;
        };

        let Some(round_state) = match_state.round_states.get(&network_id) else {
            warn!(client = %client, "no active horde round for client");
            return;
        };
        let round_record = round_state.record.clone();
        let died_at = round_state.died_at;
        let hits = round_state.hits;

        let (Some(match_stat), Some(lifetime), Some(lifetime_server)) = (
            match_state.match_stats.get(&network_id).cloned(),
            match_state.lifetime_stats.get(&network_id).cloned(),
            match_state.lifetime_server_stats.get(&network_id).cloned(),
        ) else {
            warn!(client = %client, "client has no aggregate state");
            return;
        };
        let match_record = match_state.record.clone();
        let match_round_number = match_state.round_number;

        let is_forfeit = current_score == 0 && total_score == 0;
        let (prev_earned, prev_spent) = {
            let stat = match_stat.lock();
            (stat.totals.points_earned, stat.totals.points_spent)
        };

        // on the final round some games report the cumulative score as the
        // current score, so rebuild the real net value
        let mut current_score = current_score;
        if is_game_over && !is_forfeit {
            let last_round_points = total_score - prev_earned;
            current_score = last_round_points + (prev_earned - prev_spent);
        }

        let now = Utc::now();
        let round_totals = {
            let mut round = round_record.lock();
            round.points = current_score;
            round.end_time = Some(now);

            let duration = now - round.start_time;
            round.duration_ms = Some(duration.num_milliseconds());

            let mut time_alive = duration;
            if let Some(died_at) = died_at {
                time_alive = time_alive - (now - died_at);
            }
            round.time_alive_ms = Some(time_alive.num_milliseconds());

            let earned = if is_forfeit { 0 } else { total_score - prev_earned };
            let spent = if is_forfeit {
                0
            } else {
                (current_score - earned - (prev_earned - prev_spent)).abs()
            };
            round.totals.points_earned = earned;
            round.totals.points_spent = spent;

            round.totals.clone()
        };

        match_stat.lock().totals.add(&round_totals);
        lifetime.lock().totals.add(&round_totals);
        lifetime_server.lock().totals.add(&round_totals);

        if is_game_over {
            match_record.lock().clients_completed += 1;
            lifetime.lock().total_matches_completed += 1;
            lifetime_server.lock().total_matches_completed += 1;
        }

        calculate_averages_and_totals(match_round_number, &lifetime, &round_record, hits, &match_stat);
        calculate_averages_and_totals(
            match_round_number,
            &lifetime_server,
            &round_record,
            hits,
            &match_stat,
        );

        self.state.track_event_for_log(
            live,
            server.server_id,
            EventLogType::RoundCompleted,
            Some(client),
            None,
            Some(current_round as f64),
            None,
        );

        self.state
            .track_updated_state(QueuedRecord::Round(round_record));
        self.state
            .track_updated_state(QueuedRecord::MatchClientStat(match_stat));
        self.state
            .track_updated_state(QueuedRecord::Aggregate(lifetime));
        self.state
            .track_updated_state(QueuedRecord::Aggregate(lifetime_server));
    }

    /// Normalized skill score for a client, blended with their previous
    /// value. Also advances the all-time maximum records as a side effect.
    pub fn skill_for_client(
        &self,
        live: &mut LiveState,
        client: &ClientIdentity,
        game: Game,
        previous_skill: f64,
    ) -> f64 {
        let (network_id, game) = client.key(game);

        let (aggregate, round_record) = {
            let Some(match_state) = live.state_for_client(network_id, game) else {
                return previous_skill;
            };
            let Some(aggregate) = match_state.lifetime_stats.get(&network_id).cloned() else {
                return previous_skill;
            };
            let Some(round_state) = match_state.round_states.get(&network_id) else {
                return previous_skill;
            };
            (aggregate, round_state.record.clone())
        };

        let (metrics, total_rounds_played) = {
            let aggregate = aggregate.lock();
            let metrics: Vec<(&str, f64)> = RECORD_KEYS
                .iter()
                .map(|key| (*key, aggregate.metric(key).unwrap_or(0.0)))
                .collect();
            (metrics, aggregate.total_rounds_played)
        };

        let mut normalized = Vec::new();
        for (key, client_value) in metrics {
            let max_record = match self.state.client_numerical_record(live, key) {
                Some(record) => record,
                None => self.state.create_client_numerical_record(
                    live,
                    network_id,
                    round_record.clone(),
                    key,
                    client_value,
                ),
            };

            let max_value = max_record.lock().value;
            if client_value > max_value {
                let mut record = max_record.lock();
                record.value = client_value;
                record.network_id = Some(network_id);
                record.round_ref = Some(round_record.clone());
                drop(record);
                self.state
                    .track_updated_state(QueuedRecord::Numerical(max_record.clone()));
            }

            if !SKILL_KEYS.contains(&key) {
                continue;
            }

            // ratio against the maximum observed before this client's value
            let mut ratio = client_value / max_value;
            if ratio.is_nan() {
                ratio = 1.0;
            }
            normalized.push(ratio);
        }

        let mut avg = if normalized.is_empty() {
            0.0
        } else {
            normalized.iter().sum::<f64>() / normalized.len() as f64
        };
        avg *= 1000.0;

        let rounds = cmp::max(1, total_rounds_played);
        let weight = if rounds <= ROUNDS_CONSIDERED {
            1.0 / rounds as f64
        } else {
            2.0 / (ROUNDS_CONSIDERED + 1) as f64
        };

        let blended = calculate_average(previous_skill, avg, weight);
        if blended.is_infinite() {
            0.0
        } else {
            blended
        }
    }

    fn run_calculation(
        &self,
        live: &mut LiveState,
        server: &ServerContext,
        client: &ClientIdentity,
        apply: impl FnOnce(&mut RoundState),
    ) -> bool {
        let (network_id, game) = client.key(server.game);

        let Some(match_state) = live.state_for_client(network_id, game) else {
            warn!(client = %client, "no active horde match for client");
            return false;
        };

        let Some(round_state) = match_state.round_states.get_mut(&network_id) else {
            warn!(client = %client, "no active horde round for client");
            return false;
        };

        apply(round_state);

        let record = round_state.record.clone();
        self.state.track_updated_state(QueuedRecord::Round(record));
        true
    }

    fn emit_synthetic(&self, event: &GameEvent, game: Game) {
        let synthetic = match event {
            GameEvent::PlayerKilled {
                victim,
                weapon,
                damage,
                means_of_death,
                hit_location,
                ..
            } => {
                let mut out = SyntheticEvent::new(SyntheticKind::Kill);
                out.origin = Some(SyntheticEvent::zombie_identity(game));
                out.target = Some(victim.clone());
                out.weapon = Some(weapon.clone());
                out.damage = Some(*damage);
                out.means_of_death = Some(means_of_death.clone());
                out.hit_location = Some(hit_location.clone());
                out
            }
            GameEvent::ZombieKilled {
                attacker,
                weapon,
                damage,
                means_of_death,
                hit_location,
                ..
            } => {
                let mut out = SyntheticEvent::new(SyntheticKind::Kill);
                out.origin = Some(attacker.clone());
                out.target = Some(SyntheticEvent::zombie_identity(game));
                out.weapon = Some(weapon.clone());
                out.damage = Some(*damage);
                out.means_of_death = Some(means_of_death.clone());
                out.hit_location = Some(hit_location.clone());
                out
            }
            GameEvent::ZombieDamaged {
                attacker,
                weapon,
                damage,
                means_of_death,
                hit_location,
                ..
            } => {
                let mut out = SyntheticEvent::new(SyntheticKind::Damage);
                out.origin = Some(attacker.clone());
                out.target = Some(SyntheticEvent::zombie_identity(game));
                out.weapon = Some(weapon.clone());
                out.damage = Some(*damage);
                out.means_of_death = Some(means_of_death.clone());
                out.hit_location = Some(hit_location.clone());
                out
            }
            GameEvent::RoundEnd { round_number } => {
                let mut out = SyntheticEvent::new(SyntheticKind::RoundEnd);
                out.round_number = Some(*round_number);
                out
            }
            _ => return,
        };

        if self.synthetic_tx.send(synthetic).is_err() {
            debug!("synthetic event channel closed");
        }
    }
}

fn is_headshot(hit_location: &str, means_of_death: &str) -> bool {
    hit_location.starts_with("head") || means_of_death == "MOD_HEADSHOT"
}

fn annotate_identities(event: &mut GameEvent, game: Game) {
    match event {
        GameEvent::PlayerKilled { victim, attacker, .. }
        | GameEvent::PlayerDamaged { victim, attacker, .. }
        | GameEvent::ZombieKilled { victim, attacker, .. }
        | GameEvent::ZombieDamaged { victim, attacker, .. } => {
            victim.game = Some(game);
            attacker.game = Some(game);
        }
        GameEvent::PlayerDowned { client }
        | GameEvent::PlayerConsumedPerk { client, .. }
        | GameEvent::PlayerGrabbedPowerup { client, .. }
        | GameEvent::PlayerRoundData { client, .. }
        | GameEvent::PlayerStatUpdated { client, .. } => {
            client.game = Some(game);
        }
        GameEvent::PlayerRevived { revived, reviver } => {
            revived.game = Some(game);
            reviver.game = Some(game);
        }
        GameEvent::RoundEnd { .. } => {}
    }
}

fn calculate_averages_and_totals(
    match_round_number: i32,
    lifetime: &Shared<AggregateStatRecord>,
    round_record: &Shared<RoundStatRecord>,
    hits: i64,
    match_stat: &Shared<MatchClientStatRecord>,
) {
    let round = round_record.lock();
    let match_stat = match_stat.lock();
    let mut lifetime = lifetime.lock();

    let current_round_number = round.round_number;
    // no highest-round credit when less than half the match was played
    let should_count_highest = (match_round_number as i64) > lifetime.highest_round
        && match_stat
            .joined_round
            .map(|joined| {
                (current_round_number - joined) as f64 >= current_round_number as f64 / 2.0
            })
            .unwrap_or(false);
    if should_count_highest {
        lifetime.highest_round = match_round_number as i64;
    }

    lifetime.total_rounds_played += 1;

    let weight = if lifetime.total_rounds_played <= ROUNDS_CONSIDERED {
        1.0 / lifetime.total_rounds_played as f64
    } else {
        2.0 / (ROUNDS_CONSIDERED + 1) as f64
    };

    // whole rounds per down, matching the original's integer ratio
    let round_kpd =
        round.totals.kills / cmp::max(1, round.totals.deaths + round.totals.downs);
    lifetime.average_kills_per_down =
        calculate_average(lifetime.average_kills_per_down, round_kpd as f64, weight);
    lifetime.average_downs =
        calculate_average(lifetime.average_downs, match_stat.totals.downs as f64, weight);
    lifetime.average_revives = calculate_average(
        lifetime.average_revives,
        match_stat.totals.revives as f64,
        weight,
    );
    lifetime.average_round_reached = calculate_average(
        lifetime.average_round_reached,
        match_round_number as f64,
        weight,
    );
    lifetime.average_melees =
        calculate_average(lifetime.average_melees, match_stat.totals.melees as f64, weight);

    let headshot_ratio = round.totals.headshots as f64 / cmp::max(1, hits) as f64;
    lifetime.headshot_percentage =
        calculate_average(lifetime.headshot_percentage, headshot_ratio, weight);

    let duration = round.duration_ms.unwrap_or(0) as f64;
    let alive = round.time_alive_ms.unwrap_or(0) as f64;
    let alive_ratio = if duration > 0.0 { alive / duration } else { 1.0 };
    lifetime.alive_percentage =
        calculate_average(lifetime.alive_percentage, alive_ratio, weight);

    lifetime.average_points = calculate_average(
        lifetime.average_points,
        round.totals.points_earned as f64,
        weight,
    );
}

/// Exponentially-weighted moving average, rounded to two decimal places.
pub fn calculate_average(previous_average: f64, current_value: f64, factor: f64) -> f64 {
    round2(current_value * factor + previous_average * (1.0 - factor))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::records::TABLE_RECORDS;
    use crate::store::MemoryGateway;
    use tokio::sync::watch;

    fn ident(network_id: i64, name: &str) -> ClientIdentity {
        ClientIdentity {
            network_id,
            slot: 0,
            team: "allies".to_string(),
            name: name.to_string(),
            game: None,
        }
    }

    fn ctx() -> ServerContext {
        ServerContext {
            server_id: 1,
            game: Game::T6,
            map_name: Some("zm_transit".to_string()),
        }
    }

    async fn setup() -> (
        EventProcessor<MemoryGateway>,
        Arc<ClientStateManager<MemoryGateway>>,
        mpsc::UnboundedReceiver<SyntheticEvent>,
    ) {
        let manager = Arc::new(ClientStateManager::new(MemoryGateway::new()));
        manager
            .register_server(1, Game::T6, Some("zm_transit".to_string()))
            .await;
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let processor = EventProcessor::new(manager.clone(), tx);
        (processor, manager, rx)
    }

    fn zombie_kill_event(hit_location: &str, means_of_death: &str, damage: i64) -> GameEvent {
        GameEvent::ZombieKilled {
            victim: ident(0, "Zombie"),
            attacker: ident(1001, "alice"),
            weapon: "ray_gun_zm".to_string(),
            damage,
            means_of_death: means_of_death.to_string(),
            hit_location: hit_location.to_string(),
        }
    }

    #[tokio::test]
    async fn player_killed_updates_round_counters() {
        let (processor, manager, _rx) = setup().await;

        let event = GameEvent::PlayerKilled {
            victim: ident(1001, "alice"),
            attacker: ident(0, "Zombie"),
            weapon: "zombie_melee".to_string(),
            damage: 45,
            means_of_death: "MOD_MELEE".to_string(),
            hit_location: "torso_upper".to_string(),
        };
        processor.process_event(event, &ctx()).await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let round_state = &state.round_states[&1001];
        let round = round_state.record.lock();
        assert_eq!(round.totals.deaths, 1);
        assert_eq!(round.totals.damage_received, 45);
        assert!(round_state.died_at.is_some());
    }

    #[tokio::test]
    async fn headshot_classification_follows_location_prefix_and_mod() {
        let (processor, manager, _rx) = setup().await;

        processor
            .process_event(zombie_kill_event("head_upper", "MOD_RIFLE_BULLET", 100), &ctx())
            .await;
        processor
            .process_event(zombie_kill_event("torso_upper", "MOD_HEADSHOT", 100), &ctx())
            .await;
        processor
            .process_event(zombie_kill_event("torso_lower", "MOD_MELEE", 100), &ctx())
            .await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let round_state = &state.round_states[&1001];
        let round = round_state.record.lock();
        assert_eq!(round.totals.kills, 3);
        assert_eq!(round.totals.headshots, 2);
        assert_eq!(round.totals.headshot_kills, 2);
        assert_eq!(round.totals.melees, 1);
        assert_eq!(round_state.hits, 3);
    }

    #[tokio::test]
    async fn zombie_damage_counts_headshots_but_not_kills() {
        let (processor, manager, _rx) = setup().await;

        let event = GameEvent::ZombieDamaged {
            victim: ident(0, "Zombie"),
            attacker: ident(1001, "alice"),
            weapon: "m1911_zm".to_string(),
            damage: 30,
            means_of_death: "MOD_PISTOL_BULLET".to_string(),
            hit_location: "head".to_string(),
        };
        processor.process_event(event, &ctx()).await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let round = state.round_states[&1001].record.lock().clone();
        assert_eq!(round.totals.kills, 0);
        assert_eq!(round.totals.headshots, 1);
        assert_eq!(round.totals.headshot_kills, 0);
        assert_eq!(round.totals.damage_dealt, 30);
    }

    #[tokio::test]
    async fn stat_update_modes_apply_in_sequence() {
        let (processor, manager, _rx) = setup().await;

        for (mode, value) in [
            (StatUpdateMode::Increment, 3),
            (StatUpdateMode::Absolute, 10),
            (StatUpdateMode::Decrement, 4),
        ] {
            let event = GameEvent::PlayerStatUpdated {
                client: ident(1001, "alice"),
                mode,
                stat_tag: "Prestige".to_string(),
                stat_value: value,
            };
            processor.process_event(event, &ctx()).await;
        }

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let value = state.tag_values[&1001]["Prestige"].lock().stat_value;
        assert_eq!(value, Some(6));
    }

    #[tokio::test]
    async fn round_end_replay_is_idempotent() {
        let (processor, manager, _rx) = setup().await;

        processor
            .process_event(GameEvent::RoundEnd { round_number: 2 }, &ctx())
            .await;

        let record = {
            let mut live = manager.live().await;
            live.match_for_server(1).unwrap().round_states[&1001]
                .record
                .clone()
        };

        processor
            .process_event(GameEvent::RoundEnd { round_number: 2 }, &ctx())
            .await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        assert_eq!(state.round_number, 2);
        assert!(Arc::ptr_eq(&state.round_states[&1001].record, &record));
    }

    #[tokio::test]
    async fn events_without_match_context_are_dropped() {
        let (processor, manager, _rx) = setup().await;

        let event = GameEvent::PlayerDowned {
            client: ident(9999, "ghost"),
        };
        processor.process_event(event, &ctx()).await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        assert!(!state.round_states.contains_key(&9999));
    }

    #[tokio::test]
    async fn round_data_aggregates_points_and_averages() {
        let (processor, manager, _rx) = setup().await;

        processor
            .process_event(zombie_kill_event("head", "MOD_RIFLE_BULLET", 100), &ctx())
            .await;

        let event = GameEvent::PlayerRoundData {
            client: ident(1001, "alice"),
            total_score: 500,
            current_score: 300,
            current_round: 1,
            is_game_over: false,
        };
        processor.process_event(event, &ctx()).await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();

        let round = state.round_states[&1001].record.lock().clone();
        assert_eq!(round.totals.points_earned, 500);
        assert_eq!(round.totals.points_spent, 200);
        assert_eq!(round.points, 300);

        let lifetime = state.lifetime_stats[&1001].lock().clone();
        assert_eq!(lifetime.totals.kills, 1);
        assert_eq!(lifetime.totals.points_earned, 500);
        assert_eq!(lifetime.total_rounds_played, 1);
        assert_eq!(lifetime.average_points, 500.0);
        assert_eq!(lifetime.headshot_percentage, 1.0);
        // round 1 with joined round 1 never earns highest-round credit
        assert_eq!(lifetime.highest_round, 0);
    }

    #[tokio::test]
    async fn game_over_round_corrects_cumulative_score() {
        let (processor, manager, _rx) = setup().await;

        processor
            .process_event(
                GameEvent::PlayerRoundData {
                    client: ident(1001, "alice"),
                    total_score: 500,
                    current_score: 300,
                    current_round: 1,
                    is_game_over: false,
                },
                &ctx(),
            )
            .await;
        processor
            .process_event(GameEvent::RoundEnd { round_number: 2 }, &ctx())
            .await;
        // the final round reports the cumulative score as the current score
        processor
            .process_event(
                GameEvent::PlayerRoundData {
                    client: ident(1001, "alice"),
                    total_score: 900,
                    current_score: 900,
                    current_round: 2,
                    is_game_over: true,
                },
                &ctx(),
            )
            .await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();

        let round = state.round_states[&1001].record.lock().clone();
        assert_eq!(round.points, 700);
        assert_eq!(round.totals.points_earned, 400);
        assert_eq!(round.totals.points_spent, 0);

        let lifetime = state.lifetime_stats[&1001].lock().clone();
        assert_eq!(lifetime.total_matches_completed, 1);
        assert_eq!(state.record.lock().clients_completed, 1);
    }

    #[tokio::test]
    async fn forfeit_round_earns_and_spends_nothing() {
        let (processor, manager, _rx) = setup().await;

        processor
            .process_event(
                GameEvent::PlayerRoundData {
                    client: ident(1001, "alice"),
                    total_score: 0,
                    current_score: 0,
                    current_round: 1,
                    is_game_over: true,
                },
                &ctx(),
            )
            .await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let round = state.round_states[&1001].record.lock().clone();
        assert_eq!(round.totals.points_earned, 0);
        assert_eq!(round.totals.points_spent, 0);
    }

    #[tokio::test]
    async fn moving_average_weight_flattens_after_rounds_considered() {
        let (processor, manager, _rx) = setup().await;

        {
            let mut live = manager.live().await;
            let state = live.match_for_server(1).unwrap();
            state.lifetime_stats[&1001].lock().total_rounds_played = 200;
            state.lifetime_server_stats[&1001].lock().total_rounds_played = 200;
        }

        processor
            .process_event(
                GameEvent::PlayerRoundData {
                    client: ident(1001, "alice"),
                    total_score: 0,
                    current_score: 10,
                    current_round: 1,
                    is_game_over: false,
                },
                &ctx(),
            )
            .await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let lifetime = state.lifetime_stats[&1001].lock().clone();
        assert_eq!(lifetime.total_rounds_played, 201);
        // weight is 2/201 once past the considered-rounds window
        assert_eq!(
            lifetime.average_round_reached,
            calculate_average(0.0, 1.0, 2.0 / 201.0)
        );
    }

    #[tokio::test]
    async fn skill_seeds_maximum_records_on_first_calculation() {
        let (processor, manager, _rx) = setup().await;

        let mut live = manager.live().await;
        let skill =
            processor.skill_for_client(&mut live, &ident(1001, "alice"), Game::T6, 0.0);

        // all-zero aggregates normalize to 1.0 per skill key
        assert_eq!(skill, 1000.0);
        drop(live);

        let (_tx, shutdown) = watch::channel(false);
        manager.update_state(&shutdown).await;
        assert_eq!(
            manager.gateway().row_count(TABLE_RECORDS),
            RECORD_KEYS.len()
        );
    }

    #[tokio::test]
    async fn kill_events_are_reemitted_on_the_synthetic_channel() {
        let (processor, _manager, mut rx) = setup().await;

        processor
            .process_event(zombie_kill_event("head", "MOD_RIFLE_BULLET", 100), &ctx())
            .await;

        let synthetic = rx.try_recv().expect("synthetic kill emitted");
        assert_eq!(synthetic.kind, SyntheticKind::Kill);
        assert_eq!(synthetic.origin.unwrap().network_id, 1001);
        assert_eq!(synthetic.target.unwrap().name, "Zombie");
    }

    #[test]
    fn moving_average_rounds_to_two_places() {
        assert_eq!(calculate_average(10.0, 20.0, 0.5), 15.0);
        assert_eq!(calculate_average(0.0, 1.0 / 3.0, 1.0), 0.33);
    }
}
