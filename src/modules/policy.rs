use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::modules::agent::AgentId;
use crate::modules::config::SimConfig;
use crate::modules::records::RecordId;

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyThresholds {
    pub continue_idle: Duration,
    pub continue_window: Duration,
    pub continue_probability: f64,
    pub initiate_every: u64,
    pub initiate_probability: f64,
    pub contact_cooldown: Duration,
    pub reflect_every: u64,
    pub reflect_probability: f64,
}

impl PolicyThresholds {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            continue_idle: Duration::seconds(config.continue_idle_secs as i64),
            continue_window: Duration::seconds(config.continue_window_secs as i64),
            continue_probability: config.continue_probability,
            initiate_every: config.initiate_every,
            initiate_probability: config.initiate_probability,
            contact_cooldown: Duration::seconds(config.contact_cooldown_secs as i64),
            reflect_every: config.reflect_every,
            reflect_probability: config.reflect_probability,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub dialogue_id: RecordId,
    pub sender_id: AgentId,
    pub sender: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LastExchange {
    pub partner_id: AgentId,
    pub partner: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub id: AgentId,
    pub name: String,
    pub last_contact: Option<DateTime<Utc>>,
}

/// What one agent knows when deciding how to communicate this tick.
#[derive(Clone, Debug)]
pub struct PolicyInput<'a> {
    pub cycle: u64,
    pub now: DateTime<Utc>,
    pub unanswered: Option<InboundMessage>,
    pub last_exchange: Option<LastExchange>,
    pub candidates: &'a [Candidate],
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommAction {
    Answer(InboundMessage),
    Continue { partner_id: AgentId, partner: String },
    Initiate { target_id: AgentId, target: String },
    Reflect,
}

fn on_boundary(cycle: u64, every: u64) -> bool {
    every > 0 && cycle % every == 0
}

/// Chooses this tick's communication for one agent.
///
/// Rules, in priority order:
/// 1. an unanswered inbound message is answered and nothing else happens;
/// 2. a conversation idle for longer than `continue_idle` (but inside
///    `continue_window`) may be continued, ending the turn;
/// 3. on initiation cycles the agent may open a dialogue with someone it has
///    not contacted within `contact_cooldown`;
/// 4. on reflection cycles the agent may reflect.
///
/// Rules 3 and 4 can both fire in the same tick.
pub fn decide<R: Rng + ?Sized>(
    input: &PolicyInput<'_>,
    thresholds: &PolicyThresholds,
    rng: &mut R,
) -> Vec<CommAction> {
    if let Some(message) = &input.unanswered {
        return vec![CommAction::Answer(message.clone())];
    }

    if let Some(last) = &input.last_exchange {
        let idle = input.now - last.at;
        if idle > thresholds.continue_idle
            && idle < thresholds.continue_window
            && rng.gen_bool(thresholds.continue_probability)
        {
            return vec![CommAction::Continue {
                partner_id: last.partner_id,
                partner: last.partner.clone(),
            }];
        }
    }

    let mut actions = Vec::new();

    if on_boundary(input.cycle, thresholds.initiate_every)
        && rng.gen_bool(thresholds.initiate_probability)
    {
        let eligible: Vec<&Candidate> = input
            .candidates
            .iter()
            .filter(|c| match c.last_contact {
                Some(at) => input.now - at >= thresholds.contact_cooldown,
                None => true,
            })
            .collect();
        if let Some(target) = eligible.choose(rng) {
            actions.push(CommAction::Initiate {
                target_id: target.id,
                target: target.name.clone(),
            });
        }
    }

    if on_boundary(input.cycle, thresholds.reflect_every)
        && rng.gen_bool(thresholds.reflect_probability)
    {
        actions.push(CommAction::Reflect);
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn certain() -> PolicyThresholds {
        PolicyThresholds {
            continue_probability: 1.0,
            initiate_probability: 1.0,
            reflect_probability: 1.0,
            initiate_every: 5,
            reflect_every: 15,
            ..PolicyThresholds::from_config(&SimConfig::default())
        }
    }

    fn message() -> InboundMessage {
        InboundMessage {
            dialogue_id: 7,
            sender_id: 2,
            sender: "Synth-200".into(),
            text: "hi".into(),
        }
    }

    #[test]
    fn answering_preempts_everything() {
        let now = Utc::now();
        let candidates = [Candidate { id: 3, name: "c".into(), last_contact: None }];
        let input = PolicyInput {
            cycle: 15,
            now,
            unanswered: Some(message()),
            last_exchange: Some(LastExchange {
                partner_id: 2,
                partner: "Synth-200".into(),
                at: now - Duration::seconds(400),
            }),
            candidates: &candidates,
        };
        let actions = decide(&input, &certain(), &mut StdRng::seed_from_u64(1));
        assert_eq!(actions, vec![CommAction::Answer(message())]);
    }

    #[test]
    fn idle_conversation_is_continued_only_inside_window() {
        let now = Utc::now();
        let mut input = PolicyInput {
            cycle: 15,
            now,
            unanswered: None,
            last_exchange: Some(LastExchange {
                partner_id: 2,
                partner: "Synth-200".into(),
                at: now - Duration::seconds(400),
            }),
            candidates: &[],
        };
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(
            decide(&input, &certain(), &mut rng),
            vec![CommAction::Continue { partner_id: 2, partner: "Synth-200".into() }]
        );

        input.last_exchange.as_mut().unwrap().at = now - Duration::seconds(200);
        assert_eq!(decide(&input, &certain(), &mut rng), vec![CommAction::Reflect]);

        input.last_exchange.as_mut().unwrap().at = now - Duration::hours(2);
        assert_eq!(decide(&input, &certain(), &mut rng), vec![CommAction::Reflect]);
    }

    #[test]
    fn initiation_skips_recent_contacts() {
        let now = Utc::now();
        let candidates = [
            Candidate { id: 2, name: "recent".into(), last_contact: Some(now - Duration::seconds(100)) },
            Candidate { id: 3, name: "stranger".into(), last_contact: None },
            Candidate { id: 4, name: "old".into(), last_contact: Some(now - Duration::seconds(900)) },
        ];
        let input = PolicyInput {
            cycle: 10,
            now,
            unanswered: None,
            last_exchange: None,
            candidates: &candidates,
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..30 {
            let actions = decide(&input, &certain(), &mut rng);
            assert_eq!(actions.len(), 1);
            match &actions[0] {
                CommAction::Initiate { target, .. } => assert_ne!(target, "recent"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn both_periodic_rules_fire_on_shared_boundary() {
        let candidates = [Candidate { id: 2, name: "b".into(), last_contact: None }];
        let input = PolicyInput {
            cycle: 30,
            now: Utc::now(),
            unanswered: None,
            last_exchange: None,
            candidates: &candidates,
        };
        let actions = decide(&input, &certain(), &mut StdRng::seed_from_u64(4));
        assert_eq!(
            actions,
            vec![
                CommAction::Initiate { target_id: 2, target: "b".into() },
                CommAction::Reflect
            ]
        );
    }

    #[test]
    fn off_boundary_cycles_do_nothing() {
        let candidates = [Candidate { id: 2, name: "b".into(), last_contact: None }];
        let input = PolicyInput {
            cycle: 7,
            now: Utc::now(),
            unanswered: None,
            last_exchange: None,
            candidates: &candidates,
        };
        assert!(decide(&input, &certain(), &mut StdRng::seed_from_u64(5)).is_empty());
    }
}
