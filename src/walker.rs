use async_trait::async_trait;
use log::{debug, error, info};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::api::{Envelope, GameApi, TargetKind, TroopAllocation};
use crate::session::SessionError;

/// Suspension between scripted actions. Injected so the walk is testable
/// without real waiting.
#[async_trait]
pub trait Pacing: Send + Sync {
    /// Waits a uniformly sampled number of seconds in `[lo, hi]`.
    async fn pause(&self, lo: f64, hi: f64);
}

pub struct RandomPacing;

#[async_trait]
impl Pacing for RandomPacing {
    async fn pause(&self, lo: f64, hi: f64) {
        let secs = if hi > lo {
            rand::thread_rng().gen_range(lo..hi)
        } else {
            lo
        };
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

/// Read-only view of the account fetched once per turn.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserSnapshot {
    pub profile: Profile,
    pub hero: Hero,
}

impl UserSnapshot {
    pub fn from_envelope(envelope: &Envelope) -> Option<UserSnapshot> {
        if !envelope.success {
            return None;
        }
        serde_json::from_value(envelope.data.clone()?).ok()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[serde(rename = "publicName")]
    pub public_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Hero {
    pub level: u32,
    pub power: f64,
    pub race: Option<String>,
    pub resources: Resources,
    pub onboarding: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub food: ResourceBucket,
    pub wood: ResourceBucket,
    pub stone: ResourceBucket,
    pub gem: ResourceBucket,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResourceBucket {
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerState {
    NeedsTutorial,
    SteadyState,
}

/// An account with no faction or an empty onboarding list has never been
/// walked through the tutorial.
pub fn assess(hero: &Hero) -> WalkerState {
    if hero.race.is_none() || hero.onboarding.is_empty() {
        WalkerState::NeedsTutorial
    } else {
        WalkerState::SteadyState
    }
}

#[derive(Debug, Clone)]
pub enum StepAction {
    AfterData,
    FinishOnboarding(u32),
    SelectRace,
    BuyBuilding { position: u32, key: &'static str },
    ClaimResource(&'static str),
    BuildingInfo,
    TroopsInfo,
    TrainTroops { class: &'static str, tier: u32, count: u32 },
    AttackFirstOasis { class: &'static str, tier: u32, count: u32 },
    ScoutFirstCamp { class: &'static str, tier: u32 },
    MainQuest(&'static str),
    SideQuest(&'static str),
    SocialQuest(&'static str),
    Idle,
}

#[derive(Debug, Clone)]
pub struct TutorialStep {
    pub action: StepAction,
    /// Pre-action pacing bounds in seconds.
    pub pause: (f64, f64),
    /// A failed critical step marks the whole walk failed. The walk still
    /// runs to the end either way.
    pub critical: bool,
}

fn step(action: StepAction, pause: (f64, f64)) -> TutorialStep {
    TutorialStep {
        action,
        pause,
        critical: false,
    }
}

fn critical(action: StepAction, pause: (f64, f64)) -> TutorialStep {
    TutorialStep {
        action,
        pause,
        critical: true,
    }
}

/// The fixed tutorial walk. Step order, pacing bounds, and failure tolerance
/// are data; the driver below interprets them.
pub fn tutorial_script() -> Vec<TutorialStep> {
    use StepAction::*;
    vec![
        step(AfterData, (1.0, 2.0)),
        critical(FinishOnboarding(1), (2.0, 3.0)),
        critical(SelectRace, (2.0, 3.0)),
        step(FinishOnboarding(10000), (1.0, 2.0)),
        step(FinishOnboarding(10010), (1.0, 2.0)),
        step(FinishOnboarding(10020), (1.0, 2.0)),
        step(BuyBuilding { position: 2, key: "farm_1" }, (2.0, 3.0)),
        step(BuyBuilding { position: 3, key: "lumber_mill_1" }, (2.0, 3.0)),
        step(FinishOnboarding(10050), (1.0, 2.0)),
        step(FinishOnboarding(10060), (1.0, 2.0)),
        step(ClaimResource("wood"), (2.0, 3.0)),
        step(ClaimResource("food"), (1.0, 2.0)),
        // Same endpoint as buying: position 1 already holds the castle, so
        // the server treats this as the level-2 upgrade.
        step(BuyBuilding { position: 1, key: "castle" }, (2.0, 3.0)),
        step(BuildingInfo, (2.0, 3.0)),
        step(MainQuest("build_castle_2"), (1.0, 2.0)),
        step(FinishOnboarding(10100), (1.0, 2.0)),
        step(FinishOnboarding(10110), (1.0, 2.0)),
        step(FinishOnboarding(10120), (1.0, 2.0)),
        step(BuyBuilding { position: 4, key: "archery_range" }, (2.0, 3.0)),
        step(TrainTroops { class: "archer", tier: 10, count: 5 }, (2.0, 3.0)),
        step(TroopsInfo, (1.0, 2.0)),
        step(FinishOnboarding(10150), (1.0, 2.0)),
        step(FinishOnboarding(10160), (1.0, 2.0)),
        step(FinishOnboarding(10170), (1.0, 2.0)),
        step(FinishOnboarding(10180), (1.0, 2.0)),
        step(AttackFirstOasis { class: "archer", tier: 10, count: 5 }, (2.0, 3.0)),
        step(FinishOnboarding(10210), (1.0, 2.0)),
        step(FinishOnboarding(10220), (1.0, 2.0)),
        step(FinishOnboarding(10230), (1.0, 2.0)),
        step(BuyBuilding { position: 5, key: "scout_camp" }, (2.0, 3.0)),
        step(TrainTroops { class: "scout", tier: 10, count: 1 }, (2.0, 3.0)),
        // Long pause first: the scout has to finish training server-side.
        step(ScoutFirstCamp { class: "scout", tier: 10 }, (25.0, 30.0)),
        step(FinishOnboarding(10280), (1.0, 2.0)),
        step(FinishOnboarding(10290), (1.0, 2.0)),
        step(BuyBuilding { position: 6, key: "storage" }, (2.0, 3.0)),
        step(MainQuest("build_archery_range_1"), (1.0, 2.0)),
        step(MainQuest("trainTotal_5"), (1.0, 2.0)),
        step(MainQuest("attack_oasis_1"), (1.0, 2.0)),
        step(MainQuest("build_scout_camp_1"), (1.0, 2.0)),
        step(MainQuest("attack_camp_1"), (1.0, 2.0)),
        step(SideQuest("attack_oasis"), (1.0, 2.0)),
        step(SideQuest("resourceLoot_wood"), (1.0, 2.0)),
        step(SideQuest("attack_camp"), (1.0, 2.0)),
        step(BuyBuilding { position: 1, key: "castle" }, (2.0, 3.0)),
        // Castle level 3 takes about a minute of server time.
        step(Idle, (60.0, 65.0)),
        step(MainQuest("build_castle_3"), (1.0, 2.0)),
        step(FinishOnboarding(10340), (1.0, 2.0)),
        step(FinishOnboarding(10350), (1.0, 2.0)),
        step(SocialQuest("join_tg"), (2.0, 3.0)),
        step(FinishOnboarding(10360), (1.0, 2.0)),
        step(FinishOnboarding(10370), (1.0, 2.0)),
        step(FinishOnboarding(10380), (1.0, 2.0)),
        step(FinishOnboarding(10390), (1.0, 2.0)),
        step(FinishOnboarding(10400), (1.0, 2.0)),
    ]
}

/// Drives the scripted walk for one account: the tutorial once, steady-state
/// turns afterwards.
pub struct Walker {
    pacing: Box<dyn Pacing>,
}

impl Walker {
    pub fn new(pacing: Box<dyn Pacing>) -> Self {
        Self { pacing }
    }

    async fn execute(&self, api: &GameApi, action: &StepAction) -> Result<bool, SessionError> {
        match action {
            StepAction::AfterData => Ok(api
                .after_data("en")
                .await?
                .map(|envelope| envelope.success)
                .unwrap_or(false)),
            StepAction::FinishOnboarding(code) => api.finish_onboarding(*code).await,
            StepAction::SelectRace => api.select_race(None).await,
            StepAction::BuyBuilding { position, key } => api.buy_building(*position, key).await,
            StepAction::ClaimResource(kind) => api.claim_resource(kind).await,
            StepAction::BuildingInfo => Ok(api.building_info().await?.is_some()),
            StepAction::TroopsInfo => Ok(api.troops_info().await?.is_some()),
            StepAction::TrainTroops { class, tier, count } => {
                let troop_key = api.troop_key(class, *tier);
                api.train_troops(&troop_key, *count).await
            }
            StepAction::AttackFirstOasis { class, tier, count } => {
                match api.find_target(TargetKind::Oasis).await? {
                    Some(target) => {
                        let mut troops = TroopAllocation::new();
                        troops.insert(api.troop_key(class, *tier), *count);
                        if api.create_attack(&target, &troops).await? {
                            self.pacing.pause(5.0, 8.0).await;
                            api.attack_info().await?;
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            StepAction::ScoutFirstCamp { class, tier } => {
                match api.find_target(TargetKind::Camp).await? {
                    Some(target) => {
                        let mut troops = TroopAllocation::new();
                        troops.insert(api.troop_key(class, *tier), 1);
                        if api.create_scout(&target, &troops).await? {
                            self.pacing.pause(3.0, 5.0).await;
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            StepAction::MainQuest(key) => api.claim_main_quest(key).await,
            StepAction::SideQuest(key) => api.claim_side_quest(key).await,
            StepAction::SocialQuest(key) => {
                if api.check_quest_condition(key).await? {
                    api.claim_quest_reward(key).await
                } else {
                    Ok(false)
                }
            }
            StepAction::Idle => Ok(true),
        }
    }

    /// Runs the full tutorial script. Individual step failures are tolerated;
    /// only critical ones turn the overall result false. Session invalidity
    /// is the only thing that escapes early.
    pub async fn run_tutorial(&self, api: &GameApi) -> Result<bool, SessionError> {
        info!("{} | Starting tutorial walk", api.session_name());
        let mut completed = true;
        for (index, item) in tutorial_script().iter().enumerate() {
            self.pacing.pause(item.pause.0, item.pause.1).await;
            let done = self.execute(api, &item.action).await?;
            if !done {
                if item.critical {
                    error!(
                        "{} | Critical tutorial step {} ({:?}) failed",
                        api.session_name(),
                        index,
                        item.action
                    );
                    completed = false;
                } else {
                    debug!(
                        "{} | Tutorial step {} ({:?}) reported failure, continuing",
                        api.session_name(),
                        index,
                        item.action
                    );
                }
            }
        }
        if completed {
            info!("{} | Tutorial walk finished", api.session_name());
        }
        Ok(completed)
    }

    /// One turn of the account: fetch the snapshot, run the tutorial when the
    /// account still needs it, otherwise log the summary and idle.
    pub async fn play_turn(&self, api: &GameApi) -> Result<(), SessionError> {
        let user_data = api.get_user_data().await?;
        let snapshot = user_data.as_ref().and_then(UserSnapshot::from_envelope);
        let Some(mut snapshot) = snapshot else {
            error!("{} | Failed to fetch user data", api.session_name());
            self.pacing.pause(60.0, 60.0).await;
            return Ok(());
        };

        if assess(&snapshot.hero) == WalkerState::NeedsTutorial {
            info!(
                "{} | New account detected, starting the full tutorial",
                api.session_name()
            );
            if !self.run_tutorial(api).await? {
                error!("{} | Tutorial walk failed", api.session_name());
                self.pacing.pause(300.0, 300.0).await;
                return Ok(());
            }
            let refreshed = api.get_user_data().await?;
            match refreshed.as_ref().and_then(UserSnapshot::from_envelope) {
                Some(fresh) => snapshot = fresh,
                None => {
                    error!(
                        "{} | Failed to refresh user data after the tutorial",
                        api.session_name()
                    );
                    self.pacing.pause(60.0, 60.0).await;
                    return Ok(());
                }
            }
        }

        let hero = &snapshot.hero;
        let name = if snapshot.profile.public_name.is_empty() {
            "Unknown"
        } else {
            snapshot.profile.public_name.as_str()
        };
        info!(
            "{} | Player: {} | Race: {}",
            api.session_name(),
            name,
            hero.race.as_deref().unwrap_or("Unknown")
        );
        info!(
            "{} | Level: {} | Power: {}",
            api.session_name(),
            hero.level,
            hero.power
        );
        info!(
            "{} | Resources - Food: {}, Wood: {}, Stone: {}, Gems: {}",
            api.session_name(),
            hero.resources.food.value,
            hero.resources.wood.value,
            hero.resources.stone.value,
            hero.resources.gem.value
        );
        info!("{} | Idling until the next check", api.session_name());
        self.pacing.pause(3600.0, 7200.0).await;
        Ok(())
    }
}
