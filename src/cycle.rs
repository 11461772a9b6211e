use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::memory::store::MemoryStore;
use crate::memory::META_LAST_PERIOD_START;
use crate::rng::RandomSource;
use crate::roles::{RoleProfile, RoleStore};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Where the role currently is in its physiological cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStatus {
    pub in_period: bool,
    /// Days into the period when `in_period`, days since it ended otherwise.
    pub day_offset: u32,
    pub cycle_length: u32,
    pub period_length: u32,
}

impl CycleStatus {
    /// One sentence of system context describing the current state, written
    /// so the role can let it color mood and small talk without announcing
    /// it.
    pub fn context_sentence(&self) -> String {
        if self.in_period {
            format!(
                "You are on day {} of your period (it usually lasts {} days). You may feel \
more tired or tender than usual; let that subtly color your mood, but do not bring it up \
unless it fits the conversation naturally.",
                self.day_offset + 1,
                self.period_length
            )
        } else {
            let until_next = self
                .cycle_length
                .saturating_sub(self.period_length + self.day_offset);
            format!(
                "Your last period ended {} days ago; the next is expected in about {} days. \
You feel physically normal.",
                self.day_offset, until_next
            )
        }
    }
}

/// Tracks a simulated menstrual cycle per role. Lengths are lazily
/// initialized with randomized defaults and written back to the profile;
/// the advancing period-start date lives in the memory store's meta table.
pub struct CycleEngine {
    store: Arc<MemoryStore>,
    roles: Arc<RoleStore>,
    config: Arc<AppConfig>,
    rng: Arc<dyn RandomSource>,
}

/// Step `start` forward by whole cycles (with a +/- 2 day jitter per step)
/// until it is within one cycle of `today`. A jittered step that would
/// overshoot `today` falls back to the exact cycle length, so the result
/// never lands in the future and re-running on the same day is a no-op.
pub fn advance_cycle(
    mut start: NaiveDate,
    today: NaiveDate,
    cycle_length: u32,
    rng: &dyn RandomSource,
) -> NaiveDate {
    // A zero-length cycle has no phase to roll forward through.
    if cycle_length == 0 {
        return today;
    }
    let cycle = Duration::days(cycle_length as i64);
    while today.signed_duration_since(start) >= cycle {
        let stepped = start + cycle + Duration::days(rng.range_i64(-2, 2));
        start = if stepped > today { start + cycle } else { stepped };
    }
    start
}

impl CycleEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        roles: Arc<RoleStore>,
        config: Arc<AppConfig>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            store,
            roles,
            config,
            rng,
        }
    }

    /// Current cycle status for the role, or `None` when the role's gender
    /// does not carry the cycle narrative. Initializes missing parameters
    /// and advances the stored period start as a side effect.
    pub fn status(&self, role: &mut RoleProfile) -> Result<Option<CycleStatus>> {
        if role.gender.as_deref() != Some(self.config.cycle_gender_marker.as_str()) {
            return Ok(None);
        }

        let mut cycle = role.menstruation_cycle.clone().unwrap_or_default();
        let mut profile_dirty = false;

        // A zero length in the profile is treated as unset and replaced.
        let cycle_length = match cycle.cycle_length {
            Some(length) if length > 0 => length,
            _ => {
                let length = self.rng.range_i64(26, 32) as u32;
                cycle.cycle_length = Some(length);
                profile_dirty = true;
                length
            }
        };
        let period_length = match cycle.period_length {
            Some(length) if length > 0 => length,
            _ => {
                let length = self.rng.range_i64(4, 7) as u32;
                cycle.period_length = Some(length);
                profile_dirty = true;
                length
            }
        };

        let today = Utc::now().date_naive();
        let stored_start = self
            .store
            .get_meta(&role.id, META_LAST_PERIOD_START)?
            .as_deref()
            .and_then(parse_date);
        let start = match stored_start {
            Some(start) => start,
            // Seed from the profile when present, otherwise land the role
            // somewhere random in its cycle.
            None => cycle
                .last_period_start
                .as_deref()
                .and_then(parse_date)
                .unwrap_or_else(|| {
                    today - Duration::days(self.rng.range_i64(0, cycle_length as i64 - 1))
                }),
        };

        if profile_dirty {
            role.menstruation_cycle = Some(cycle);
            self.roles.save(role)?;
        }

        let days_since = today.signed_duration_since(start).num_days();
        if days_since < 0 {
            tracing::warn!(
                "Period start for role '{}' is in the future ({}), skipping cycle context",
                role.id,
                start
            );
            return Ok(None);
        }

        let advanced = advance_cycle(start, today, cycle_length, self.rng.as_ref());
        if Some(advanced) != stored_start {
            self.store.set_meta(
                &role.id,
                META_LAST_PERIOD_START,
                &advanced.format(DATE_FORMAT).to_string(),
            )?;
        }

        let days = today.signed_duration_since(advanced).num_days() as u32;
        let status = if days < period_length {
            CycleStatus {
                in_period: true,
                day_offset: days,
                cycle_length,
                period_length,
            }
        } else {
            CycleStatus {
                in_period: false,
                day_offset: days - period_length,
                cycle_length,
                period_length,
            }
        };
        Ok(Some(status))
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
        return Some(date);
    }
    // Tolerate full timestamps by taking the date part.
    trimmed
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, DATE_FORMAT).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::testing::ScriptedRandom;
    use crate::roles::MenstruationCycle;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("companion_cycle_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn engine(
        name: &str,
        rng: Arc<ScriptedRandom>,
    ) -> (CycleEngine, Arc<RoleStore>, tempfile::TempDir) {
        let roles_dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            MemoryStore::new(temp_db_path(name), roles_dir.path().to_path_buf()).expect("store"),
        );
        let roles = Arc::new(RoleStore::new(roles_dir.path().to_path_buf()));
        let engine = CycleEngine::new(
            store,
            Arc::clone(&roles),
            Arc::new(AppConfig::default()),
            rng as Arc<dyn RandomSource>,
        );
        (engine, roles, roles_dir)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).expect("date")
    }

    #[test]
    fn advance_lands_within_one_cycle_of_today() {
        let rng = ScriptedRandom::new();
        rng.push_range(1);
        rng.push_range(-2);
        rng.push_range(0);

        let advanced = advance_cycle(date("2025-01-01"), date("2025-04-15"), 28, &rng);
        let days = date("2025-04-15").signed_duration_since(advanced).num_days();
        assert!((0..28).contains(&days), "landed {} days back", days);
    }

    #[test]
    fn advance_is_idempotent_once_current() {
        let rng = ScriptedRandom::new();
        let start = date("2025-04-10");
        assert_eq!(advance_cycle(start, date("2025-04-15"), 28, &rng), start);
    }

    #[test]
    fn jitter_overshoot_falls_back_to_exact_cycle() {
        let rng = ScriptedRandom::new();
        rng.push_range(2); // would step past today
        let advanced = advance_cycle(date("2025-01-01"), date("2025-01-29"), 28, &rng);
        assert_eq!(advanced, date("2025-01-29"));
    }

    #[test]
    fn zero_cycle_length_terminates() {
        let rng = ScriptedRandom::new();
        let advanced = advance_cycle(date("2025-01-01"), date("2025-01-05"), 0, &rng);
        assert_eq!(advanced, date("2025-01-05"));
    }

    #[test]
    fn zero_lengths_in_profile_are_reinitialized() {
        let rng = Arc::new(ScriptedRandom::new());
        rng.push_range(28); // replacement cycle length
        rng.push_range(5); // replacement period length
        rng.push_range(2);
        let (engine, roles, _dir) = engine("zero", rng);

        let mut role = RoleProfile::new("r1", "Mia");
        role.gender = Some("female".to_string());
        role.menstruation_cycle = Some(MenstruationCycle {
            cycle_length: Some(0),
            period_length: Some(0),
            last_period_start: None,
        });
        roles.save(&role).expect("save");

        let status = engine.status(&mut role).expect("status").expect("some");
        assert_eq!(status.cycle_length, 28);
        assert_eq!(status.period_length, 5);

        let saved = roles.load("r1").expect("load").expect("present");
        let cycle = saved.menstruation_cycle.expect("cycle");
        assert_eq!(cycle.cycle_length, Some(28));
        assert_eq!(cycle.period_length, Some(5));
    }

    #[test]
    fn non_marker_gender_gets_no_cycle() {
        let rng = Arc::new(ScriptedRandom::new());
        let (engine, _roles, _dir) = engine("gender", rng);
        let mut role = RoleProfile::new("r1", "Sam");
        role.gender = Some("male".to_string());
        assert!(engine.status(&mut role).expect("status").is_none());
        assert!(engine
            .status(&mut RoleProfile::new("r2", "None"))
            .expect("status")
            .is_none());
    }

    #[test]
    fn lazy_initialization_persists_parameters() {
        let rng = Arc::new(ScriptedRandom::new());
        rng.push_range(28); // cycle length
        rng.push_range(5); // period length
        rng.push_range(3); // days back for the seeded start
        let (engine, roles, _dir) = engine("init", rng);

        let mut role = RoleProfile::new("r1", "Mia");
        role.gender = Some("female".to_string());
        roles.save(&role).expect("save");

        let status = engine.status(&mut role).expect("status").expect("some");
        assert_eq!(status.cycle_length, 28);
        assert_eq!(status.period_length, 5);
        assert!(status.in_period);
        assert_eq!(status.day_offset, 3);

        let saved = roles.load("r1").expect("load").expect("present");
        let cycle = saved.menstruation_cycle.expect("cycle");
        assert_eq!(cycle.cycle_length, Some(28));
        assert_eq!(cycle.period_length, Some(5));
    }

    #[test]
    fn repeated_queries_on_the_same_day_agree() {
        let rng = Arc::new(ScriptedRandom::new());
        rng.push_range(28);
        rng.push_range(5);
        rng.push_range(10);
        let (engine, roles, _dir) = engine("stable", rng);

        let mut role = RoleProfile::new("r1", "Mia");
        role.gender = Some("female".to_string());
        roles.save(&role).expect("save");

        let first = engine.status(&mut role).expect("status").expect("some");
        let second = engine.status(&mut role).expect("status").expect("some");
        assert_eq!(first, second);
    }

    #[test]
    fn profile_seed_date_is_advanced_not_trusted_verbatim() {
        let rng = Arc::new(ScriptedRandom::new());
        let (engine, roles, _dir) = engine("seed", rng);

        let mut role = RoleProfile::new("r1", "Mia");
        role.gender = Some("female".to_string());
        role.menstruation_cycle = Some(MenstruationCycle {
            cycle_length: Some(28),
            period_length: Some(5),
            last_period_start: Some("2020-01-01".to_string()),
        });
        roles.save(&role).expect("save");

        let status = engine.status(&mut role).expect("status").expect("some");
        let total = status.day_offset
            + if status.in_period {
                0
            } else {
                status.period_length
            };
        assert!(total < status.cycle_length);
    }

    #[test]
    fn post_period_status_reports_days_since_end() {
        let rng = Arc::new(ScriptedRandom::new());
        rng.push_range(28);
        rng.push_range(5);
        rng.push_range(9); // 9 days into the cycle, 4 past the period
        let (engine, roles, _dir) = engine("post", rng);

        let mut role = RoleProfile::new("r1", "Mia");
        role.gender = Some("female".to_string());
        roles.save(&role).expect("save");

        let status = engine.status(&mut role).expect("status").expect("some");
        assert!(!status.in_period);
        assert_eq!(status.day_offset, 4);
        assert!(status.context_sentence().contains("4 days ago"));
    }

    #[test]
    fn date_parsing_tolerates_timestamps() {
        assert_eq!(parse_date("2025-03-04"), Some(date("2025-03-04")));
        assert_eq!(parse_date("2025-03-04T10:00:00Z"), Some(date("2025-03-04")));
        assert_eq!(parse_date("garbage"), None);
    }
}
