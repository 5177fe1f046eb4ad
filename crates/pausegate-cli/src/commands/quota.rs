use chrono::Utc;
use clap::Subcommand;
use pausegate_core::{EngineConfig, QuotaState, Store};

#[derive(Subcommand)]
pub enum QuotaAction {
    /// Show the persisted quota record
    Show,
    /// Change the quota cap
    SetMax {
        /// Quick-task grants per window
        max: u32,
    },
    /// Start a fresh quota window with a full quota
    Reset,
}

pub fn run(action: QuotaAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open()?;
    let config = EngineConfig::load_or_default();
    match action {
        QuotaAction::Show => {
            let quota = store.load_quota()?.unwrap_or(QuotaState {
                max: config.quota.max,
                window_start_at: Utc::now(),
                remaining: config.quota.max,
            });
            println!("{}", serde_json::to_string_pretty(&quota)?);
        }
        QuotaAction::SetMax { max } => {
            let mut config = config;
            config.set("quota.max", &max.to_string())?;
            if let Some(mut quota) = store.load_quota()? {
                quota.max = max;
                quota.remaining = quota.remaining.min(max);
                store.save_quota(&quota)?;
            }
            println!("quota max set to {max}");
        }
        QuotaAction::Reset => {
            let quota = QuotaState {
                max: config.quota.max,
                window_start_at: Utc::now(),
                remaining: config.quota.max,
            };
            store.save_quota(&quota)?;
            println!("quota window reset ({} remaining)", quota.remaining);
        }
    }
    Ok(())
}
