use clap::Subcommand;
use pausegate_core::Store;

#[derive(Subcommand)]
pub enum StateAction {
    /// Show the durable engine state as JSON
    Show,
}

pub fn run(action: StateAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        StateAction::Show => {
            let store = Store::open()?;
            let records = store.load_entries()?;
            let mut preserved: Vec<_> = store.load_preserved()?.into_iter().collect();
            preserved.sort();
            let mut allowlist: Vec<_> = store.load_allowlist()?.into_iter().collect();
            allowlist.sort();
            let view = serde_json::json!({
                "records": records,
                "preserved": preserved,
                "allowlist": allowlist,
                "quota": store.load_quota()?,
                "last_restore_at": store.kv_get("last_restore_at")?,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    Ok(())
}
