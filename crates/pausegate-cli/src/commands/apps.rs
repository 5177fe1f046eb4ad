use clap::Subcommand;
use pausegate_core::Store;

#[derive(Subcommand)]
pub enum AppsAction {
    /// List monitored app ids
    List,
    /// Put an app under admission control
    Allow {
        /// App id (package name)
        app_id: String,
    },
    /// Remove an app from admission control
    Remove {
        /// App id (package name)
        app_id: String,
    },
}

pub fn run(action: AppsAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open()?;
    match action {
        AppsAction::List => {
            let mut apps: Vec<_> = store.load_allowlist()?.into_iter().collect();
            apps.sort();
            for app in apps {
                println!("{app}");
            }
        }
        AppsAction::Allow { app_id } => {
            store.allow_app(&app_id)?;
            println!("monitoring {app_id}");
        }
        AppsAction::Remove { app_id } => {
            store.disallow_app(&app_id)?;
            store.delete_entry(&app_id)?;
            store.set_preserved(&app_id, false)?;
            println!("no longer monitoring {app_id}");
        }
    }
    Ok(())
}
