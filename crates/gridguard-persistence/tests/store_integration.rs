//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use gridguard_persistence::{JsonFileStateStore, MemoryStateStore, StateStore};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn file_store_survives_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let blob = json!({
        "state": "Running",
        "balancing_method": "near_peak",
        "allow_battery_power": "max_power",
    });

    {
        let store = JsonFileStateStore::open(dir.path())?;
        store.save_state("consumer.car", &blob)?;
    }

    let reopened = JsonFileStateStore::open(dir.path())?;
    assert_eq!(reopened.load_state("consumer.car")?, Some(blob));
    Ok(())
}

#[test]
fn stores_are_usable_behind_trait_objects() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let stores: Vec<Arc<dyn StateStore>> = vec![
        Arc::new(MemoryStateStore::new()),
        Arc::new(JsonFileStateStore::open(dir.path())?),
    ];
    for store in stores {
        store.save_state("consumer.dishwasher", &json!({"state": "NeedsEnergy"}))?;
        let loaded = store.load_state("consumer.dishwasher")?;
        assert_eq!(loaded, Some(json!({"state": "NeedsEnergy"})));
    }
    Ok(())
}
