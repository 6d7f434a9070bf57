use std::path::Path;

use anyhow::Context;
use idp_core::config::Config;

use crate::output::{print_json, print_table};

pub fn run(config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(config_path).context("failed to load config")?;
    let table = config.node_pool_table();

    if json {
        return print_json(&table);
    }
    let mut rows: Vec<Vec<String>> = table
        .iter()
        .map(|(name, pool)| {
            vec![
                name.to_string(),
                pool.system_vm_size.clone(),
                pool.user_vm_size.clone(),
                format!("{} / {}Gi", pool.max_cpu, pool.max_memory_gb),
                if pool.spot { "yes".into() } else { "no".into() },
                pool.description.clone(),
            ]
        })
        .collect();
    rows.sort();
    print_table(
        &["NAME", "SYSTEM VM", "USER VM", "MAX CPU/MEM", "SPOT", "DESCRIPTION"],
        rows,
    );
    Ok(())
}
