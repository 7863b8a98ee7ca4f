//! `netdeploy init-db` and `netdeploy status`.

use std::path::Path;

use anyhow::{Context, Result};
use netdeploy::deploy::db::DeployDb;

pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    DeployDb::new(db_path)?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}

pub fn cmd_status(db_path: &Path, name: &str) -> Result<()> {
    if !db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'netdeploy init-db' first.",
            db_path.display()
        );
    }
    let db = DeployDb::new(db_path)?;
    let record = db
        .get_deployment(name)?
        .ok_or_else(|| anyhow::anyhow!("Deployment {} not found", name))?;

    println!();
    println!("Deployment: {}", record.name);
    println!("Status:     {}", record.status);
    println!("Version:    {}", record.version);
    if let Some(deletion) = record.deletion_date {
        println!("Deletion:   {}", deletion.to_rfc3339());
    }
    println!("Created:    {}", record.created_at.to_rfc3339());
    println!("Updated:    {}", record.updated_at.to_rfc3339());
    println!();
    Ok(())
}
