//! Backend Selection: Document vs SQLite storage levels
//!
//! Demonstrates how a storage level picks its backend:
//! - explicit request (`document` / `sqlite`) always wins
//! - `auto` keeps whatever store already exists at the prefix
//! - `auto` on an empty prefix creates the document store
//!
//! Run with: cargo run --example backend_selection

use anyhow::Context;
use perfcfg::backend::BackendDispatcher;
use perfcfg::storage::level::StorageLevel;
use perfcfg::storage::Document;
use perfcfg::{BackendKind, LevelName, Query};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    perfcfg::logging::init();
    let scratch = tempfile::tempdir().context("creating scratch directory")?;

    println!("=== perfcfg Backend Selection ===\n");

    println!("=== Case 1: Empty prefix, auto ===");
    let empty = scratch.path().join("empty");
    let kind = BackendDispatcher::select(&empty, LevelName::User, BackendKind::Auto);
    println!("  Selected backend: {kind}");
    println!("  Store file: {}\n", BackendDispatcher::store_path(&empty, LevelName::User, kind).display());

    println!("=== Case 2: Explicit sqlite, then auto ===");
    let prefix = scratch.path().join("user");
    let level = StorageLevel::new(LevelName::User, &prefix, BackendKind::Sqlite);
    let mut target = Document::new();
    target.insert("name".into(), json!("gcc-x86_64"));
    let eid = level.insert("target", target)?;
    println!("  Inserted target #{eid} into {}", level.store_path()?.display());
    drop(level);

    let reopened = StorageLevel::new(LevelName::User, &prefix, BackendKind::Auto);
    println!("  Auto now selects: {}", reopened.backend_kind()?);
    let found = reopened.get("target", &Query::Eid(eid))?;
    println!("  Target still readable: {}\n", found.is_some());

    println!("=== Case 3: Explicit document request on the same prefix ===");
    let forced = StorageLevel::new(LevelName::User, &prefix, BackendKind::Document);
    println!("  Selected backend: {}", forced.backend_kind()?);
    println!("  Targets visible: {} (separate store file)", forced.count("target")?);

    Ok(())
}
