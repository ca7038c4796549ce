//! Attaches to this executable and runs a few patch routines against it.
//!
//! `RUST_LOG=debug cargo run --example scan_self`

use patching::{ByteSignature, Engine, EngineConfig, PatchSet, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let engine = Engine::attach(EngineConfig {
        name: "scan_self".to_string(),
        injection_delay: Duration::from_millis(100),
        ..EngineConfig::default()
    })?;

    // ELF and PE images both start with a recognisable header
    let header = if cfg!(windows) { "4D 5A" } else { "7F 45 4C 46" };
    let prologue: ByteSignature = "55 48 89 E5".parse()?;

    let patches = PatchSet::new()
        .with("Image Header", move |engine| {
            let hit = engine.find_pattern("Image Header", header)?;
            assert_eq!(hit.offset, 0);
            Ok(())
        })
        .with("Frame Prologue", move |engine| {
            engine.find("Frame Prologue", &prologue).map(|_| ())
        })
        .with("Missing", |engine| {
            engine
                .find_pattern("Missing", "DE AD ?? EF 13 37 ?? C0 DE")
                .map(|_| ())
        });

    let report = engine.apply(patches);
    for (name, err) in &report.skipped {
        println!("skipped {name}: {err}");
    }
    println!("applied: {:?}", report.applied);
    Ok(())
}
