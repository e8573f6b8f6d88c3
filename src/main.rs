// src/main.rs

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{error, info, warn};

use capture_node::{CaptureEngine, EngineConfig, ReportFormat, SyntheticDriver};

const DEFAULT_CONFIG: &str = "capture.toml";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg = load_config()?;
    std::fs::create_dir_all(&cfg.storage_root).with_context(|| {
        format!("failed to create storage root {}", cfg.storage_root.display())
    })?;

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        ctrlc::set_handler(move || {
            info!("[capture] shutdown requested");
            r.store(false, Ordering::SeqCst);
        })?;
    }

    // ------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------
    let driver = SyntheticDriver::new(cfg.synthetic_devices.clone());
    let mut engine = CaptureEngine::with_config(&cfg, &driver)?;
    info!(
        "[capture] {} device(s) known below {}",
        engine.list_devices().len(),
        engine.storage_root().display()
    );

    start_planned_streams(&cfg, &engine);

    // ------------------------------------------------------------
    // Status loop
    // ------------------------------------------------------------
    let mut last_report = Instant::now();
    report(&engine, cfg.report_format);
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= cfg.status_interval() {
            report(&engine, cfg.report_format);
            last_report = Instant::now();
        }
    }

    engine.shutdown()?;
    report(&engine, cfg.report_format);
    info!("[capture] bye");
    Ok(())
}

fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let cfg = EngineConfig::load(&path)?;
            info!("[capture] loaded {}", path);
            Ok(cfg)
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            let cfg = EngineConfig::load(DEFAULT_CONFIG)?;
            info!("[capture] loaded {}", DEFAULT_CONFIG);
            Ok(cfg)
        }
        None => {
            warn!("[capture] no config given, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn start_planned_streams(cfg: &EngineConfig, engine: &CaptureEngine) {
    let mut autostart = BTreeSet::new();

    for plan in &cfg.streams {
        let key = plan.key();
        match engine.enable_stream(&plan.device, key.clone(), plan.stream_config()) {
            Ok(()) => {
                info!("[capture] enabled {} on '{}'", key, plan.device);
                if plan.autostart {
                    autostart.insert(plan.device.as_str());
                }
            }
            Err(err) => error!("[capture] cannot enable {} on '{}': {}", key, plan.device, err),
        }
    }

    for device in autostart {
        if let Err(err) = engine.start_device(device) {
            error!("[capture] cannot start '{}': {}", device, err);
        }
    }
}

fn report(engine: &CaptureEngine, format: ReportFormat) {
    let status = engine.status();
    match format {
        ReportFormat::Text => println!("{}", status),
        ReportFormat::Json => match status.to_json() {
            Ok(json) => println!("{}", json),
            Err(err) => error!("[capture] status serialization failed: {}", err),
        },
    }
}
