//! Preview storm simulator.
//!
//! Spawns many preview widgets that repeatedly request procedurally generated
//! OBJ figurines at varied priorities, hold them on screen for a while and
//! release them, so context admission, batching and disposal run under load.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figview::asset::{LocalSource, LocatorRegistry, ObjDecoder};
use figview::core::config::SchedulerConfig;
use figview::core::logging;
use figview::debug::SchedulerDebugHandler;
use figview::{AssetScheduler, PreviewState};
use tokio::time::Instant;

const DEFAULT_WIDGETS: usize = 24;
const DEFAULT_DURATION_SECS: u64 = 20;
const DEFAULT_HOLD_MS: u64 = 1500;

#[derive(Debug)]
struct Args {
    widgets: usize,
    duration: Duration,
    hold: Duration,
    seed: u64,
    broken_every: usize,
    config: Option<PathBuf>,
    debug_port: Option<u16>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);

    let mut widgets = DEFAULT_WIDGETS;
    let mut duration = Duration::from_secs(DEFAULT_DURATION_SECS);
    let mut hold = Duration::from_millis(DEFAULT_HOLD_MS);
    let mut seed = 7u64;
    let mut broken_every = 10usize;
    let mut config = None;
    let mut debug_port = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-w" | "--widgets" => {
                if let Some(v) = args.next() {
                    widgets = v.parse().map_err(|_| format!("invalid widget count '{}'", v))?;
                }
            }
            "-d" | "--duration" => {
                if let Some(v) = args.next() {
                    duration = Duration::from_secs(v.parse().unwrap_or(DEFAULT_DURATION_SECS));
                }
            }
            "--hold-ms" => {
                if let Some(v) = args.next() {
                    hold = Duration::from_millis(v.parse().unwrap_or(DEFAULT_HOLD_MS));
                }
            }
            "-s" | "--seed" => {
                if let Some(v) = args.next() {
                    seed = v.parse().unwrap_or(7);
                }
            }
            "--broken-every" => {
                if let Some(v) = args.next() {
                    broken_every = v.parse().unwrap_or(10);
                }
            }
            "-c" | "--config" => {
                if let Some(v) = args.next() {
                    config = Some(PathBuf::from(v));
                }
            }
            "--debug-port" => {
                if let Some(v) = args.next() {
                    debug_port = Some(v.parse().map_err(|_| format!("invalid port '{}'", v))?);
                }
            }
            "-h" | "--help" | "help" => {
                return Err("show_help".to_string());
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    Ok(Args {
        widgets,
        duration,
        hold,
        seed,
        broken_every,
        config,
        debug_port,
    })
}

fn print_help() {
    println!("Preview Storm Simulator");
    println!("=======================");
    println!();
    println!("Usage: preview_storm [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -w, --widgets <N>        Preview widgets to simulate (default: 24)");
    println!("  -d, --duration <SECS>    Run time in seconds (default: 20)");
    println!("  --hold-ms <MS>           Time a ready preview stays on screen (default: 1500)");
    println!("  -s, --seed <N>           Figurine seed (default: 7)");
    println!("  --broken-every <N>       Every Nth widget gets a malformed model, 0 for none (default: 10)");
    println!("  -c, --config <FILE>      Scheduler config JSON");
    println!("  --debug-port <PORT>      Start the debug stats server on this port");
}

/// Small deterministic generator for figurine shapes
fn next_random(state: &mut u64) -> f32 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    (*state >> 40) as f32 / (1u64 << 24) as f32
}

/// Append a UV sphere to an OBJ document, returning the new vertex count
fn push_sphere(obj: &mut String, base: usize, center: [f32; 3], radius: f32, segments: usize, rings: usize) -> usize {
    let stride = segments + 1;
    for ring in 0..=rings {
        let theta = ring as f32 / rings as f32 * std::f32::consts::PI;
        for seg in 0..=segments {
            let phi = seg as f32 / segments as f32 * std::f32::consts::TAU;
            let _ = writeln!(
                obj,
                "v {:.4} {:.4} {:.4}",
                center[0] + radius * theta.sin() * phi.cos(),
                center[1] + radius * theta.cos(),
                center[2] + radius * theta.sin() * phi.sin()
            );
        }
    }
    for ring in 0..rings {
        for seg in 0..segments {
            let a = base + ring * stride + seg + 1;
            let b = a + stride;
            let _ = writeln!(obj, "f {} {} {} {}", a, b, b + 1, a + 1);
        }
    }
    base + (rings + 1) * stride
}

/// A stacked-sphere figurine; detail varies with the seed
fn figurine_obj(seed: u64) -> String {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    let detail = 8 + (next_random(&mut state) * 56.0) as usize;
    let body = 0.4 + next_random(&mut state) * 0.3;
    let head = 0.2 + next_random(&mut state) * 0.15;

    let mut obj = String::new();
    let _ = writeln!(obj, "# figurine {}", seed);
    let _ = writeln!(obj, "o body\nusemtl clay");
    let mut vertices = push_sphere(&mut obj, 0, [0.0, body, 0.0], body, detail, detail / 2);
    let _ = writeln!(obj, "o head\nusemtl skin");
    vertices = push_sphere(&mut obj, vertices, [0.0, body * 2.0 + head, 0.0], head, detail, detail / 2);
    log::trace!("Figurine {}: {} vertices", seed, vertices);
    obj
}

fn broken_obj() -> String {
    "o broken\nv 0 0 0\nv 1 0 0\nf 1 2 9\n".to_string()
}

async fn run_widget(scheduler: AssetScheduler, index: usize, args: Arc<Args>, deadline: Instant) {
    let id = format!("widget-{:02}", index);
    let priority = 0.1 + (index % 10) as f32 / 10.0;
    let broken = args.broken_every > 0 && index % args.broken_every == args.broken_every - 1;
    let mut round = 0u64;

    while Instant::now() < deadline {
        let payload = if broken {
            broken_obj()
        } else {
            figurine_obj(args.seed.wrapping_add(index as u64 * 31 + round))
        };
        let locator = scheduler.register_blob(&id, Arc::from(payload.into_bytes()));
        let preview = scheduler.preview(&id, locator, priority).await;

        let pause = match preview.state {
            PreviewState::Ready => {
                log::debug!(
                    "{} showing {} triangles at LOD {} (antialias {})",
                    id,
                    preview.model.triangle_count_at(preview.quality.lod_level),
                    preview.quality.lod_level,
                    preview.quality.antialias
                );
                tokio::time::sleep(args.hold).await;
                Duration::from_millis(200)
            }
            PreviewState::Retrying | PreviewState::ResourceLimit => Duration::from_millis(800),
            PreviewState::Fallback => {
                if let Some(err) = &preview.error {
                    log::warn!("{} fell back to placeholder: {}", id, err);
                }
                Duration::from_secs(3)
            }
        };
        scheduler.release(&id);
        round += 1;
        tokio::time::sleep(pause).await;
    }
}

/// Stand-in for the compositor: one frame every ~16ms, slower with more previews
async fn run_frames(scheduler: AssetScheduler, deadline: Instant) {
    let mut interval = tokio::time::interval(Duration::from_millis(16));
    while Instant::now() < deadline {
        interval.tick().await;
        let prepared = scheduler.stats().prepared_models;
        scheduler.record_frame(2.0 + prepared as f32 * 1.5);
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            if e == "show_help" {
                print_help();
                return;
            }
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    logging::init_with_timestamps();

    let config = match &args.config {
        Some(path) => match SchedulerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => SchedulerConfig::default(),
    };

    let locators = Arc::new(LocatorRegistry::new());
    let scheduler = AssetScheduler::with_locators(
        config,
        Arc::new(LocalSource::new(locators.clone())),
        Arc::new(ObjDecoder),
        locators,
    );
    scheduler.start();

    let _debug_server = args
        .debug_port
        .map(|port| SchedulerDebugHandler::serve(scheduler.clone(), port));

    log::info!(
        "Preview storm: {} widgets for {:?} (hold {:?})",
        args.widgets,
        args.duration,
        args.hold
    );

    let deadline = Instant::now() + args.duration;
    let args = Arc::new(args);
    let mut tasks = Vec::with_capacity(args.widgets + 1);
    tasks.push(tokio::spawn(run_frames(scheduler.clone(), deadline)));
    for index in 0..args.widgets {
        tasks.push(tokio::spawn(run_widget(scheduler.clone(), index, args.clone(), deadline)));
    }

    let reporter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            loop {
                interval.tick().await;
                let stats = scheduler.stats();
                log::info!(
                    "contexts {}/{} (+{} queued) | loads {} active, {} queued | batch {} pending | prepared {} | cache hit {:.0}% | gpu {:.1} MB | {:?}",
                    stats.active_contexts,
                    stats.max_contexts,
                    stats.queued_contexts,
                    stats.active_loads,
                    stats.queued_loads,
                    stats.pending_batch,
                    stats.prepared_models,
                    stats.cache_hit_ratio * 100.0,
                    stats.gpu.bytes as f64 / (1024.0 * 1024.0),
                    stats.performance_state
                );
            }
        })
    };

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Widget task failed: {}", e);
        }
    }
    reporter.abort();

    let stats = scheduler.stats();
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize stats: {}", e),
    }
    scheduler.shutdown();
    scheduler.reset();
}
