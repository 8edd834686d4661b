//! Headless bootstrap: build a world, throw waves at it, log summaries.

use anyhow::Result;
use hordesim_core::{Position, SimConfig, SpawnTemplate, ThreatLevel, WorldState};
use tracing::{info, warn};

const DT: f32 = 1.0 / 30.0;
const TICKS_PER_WAVE: u64 = 600;
const WAVES: u32 = 4;

fn main() -> Result<()> {
    init_tracing();
    let mut world = bootstrap_world()?;
    info!("Starting horde battle simulation shell");

    for wave in 0..WAVES {
        let count = 400 + wave as usize * 200;
        let crystal = world.config().crystal;
        let mut marcher = SpawnTemplate::marching_zombie();
        marcher.profile.idle_duration = 0.5;
        world.spawn_wave(&marcher, count, crystal, 200.0);
        info!(wave = wave + 1, zombies = count, "Wave released");

        for _ in 0..TICKS_PER_WAVE {
            let events = world.step(DT);
            if events.crystal_depleted {
                warn!(tick = events.tick.0, "Crystal depleted, simulation over");
                report(&world);
                return Ok(());
            }
            if events.tick.0.is_multiple_of(150) {
                report(&world);
            }
        }
        world.clear_wave();
    }

    report(&world);
    if let Some(summary) = world.history().last() {
        info!(final_tick = summary.tick.0, "Run complete");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_world() -> Result<WorldState> {
    let config = SimConfig {
        world_width: 960,
        world_height: 960,
        nav_cell_size: 4,
        index_cell_size: 8.0,
        crystal: Position::new(480.0, 480.0),
        rng_seed: Some(0xFACA_DE5A),
        ..SimConfig::default()
    };
    let mut world = WorldState::new(config)?;
    info!(config = %serde_json::to_string(world.config())?, "World configured");

    for slot in 0..48 {
        let angle = slot as f32 / 48.0 * std::f32::consts::TAU;
        world.spawn(
            &SpawnTemplate::soldier(),
            Position::new(480.0 + angle.cos() * 36.0, 480.0 + angle.sin() * 36.0),
        );
    }
    world.spawn(
        &SpawnTemplate::structure(4, 4, 600.0),
        Position::new(440.0, 480.0),
    );
    world.command_move(Position::new(480.0, 400.0));
    Ok(world)
}

fn report(world: &WorldState) {
    let Some(summary) = world.history().last() else {
        return;
    };
    let threat = match world.threat_level() {
        ThreatLevel::Calm => "calm",
        ThreatLevel::Raid => "raid",
        ThreatLevel::Siege => "siege",
    };
    info!(
        tick = summary.tick.0,
        soldiers = summary.soldiers,
        zombies = summary.zombies,
        deaths = summary.deaths,
        damage = summary.damage_applied,
        crystal = world.crystal_power().percent(),
        threat,
        "Tick summary",
    );
}
