use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use server::map::Map;
use server::network::{run_io_loop, run_listener, NetConfig, NetHub};
use server::storage::{CharacterRecord, CharacterStore, FileStore};
use server::world::{run_world_loop, World, WorldConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Authoritative world server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "2000")]
    port: u16,
    /// World tick rate (ticks per second)
    #[clap(short, long, default_value = "20")]
    tick_rate: u32,
    /// Directory holding character records
    #[clap(short, long, default_value = "data")]
    data_dir: PathBuf,
    /// Seconds of silence before a connection is dropped
    #[clap(long, default_value = "30")]
    liveness_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let world_cfg = WorldConfig {
        tick: Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64),
        ..WorldConfig::default()
    };
    let net_cfg = NetConfig {
        liveness_timeout: Duration::from_secs(args.liveness_timeout),
        ..NetConfig::default()
    };

    let store = FileStore::new(&args.data_dir)?;
    // A throwaway account so a fresh data directory is immediately usable.
    if !store.exists("player") {
        let spawn = world_cfg.start_tile;
        store.save(&CharacterRecord::new(
            "player",
            "player",
            &world_cfg.start_map,
            spawn.0,
            spawn.1,
        ))?;
        log::info!("Seeded default character 'player'");
    }

    // Until map files load from disk, the world is one flat field.
    let start_map = Map::flat(&world_cfg.start_map, 192, 192, 1);
    let mut world = World::new(
        world_cfg,
        vec![start_map],
        Box::new(store),
        StdRng::from_entropy(),
    );
    world.spawn_npc("rabbit", "maps/startmap.elm", (20, 20));
    world.spawn_npc("deer", "maps/startmap.elm", (40, 35));

    let listener = TcpListener::bind(format!("{}:{}", args.host, args.port)).await?;
    let hub = Arc::new(NetHub::new());

    let listener_handle = tokio::spawn(run_listener(listener, Arc::clone(&hub)));
    let io_handle = tokio::spawn(run_io_loop(Arc::clone(&hub), net_cfg));
    let world_handle = tokio::spawn(run_world_loop(world, Arc::clone(&hub)));

    tokio::signal::ctrl_c().await?;
    log::info!("Received Ctrl+C, shutting down");
    hub.request_stop();

    let _ = listener_handle.await;
    let _ = io_handle.await;
    let _ = world_handle.await;

    Ok(())
}
