use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mvsd_network::messages::NetworkAddress;
use mvsd_network::settings::Endpoint;
use mvsd_network::{NetworkSettings, P2p, SessionKind};
use mvsd_node::{
    BlockChain, HeaderQueue, MemoryBlockChain, Reservations, SessionBlockSync,
    DEFAULT_RATE_FACTOR,
};
use mvsd_primitives::{Decoder, Encoder, Hash256};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_SYNC_SLOTS: usize = 3;
const PEERS_FILE_NAME: &str = "peers.dat";
const PEERS_FILE_VERSION: u32 = 1;

struct Config {
    data_dir: PathBuf,
    listen: Option<SocketAddr>,
    seeds: Vec<Endpoint>,
    host_pool_capacity: u32,
    sync_headers: Option<PathBuf>,
    sync_slots: usize,
}

impl Config {
    fn parse() -> Result<Self, String> {
        let mut config = Config {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen: None,
            seeds: Vec::new(),
            host_pool_capacity: 1000,
            sync_headers: None,
            sync_slots: DEFAULT_SYNC_SLOTS,
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--data-dir" => {
                    config.data_dir = PathBuf::from(next_value(&mut args, "--data-dir")?)
                }
                "--listen" => {
                    config.listen = Some(
                        next_value(&mut args, "--listen")?
                            .parse()
                            .map_err(|err| format!("--listen: {err}"))?,
                    )
                }
                "--seed" => config.seeds.push(
                    next_value(&mut args, "--seed")?
                        .parse()
                        .map_err(|err| format!("--seed: {err}"))?,
                ),
                "--host-pool-capacity" => {
                    config.host_pool_capacity = next_value(&mut args, "--host-pool-capacity")?
                        .parse()
                        .map_err(|err| format!("--host-pool-capacity: {err}"))?
                }
                "--sync-headers" => {
                    config.sync_headers =
                        Some(PathBuf::from(next_value(&mut args, "--sync-headers")?))
                }
                "--sync-slots" => {
                    config.sync_slots = next_value(&mut args, "--sync-slots")?
                        .parse()
                        .map_err(|err| format!("--sync-slots: {err}"))?
                }
                "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument {other}")),
            }
        }
        Ok(config)
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, name: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("missing value for {name}"))
}

fn print_usage() {
    println!("mvsd options:");
    println!("  --data-dir <path>            state directory (default: data)");
    println!("  --listen <addr:port>         accept inbound connections");
    println!("  --seed <host:port>           seed endpoint, repeatable");
    println!("  --host-pool-capacity <n>     address pool bound, 0 disables seeding");
    println!("  --sync-headers <file>        run block sync over '<height> <hash>' lines");
    println!("  --sync-slots <n>             parallel download slots (default: 3)");
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse()?;
    fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create {}: {err}", config.data_dir.display()))?;

    let settings = NetworkSettings {
        seeds: config.seeds.clone(),
        host_pool_capacity: config.host_pool_capacity,
        ..NetworkSettings::default()
    };
    let p2p = P2p::new(settings);

    let peers_path = config.data_dir.join(PEERS_FILE_NAME);
    match load_peers_file(&peers_path) {
        Ok(peers) => {
            let loaded = p2p.hosts().load(peers);
            if loaded > 0 {
                info!(loaded, "loaded cached peer addresses");
            }
        }
        Err(err) => warn!(%err, "ignoring unreadable peers file"),
    }

    p2p.start(config.listen)
        .await
        .map_err(|ec| format!("p2p start failed: {ec}"))?;

    if let Some(headers_path) = &config.sync_headers {
        let queue = load_header_queue(headers_path)?;
        info!(headers = queue.size(), "starting block sync");
        let chain = Arc::new(MemoryBlockChain::new());
        let reservations = Arc::new(Reservations::new(
            &queue,
            Arc::clone(&chain) as Arc<dyn BlockChain>,
            config.sync_slots,
            DEFAULT_RATE_FACTOR,
        ));
        let sync = SessionBlockSync::new(p2p.session(SessionKind::BlockSync), reservations);
        sync.start()
            .await
            .map_err(|ec| format!("block sync failed: {ec}"))?;
        info!(blocks = chain.len(), "block sync complete");
    } else {
        tokio::signal::ctrl_c()
            .await
            .map_err(|err| format!("signal wait failed: {err}"))?;
        info!("shutdown requested");
    }

    p2p.stop();
    if let Err(err) = save_peers_file(&peers_path, &p2p.hosts().snapshot()) {
        warn!(%err, "failed to persist peers");
    }
    Ok(())
}

fn load_peers_file(path: &Path) -> Result<Vec<NetworkAddress>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).map_err(|err| err.to_string())?;
    let mut decoder = Decoder::new(&bytes);
    let version = decoder.read_u32_le().map_err(|err| err.to_string())?;
    if version != PEERS_FILE_VERSION {
        return Err(format!("unsupported peers file version {version}"));
    }
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let mut peers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        peers.push(NetworkAddress::decode(&mut decoder, true).map_err(|err| err.to_string())?);
    }
    Ok(peers)
}

fn save_peers_file(path: &Path, peers: &[NetworkAddress]) -> Result<(), String> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(PEERS_FILE_VERSION);
    encoder.write_varint(peers.len() as u64);
    for peer in peers {
        peer.encode(&mut encoder, true);
    }
    write_file_atomic(path, &encoder.into_inner())
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| err.to_string())?;
    fs::rename(&tmp, path).map_err(|err| err.to_string())
}

fn load_header_queue(path: &Path) -> Result<HeaderQueue, String> {
    let contents = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let queue = HeaderQueue::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (height, hash_hex) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("line {}: expected '<height> <hash>'", number + 1))?;
        let height: u32 = height
            .trim()
            .parse()
            .map_err(|err| format!("line {}: {err}", number + 1))?;
        let hash = decode_hash(hash_hex.trim())
            .ok_or_else(|| format!("line {}: invalid hash", number + 1))?;
        queue
            .enqueue(hash, height)
            .map_err(|ec| format!("line {}: {ec}", number + 1))?;
    }
    Ok(queue)
}

fn decode_hash(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (index, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        out[index] = (high as u8) << 4 | low as u8;
    }
    Some(out)
}
