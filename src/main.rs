use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use lorans_rs::lorawan::crypto::derive_session_keys;
use lorans_rs::lorawan::{AppNonce, DevNonce};
use lorans_rs::{
    init_logger, init_logging_with_filter, load_devices, AesKey, ApplicationDownlink, ChannelDownlinkSender, Collaborators,
    CollectingUpstreamSink, DataRate, DecoderRegistry, DevEui, InMemoryCounterCoordinator, InMemoryDownlinkSource,
    InMemorySessionStore, JsonFileSessionStore, MessageDispatcher, NetId, ServerConfig, Services, SessionStore,
    StationEui, UplinkRequest,
};
use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lorans")]
#[command(about = "LoRaWAN network server processing core")]
struct Cli {
    /// Log filter such as `info` or `lorans_rs::processing=debug`; defaults to `RUST_LOG`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive NwkSKey and AppSKey of an OTAA session
    DeriveKeys {
        #[arg(long)]
        app_key: String,
        /// 24-bit hex
        #[arg(long)]
        app_nonce: String,
        /// 24-bit hex
        #[arg(long)]
        net_id: String,
        /// 16-bit hex
        #[arg(long)]
        dev_nonce: String,
    },
    /// Run recorded uplinks through the processing pipeline
    Replay {
        /// Server configuration (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Device provisioning records (JSON array)
        #[arg(long)]
        devices: PathBuf,
        /// One uplink per line (JSON)
        #[arg(long)]
        uplinks: PathBuf,
        /// Pending application downlinks (JSON array)
        #[arg(long)]
        downlinks: Option<PathBuf>,
        /// Persist sessions as JSON files in this directory
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
}

/// Recorded uplink.
#[derive(Debug, Deserialize)]
struct ReplayUplink {
    station: StationEui,
    frequency: u32,
    data_rate: u8,
    #[serde(default)]
    snr: f32,
    payload: String,
}

#[derive(Debug, Deserialize)]
struct PendingDownlink {
    dev_eui: DevEui,
    #[serde(flatten)]
    message: ApplicationDownlink,
}

fn parse_hex_u32(value: &str, what: &str) -> Result<u32> {
    u32::from_str_radix(value.trim_start_matches("0x"), 16).with_context(|| format!("invalid {what}: {value}"))
}

fn derive_keys(app_key: &str, app_nonce: &str, net_id: &str, dev_nonce: &str) -> Result<()> {
    let app_key = AesKey::from_hex(app_key).context("invalid AppKey")?;
    let app_nonce = AppNonce(parse_hex_u32(app_nonce, "AppNonce")? & 0x00FF_FFFF);
    let net_id = NetId(parse_hex_u32(net_id, "NetID")? & 0x00FF_FFFF);
    let dev_nonce = DevNonce(u16::try_from(parse_hex_u32(dev_nonce, "DevNonce")?).context("DevNonce exceeds 16 bits")?);

    let keys = derive_session_keys(&app_key, app_nonce, net_id, dev_nonce);
    println!("NwkSKey: {}", hex::encode_upper(keys.nwk_s_key.as_bytes()));
    println!("AppSKey: {}", hex::encode_upper(keys.app_s_key.as_bytes()));
    Ok(())
}

async fn replay(
    config: Option<PathBuf>,
    devices: PathBuf,
    uplinks: PathBuf,
    downlinks: Option<PathBuf>,
    store_dir: Option<PathBuf>,
) -> Result<()> {
    let config = match config {
        Some(path) => ServerConfig::load_from_file(&path).with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    let region = config.region()?;
    let store: Arc<dyn SessionStore> = match store_dir {
        Some(dir) => Arc::new(JsonFileSessionStore::new(dir)),
        None => Arc::new(InMemorySessionStore::new()),
    };

    let source = Arc::new(InMemoryDownlinkSource::new());
    if let Some(path) = downlinks {
        let pending: Vec<PendingDownlink> = serde_json::from_str(&fs::read_to_string(&path)?)
            .with_context(|| format!("parsing {}", path.display()))?;
        for entry in pending {
            source.push(entry.dev_eui, entry.message);
        }
    }

    let (sender, mut sent) = ChannelDownlinkSender::new();
    let upstream = Arc::new(CollectingUpstreamSink::new());
    let services = Services::new(
        config,
        Collaborators {
            store: Arc::clone(&store),
            downlink_sender: Arc::new(sender),
            upstream: upstream.clone(),
            downlink_source: source,
            coordinator: Some(Arc::new(InMemoryCounterCoordinator::new())),
            decoders: DecoderRegistry::with_builtins(),
        },
    )?;
    for device in load_devices(&devices)? {
        services.provision(device).await?;
    }
    info!("{} device(s) provisioned", services.registry.len());

    let dispatcher = MessageDispatcher::new(Arc::new(services));
    let reader = BufReader::new(fs::File::open(&uplinks).with_context(|| format!("opening {}", uplinks.display()))?);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let recorded: ReplayUplink =
            serde_json::from_str(&line).with_context(|| format!("uplink on line {}", index + 1))?;
        let payload = lorans_rs::util::decode_hex(&recorded.payload)?;
        let uplink = UplinkRequest::now(
            recorded.station,
            recorded.frequency,
            DataRate(recorded.data_rate),
            recorded.snr,
            payload,
            Arc::clone(&region),
        );

        let outcome = match dispatcher.dispatch(uplink).outcome().await {
            Ok(summary) => serde_json::to_value(&summary)?,
            Err(reason) => serde_json::json!({ "failed": reason }),
        };
        println!("{}", serde_json::json!({ "line": index + 1, "outcome": outcome }));
    }

    for session in dispatcher.services().registry.sessions() {
        session.persist(store.as_ref(), true).await;
    }
    while let Ok(message) = sent.try_recv() {
        println!("{}", serde_json::json!({ "downlink": message }));
    }
    for telemetry in upstream.delivered() {
        println!("{}", serde_json::json!({ "telemetry": telemetry }));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.log_level.as_deref() {
        Some(filter) => init_logging_with_filter(filter).context("initializing logger")?,
        None => init_logger(),
    }
    match cli.command {
        Commands::DeriveKeys {
            app_key,
            app_nonce,
            net_id,
            dev_nonce,
        } => derive_keys(&app_key, &app_nonce, &net_id, &dev_nonce)?,
        Commands::Replay {
            config,
            devices,
            uplinks,
            downlinks,
            store_dir,
        } => replay(config, devices, uplinks, downlinks, store_dir).await?,
    }

    Ok(())
}
