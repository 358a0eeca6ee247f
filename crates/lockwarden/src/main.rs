//! lockwarden - simulate the authorization core of a hardware wallet
//!
//! every invocation is one boot of a simulated device living in a data
//! directory. lockout state is rebuilt from the flash image each time.
//!
//! usage:
//!   lockwarden provision 123456
//!   lockwarden unlock 000000          # wrong, arms the delay
//!   lockwarden wait                   # sleep out the delay
//!   lockwarden request fingerprint_reset
//!   lockwarden authority-sign <request-hex>
//!   lockwarden verify <grant-hex>
//!
//! data stored in ~/.lockwarden/

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use lockwarden::config::{Authority, GrantConfig};
use lockwarden::crypto::{labeled_digest, random_bytes, DerivationPath, PublicKey};
use lockwarden::identity::DEVICE_ID_LEN;
use lockwarden::{
    sign_grant, Action, AeadWrapper, AuthContext, Collaborators, Config, DeviceEraser, DirStore,
    Ed25519Provider, Grant, GrantActions, GrantRequest, GrantStatus, MemoryFlash, MonotonicClock,
    SignatureProvider, StaticIdentity,
};

const FLASH_IMAGE: &str = "flash.img";
const BLOB_DIR: &str = "blobs";
const DEVICE_SEED: &str = "device.seed";
const AUTHORITY_SEED: &str = "authority.seed";

type Device = AuthContext<MemoryFlash, DirStore, MonotonicClock, Ed25519Provider, StaticIdentity>;

/// lockwarden - simulate the authorization core of a hardware wallet
#[derive(Parser)]
#[command(name = "lockwarden")]
#[command(about = "lockwarden - unlock lockout and grant authorization simulator")]
#[command(version)]
struct Args {
    /// data directory (default: ~/.lockwarden)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// json config (default: built-in, debug authority from the data dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// store the unlock secret
    Provision { secret: String },
    /// check a candidate unlock secret
    Unlock { secret: String },
    /// sleep until the pending delay has elapsed
    Wait,
    /// forgive failed attempts
    ResetRetries,
    /// print device status as json
    Status,
    /// erase all device secrets
    Wipe,
    /// create a grant request and print it as hex
    Request { action: Action },
    /// sign a request with the debug authority and print the grant as hex
    AuthoritySign { request: String },
    /// verify a grant against the outstanding request
    Verify { grant: String },
    /// drop the outstanding grant request
    DeleteRequest,
}

/// erases the device seed, a stand-in for the wallet seed and biometric templates
struct SeedEraser {
    path: PathBuf,
}

impl DeviceEraser for SeedEraser {
    fn erase_device_secrets(&mut self) -> lockwarden::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                warn!(path = %self.path.display(), "device seed erased");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lockwarden::Error::Erase(format!("{}: {}", self.path.display(), e))),
        }
    }
}

/// action hooks; the simulator only reports them
struct ReportActions;

impl GrantActions for ReportActions {
    fn fingerprint_reset(&mut self) {
        info!("fingerprint enrollment reset");
    }

    fn transaction_verification(&mut self) {
        info!("transaction verified, signing unlocked for this session");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let data_dir = args.data_dir.unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".lockwarden")
    });
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let authority = Ed25519Provider::from_seed(load_seed(&data_dir.join(AUTHORITY_SEED))?);
    let authority_key = authority.derive_key(&DerivationPath::default())?;

    // authority-sign plays the remote side and never boots the device
    if let Command::AuthoritySign { request } = &args.command {
        let request = GrantRequest::from_hex(request)?;
        let grant = sign_grant(&authority, &authority_key, &request)?;
        println!("{}", grant.to_hex());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => default_config(authority.public_key(&authority_key)),
    };

    let flash_path = data_dir.join(FLASH_IMAGE);
    let mut device = boot(&config, &data_dir, &flash_path)?;
    let result = run(&mut device, args.command);

    // persist the flash image even when the command failed
    device.lockout.counter().region().save(&flash_path)?;
    result
}

fn default_config(debug_key: PublicKey) -> Config {
    Config {
        grant: GrantConfig {
            authority: Authority::Debug,
            debug_key: Some(hex::encode(debug_key)),
            ..GrantConfig::default()
        },
        ..Config::default()
    }
}

fn boot(config: &Config, data_dir: &Path, flash_path: &Path) -> Result<Device> {
    let flash = if flash_path.exists() {
        MemoryFlash::load(flash_path, config.counter.page_size)?
    } else {
        MemoryFlash::new(config.counter.page_size, config.counter.pages)
    };

    let seed_path = data_dir.join(DEVICE_SEED);
    let seed = load_seed(&seed_path)?;
    let device_id: [u8; DEVICE_ID_LEN] = labeled_digest(b"lockwarden:device_id", &[&seed[..]])
        [..DEVICE_ID_LEN]
        .try_into()
        .context("device id")?;

    let parts = Collaborators {
        flash,
        store: DirStore::open(data_dir.join(BLOB_DIR))?,
        clock: MonotonicClock::new(),
        provider: Ed25519Provider::from_seed(seed),
        identity: StaticIdentity(device_id),
        wrapper: Box::new(AeadWrapper::new(labeled_digest(b"lockwarden:wrap_key", &[&seed[..]]))),
        eraser: Box::new(SeedEraser { path: seed_path }),
        actions: Box::new(ReportActions),
    };
    Ok(AuthContext::boot(config, parts)?)
}

fn run(device: &mut Device, command: Command) -> Result<()> {
    match command {
        Command::Provision { secret } => {
            device.lockout.provision(secret.as_bytes())?;
            println!("provisioned");
        }
        Command::Unlock { secret } => {
            let outcome = device.lockout.check(secret.as_bytes())?;
            print_json(&outcome)?;
        }
        Command::Wait => {
            let remaining = device.lockout.remaining_delay_ms();
            if remaining > 0 {
                info!(remaining_ms = remaining, "waiting out lockout delay");
                std::thread::sleep(Duration::from_millis(remaining));
            }
            device.lockout.process_timer_event()?;
            println!("delay elapsed");
        }
        Command::ResetRetries => {
            device.lockout.reset_retry_counter()?;
            println!("retry counter reset");
        }
        Command::Status => print_json(&device.status()?)?,
        Command::Wipe => {
            device.wipe()?;
            println!("wiped");
        }
        Command::Request { action } => {
            if !action.persists() {
                warn!(%action, "request lives in ram only and is lost when this process exits");
            }
            let request = device.grants.create_request(action, &device.policy)?;
            println!("{}", request.to_hex());
        }
        Command::AuthoritySign { .. } => bail!("authority-sign runs without booting the device"),
        Command::Verify { grant } => {
            let grant = Grant::from_hex(&grant)?;
            let status = device.authorize(&grant);
            print_json(&status)?;
            if status != GrantStatus::Ok {
                bail!("grant rejected: {:?}", status);
            }
        }
        Command::DeleteRequest => {
            device.grants.delete_outstanding_request()?;
            println!("outstanding request deleted");
        }
    }
    Ok(())
}

/// read a 32-byte seed, creating it on first use
fn load_seed(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        return bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("{}: seed must be 32 bytes", path.display()));
    }
    let seed: [u8; 32] = random_bytes();
    fs::write(path, seed).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(seed)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
