//! Hub server binary.
//!
//! ```bash
//! # Write a default hub.yml
//! dchub init
//!
//! # Run the hub
//! dchub serve --port 1411
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dchub_server::config::{self, FileConfig, Value};
use dchub_server::{Config, Hub, HubOptions, MemoryDatabase, Server};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_FILE: &str = "hub.yml";
const SYSTEM_CONFIG_DIR: &str = "/etc/dchub";
const MOTD_FILE: &str = "motd.txt";

/// Multi-protocol Direct Connect hub (NMDC, ADC, IRC)
#[derive(Parser, Debug)]
#[command(name = "dchub")]
#[command(about = "Multi-protocol Direct Connect hub server")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub
    Serve {
        /// Host or IP to advertise
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Name of the hub
        #[arg(long)]
        name: Option<String>,

        /// Description of the hub
        #[arg(long)]
        desc: Option<String>,
    },
    /// Write a default hub.yml and motd.txt
    Init,
}

fn find_config() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    let system = Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE);
    if system.exists() {
        return Some(system);
    }
    None
}

fn load_or_init_config() -> Result<(FileConfig, serde_yaml::Value), Box<dyn std::error::Error>> {
    let path = match find_config() {
        Some(path) => path,
        None => {
            write_default_config()?;
            tracing::info!("initialized config: {CONFIG_FILE}");
            PathBuf::from(CONFIG_FILE)
        },
    };
    let text = std::fs::read_to_string(&path)?;
    let file: FileConfig = serde_yaml::from_str(&text)?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&text)?;
    tracing::info!("loaded config: {}", path.display());
    Ok((file, raw))
}

fn write_default_config() -> Result<(), Box<dyn std::error::Error>> {
    let yaml = serde_yaml::to_string(&FileConfig::default())?;
    std::fs::write(CONFIG_FILE, yaml)?;
    if !Path::new(MOTD_FILE).exists() {
        std::fs::write(MOTD_FILE, dchub_server::motd::DEFAULT_MOTD)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match args.command {
        Command::Init => {
            write_default_config()?;
            println!("initialized config: {CONFIG_FILE}");
            Ok(())
        },
        Command::Serve { host, port, name, desc } => serve(host, port, name, desc).await,
    }
}

async fn serve(
    host: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    desc: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (file, raw) = load_or_init_config()?;

    let conf = Config::new();
    if let Some(map) = raw.as_mapping() {
        conf.merge_file_map(map);
    }
    // Flags win over the file.
    if let Some(name) = name {
        conf.set(config::CONFIG_HUB_NAME, Value::Str(name), true);
    }
    if let Some(desc) = desc {
        conf.set(config::CONFIG_HUB_DESC, Value::Str(desc), true);
    }

    // The motd key in the file names a template file; load its text.
    let motd_path = file.hub.motd.clone();
    if motd_path.contains('\n') {
        // Inline template, not a file name.
        conf.set(config::CONFIG_HUB_MOTD, Value::Str(motd_path.clone()), true);
    } else if !motd_path.is_empty() {
        match std::fs::read_to_string(&motd_path) {
            Ok(text) => conf.set(config::CONFIG_HUB_MOTD, Value::Str(text), true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(&motd_path, dchub_server::motd::DEFAULT_MOTD)?;
                conf.set(
                    config::CONFIG_HUB_MOTD,
                    Value::Str(dchub_server::motd::DEFAULT_MOTD.to_string()),
                    true,
                );
            },
            Err(e) => return Err(e.into()),
        }
    }

    let host = host.unwrap_or(file.serve.host);
    let port = port.unwrap_or(file.serve.port);
    let addr = format!("{host}:{port}");

    let opts = HubOptions {
        addr: addr.clone(),
        tls_addr: file.serve.tls_addr.clone(),
        keyprint: None,
        fallback_encoding: if file.chat.encoding.is_empty() {
            None
        } else {
            Some(file.chat.encoding.clone())
        },
        chat_log_max: file.chat.log.max,
        chat_log_join: file.chat.log.join,
        ..HubOptions::default()
    };
    if let Some(enc) = &opts.fallback_encoding {
        tracing::info!("fallback encoding: {enc}");
    }

    let db = Arc::new(MemoryDatabase::new());
    tracing::warn!("using in-memory user database; registrations will not survive a restart");

    let hub = Hub::new(conf, opts, db);
    let server = Server::bind(hub, &format!("0.0.0.0:{port}")).await?;

    println!();
    println!("[ Hub URIs ]");
    if let Some(url) = server.hub().adcs_url() {
        println!("{url}");
    }
    println!("{}", server.hub().adc_url());
    if let Some(url) = server.hub().nmdcs_url() {
        println!("{url}");
    }
    println!("dchub://{addr}");
    println!();
    println!("[ IRC chat ]");
    println!("irc://{addr}/hub");
    println!();

    server.run().await?;
    Ok(())
}
