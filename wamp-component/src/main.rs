mod component;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::runtime::Handle;
use wamp_client::{
    component::{
        ReconnectPolicy,
        Runner,
        RunnerConfig,
    },
    core::types::{
        Dictionary,
        Value,
    },
    peer::PeerConfig,
};

use crate::component::ClientComponent;

/// Joins a WAMP realm and runs the add2/oncounter demo loop until interrupted.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Enables debug logging.
    #[arg(short, long)]
    debug: bool,

    /// WebSocket URL of the router.
    #[arg(long, env = "CBURL", default_value = "ws://localhost:8080/ws")]
    url: String,

    /// Realm to join.
    #[arg(long, env = "CBREALM", default_value = "realm1")]
    realm: String,

    /// Service name, reported as session metadata.
    #[arg(long = "service_name")]
    service_name: Option<String>,

    /// Service UUID, reported as session metadata.
    #[arg(long = "service_uuid")]
    service_uuid: Option<String>,
}

fn setup_logging(debug: bool) {
    let level = if debug {
        tracing_core::Level::DEBUG
    } else {
        tracing_core::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(debug)
        .init();
}

fn extra(args: &Args) -> Dictionary {
    let mut extra = Dictionary::from_iter([
        (
            "hostname".to_owned(),
            Value::from(gethostname::gethostname().to_string_lossy().into_owned()),
        ),
        ("platform".to_owned(), Value::from(std::env::consts::OS)),
        ("arch".to_owned(), Value::from(std::env::consts::ARCH)),
    ]);
    if let Some(service_name) = &args.service_name {
        extra.insert(
            "service_name".to_owned(),
            Value::from(service_name.clone()),
        );
    }
    if let Some(service_uuid) = &args.service_uuid {
        extra.insert(
            "service_uuid".to_owned(),
            Value::from(service_uuid.clone()),
        );
    }
    extra
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.debug);

    let name = args
        .service_name
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());
    let config = RunnerConfig {
        url: args.url.clone(),
        realm: args.realm.clone(),
        peer: PeerConfig {
            name: name.clone(),
            extra: extra(&args),
            ..Default::default()
        },
        reconnect: ReconnectPolicy {
            auto_reconnect: true,
            max_consecutive_failures: None,
            ..Default::default()
        },
    };
    info!("Starting {name} for {} on {}", config.realm, config.url);

    let runner = Runner::new_web_socket(config, ClientComponent::default(), Handle::current())?;
    let mut handle = runner.start();
    let interrupted = tokio::select! {
        result = handle.join() => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        info!("Interrupted, leaving the realm");
        handle.cancel();
        handle.join().await?;
    }
    Ok(())
}
