//! WAMP client CLI binary.
//!
//! # Commands
//!
//! - `publish` - Publish an event to a topic
//! - `subscribe` - Print events published to a topic
//! - `call` - Call a procedure and print the result
//! - `register` - Register an echo procedure and serve it

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use wamp::{
    config::Config, session::ConnectionEvent, CallOptions, Client, Payload, PublishOptions,
    VERSION,
};

#[derive(Parser)]
#[command(name = "wamp")]
#[command(version = VERSION)]
#[command(about = "WAMP client - publish/subscribe and routed RPC", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/wamp/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Router endpoint (ws://, wss://, tcp://, rs://)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Realm to join
    #[arg(short, long, global = true)]
    realm: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish an event
    Publish {
        /// Topic URI
        topic: String,

        /// Positional arguments as JSON values
        args: Vec<String>,

        /// Wait for the router's acknowledgment
        #[arg(short, long)]
        ack: bool,

        /// Also deliver to our own session
        #[arg(long)]
        include_me: bool,
    },

    /// Print events published to a topic
    Subscribe {
        /// Topic URI
        topic: String,

        /// Exit after this many events
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Call a procedure
    Call {
        /// Procedure URI
        procedure: String,

        /// Positional arguments as JSON values
        args: Vec<String>,

        /// Timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Register a procedure that echoes its arguments
    Register {
        /// Procedure URI
        procedure: String,

        /// Invocations served at once
        #[arg(long, default_value = "1")]
        concurrency: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config, cli.command))
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let file = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_default()?,
    };
    let mut config = file.merge(Config::from_env());

    if let Some(endpoint) = &cli.endpoint {
        config.client.endpoint.clone_from(endpoint);
    }
    if let Some(realm) = &cli.realm {
        config.client.realm.clone_from(realm);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    config.logging.json |= cli.log_json;
    Ok(config)
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_args(args: &[String]) -> Payload {
    // bare words that are not JSON are taken as strings
    Payload::with_args(args.iter().map(|arg| {
        serde_json::from_str::<Value>(arg).unwrap_or_else(|_| Value::String(arg.clone()))
    }))
}

async fn run(config: Config, command: Commands) -> anyhow::Result<()> {
    let client = Client::new(config.client.clone());
    let connection = client.connect_configured().await?;

    let mut events = connection.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Reconnecting { attempt, delay } => {
                    tracing::warn!("Reconnecting (attempt {}) in {:?}", attempt, delay);
                },
                ConnectionEvent::GaveUp { attempts } => {
                    tracing::error!("Gave up after {} attempts", attempts);
                },
                other => tracing::debug!("Connection event: {:?}", other),
            }
        }
    });

    let session = connection.open(&config.client.realm).await?;
    tracing::info!("Joined realm '{}' as session {}", session.realm(), session.id());

    match command {
        Commands::Publish {
            topic,
            args,
            ack,
            include_me,
        } => {
            let options = PublishOptions::default().with_exclude_me(!include_me);
            let payload = parse_args(&args);
            if ack {
                let publication = session.publish_ack_with(&topic, payload, options).await?;
                println!("{}", publication.id);
            } else {
                session.publish_with(&topic, payload, options).await?;
            }
        },

        Commands::Subscribe { topic, count } => {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let subscription = session
                .subscribe(&topic, move |event| {
                    let tx = tx.clone();
                    async move {
                        let line = serde_json::json!({
                            "publication": event.publication,
                            "topic": event.topic,
                            "args": event.payload.args,
                            "kwargs": event.payload.kwargs,
                        });
                        println!("{line}");
                        let _ = tx.send(());
                        Ok(())
                    }
                })
                .await?;
            tracing::info!("Subscribed to '{}' ({})", topic, subscription.id());

            let mut seen = 0;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                        seen += 1;
                        if count.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    },
                }
            }
            subscription.unsubscribe().await?;
        },

        Commands::Call {
            procedure,
            args,
            timeout,
        } => {
            let mut options = CallOptions::default();
            if let Some(ms) = timeout {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            let result = session.call_with(&procedure, parse_args(&args), options).await?;
            let line = serde_json::json!({
                "args": result.payload.args,
                "kwargs": result.payload.kwargs,
            });
            println!("{line}");
        },

        Commands::Register {
            procedure,
            concurrency,
        } => {
            let options = wamp::RegisterOptions::default().with_concurrency(concurrency);
            let registration = session
                .register_with(&procedure, options, |invocation| async move {
                    tracing::info!("Invocation {} of '{}'", invocation.request, invocation.procedure);
                    Ok(invocation.payload)
                })
                .await?;
            tracing::info!("Registered '{}' ({}), Ctrl-C to stop", procedure, registration.id());
            tokio::signal::ctrl_c().await?;
            registration.unregister().await?;
        },
    }

    let closed = session.close().await?;
    tracing::info!("Session closed: {}", closed.reason);
    connection.disconnect().await?;
    Ok(())
}
