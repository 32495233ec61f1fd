//! Topic Monitor
//!
//! Watches topic templates through the dispatcher and prints every matched
//! message with its path parameters. Can also publish a single message.

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use topic_dispatch::observability::init_default_logging;
use topic_dispatch::registry::{handler_fn, PayloadTransform};
use topic_dispatch::{
    DispatchError, DispatchService, DispatcherConfig, HandlerArgs, ParamKind, Payload,
    PublishOptions, PublishPayload, SubscriptionDescriptor, SubscriptionProvider,
};
use tracing::{error, info, warn};

/// Topic-routing dispatcher monitor
#[derive(Parser)]
#[command(name = "topic-monitor")]
#[command(about = "Watch and publish templated MQTT topics")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TOPIC_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print messages matching the given templates until Ctrl-C
    Watch {
        /// Topic template, e.g. `robotics/status/:appId`; repeatable
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,

        #[arg(short, long, default_value = "pretty")]
        format: OutputFormat,

        /// Decode payloads as text instead of JSON
        #[arg(long)]
        text: bool,
    },
    /// Publish one JSON payload on a template
    Publish {
        template: String,
        /// JSON payload
        payload: String,
        #[arg(long)]
        retain: bool,
    },
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Multi-line, indented payloads
    Pretty,
    /// One line per message
    Compact,
    /// One JSON object per message
    Json,
}

/// Subscribes the command-line templates under one owner
struct MonitorProvider {
    topics: Vec<String>,
    format: OutputFormat,
    text: bool,
}

impl SubscriptionProvider for MonitorProvider {
    fn owner(&self) -> &str {
        "topic-monitor"
    }

    fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor> {
        let format = self.format;
        let transform = if self.text {
            PayloadTransform::Text
        } else {
            PayloadTransform::Json
        };

        self.topics
            .iter()
            .map(|template| {
                SubscriptionDescriptor::new(
                    self.owner(),
                    template.as_str(),
                    handler_fn(move |args: HandlerArgs| async move {
                        print_message(format, &args);
                        Ok::<(), DispatchError>(())
                    }),
                )
                .transform(transform.clone())
                .param(ParamKind::Payload)
                .param(ParamKind::Topic)
                .param(ParamKind::PathParams)
            })
            .collect()
    }
}

fn payload_value(payload: Option<&Payload>) -> Value {
    match payload {
        Some(Payload::Json(value)) => value.clone(),
        Some(Payload::Text(text)) => Value::String(text.clone()),
        Some(Payload::Binary(bytes)) => json!({ "bytes": bytes.len() }),
        None => Value::Null,
    }
}

fn print_message(format: OutputFormat, args: &HandlerArgs) {
    let topic = args.topic().unwrap_or_default();
    let params: serde_json::Map<String, Value> = args
        .path_params()
        .map(|params| {
            params
                .iter()
                .filter_map(|p| {
                    p.name
                        .as_ref()
                        .map(|name| (name.clone(), Value::String(p.value.clone())))
                })
                .collect()
        })
        .unwrap_or_default();
    let payload = payload_value(args.payload());
    let timestamp = chrono::Utc::now().format("%H:%M:%S%.3f");

    match format {
        OutputFormat::Json => {
            let line = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "topic": topic,
                "params": params,
                "payload": payload,
            });
            println!("{line}");
        }
        OutputFormat::Compact => {
            println!("{timestamp} {topic} {} {payload}", Value::Object(params));
        }
        OutputFormat::Pretty => {
            println!("\x1b[1;36m[{timestamp}]\x1b[0m \x1b[1;32m{topic}\x1b[0m");
            for (name, value) in &params {
                println!("  {name} = {value}");
            }
            match serde_json::to_string_pretty(&payload) {
                Ok(body) => println!("{body}\n"),
                Err(_) => println!("{payload}\n"),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            topics,
            format,
            text,
        } => watch(config, topics, format, text).await,
        Commands::Publish {
            template,
            payload,
            retain,
        } => publish(config, template, payload, retain).await,
        Commands::Config { show } => show_config(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DispatcherConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DispatcherConfig::load_from_file(path)?);
    }

    for path_str in ["dispatcher.toml", "config/dispatcher.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DispatcherConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass one with -c/--config or create dispatcher.toml".into())
}

async fn watch(
    config: DispatcherConfig,
    topics: Vec<String>,
    format: OutputFormat,
    text: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider: Arc<dyn SubscriptionProvider> = Arc::new(MonitorProvider {
        topics,
        format,
        text,
    });
    let service = DispatchService::start(config, vec![provider]).await?;

    for entry in service.registry_snapshot().await {
        info!(template = %entry.template, wire_topic = %entry.wire_topic, "Watching");
    }

    signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    service.shutdown().await;
    Ok(())
}

async fn publish(
    config: DispatcherConfig,
    template: String,
    payload: String,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let value: Value = serde_json::from_str(&payload)?;
    let service = DispatchService::start(config, Vec::new()).await?;

    let options = PublishOptions {
        retain,
        ..PublishOptions::default()
    };
    let outcome = service
        .publisher()
        .publish(&template, PublishPayload::Json(value), options)
        .await;
    service.shutdown().await;

    match outcome {
        Some(receipt) => {
            println!("{}", receipt.wire_topic);
            Ok(())
        }
        None => {
            warn!(template = %template, "Publish was not delivered");
            Err("publish failed".into())
        }
    }
}

fn show_config(config: &DispatcherConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
