//! `cloudplugs` - command line client for the CloudPlugs platform
//!
//! Publishes data, follows subscriptions, reads and writes properties and
//! enrolls devices over the same client the library exposes.

use clap::{Parser, Subcommand};
use cloudplugs_mqtt::config::BrokerSection;
use cloudplugs_mqtt::observability::{init_default_logging, init_logging, LogFormat};
use cloudplugs_mqtt::{
    ClientConfig, CloudPlugsClient, EnrollCredentials, PublishOptions, SinkEvent,
    SubscribeOptions,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, Level};

/// Default configuration file looked up in the working directory
const DEFAULT_CONFIG_FILE: &str = "cloudplugs.toml";

/// Command line client for the CloudPlugs IoT platform
#[derive(Parser)]
#[command(name = "cloudplugs")]
#[command(about = "Command line client for the CloudPlugs IoT platform")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, e.g. mqtts://api.cloudplugs.com
    #[arg(long, env = "CLOUDPLUGS_BROKER")]
    broker: Option<String>,

    /// Plug id used as MQTT username
    #[arg(long, env = "CLOUDPLUGS_PLUG_ID")]
    plug_id: Option<String>,

    /// Auth token used as MQTT password
    #[arg(long, env = "CLOUDPLUGS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Session(SessionCommand),
    /// Enroll a device and print its credentials
    Enroll {
        hwid: String,
        model: String,
        #[arg(long, env = "CLOUDPLUGS_ENROLL_PASSWORD", hide_env_values = true)]
        enroll_password: String,
    },
    /// Enroll a device through its controller
    EnrollCtrl {
        hwid: String,
        model: String,
        ctrl_hwid: String,
        #[arg(long, env = "CLOUDPLUGS_ENROLL_PASSWORD", hide_env_values = true)]
        enroll_password: String,
    },
    /// Validate the configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

/// Commands that run over a connected session
#[derive(Subcommand)]
enum SessionCommand {
    /// Publish a data record
    Publish {
        topic: String,
        message: String,
        /// Seconds the platform keeps the record
        #[arg(long)]
        ttl: Option<u32>,
        /// Publish on behalf of another plug
        #[arg(long, value_name = "PLUG_ID")]
        of: Option<String>,
    },
    /// Subscribe and print messages until interrupted
    Subscribe {
        #[arg(required = true)]
        topics: Vec<String>,
        /// Use the filters as given instead of scoping them under a plug
        #[arg(long)]
        no_prefix: bool,
        /// Plug whose data to follow
        #[arg(long, value_name = "PLUG_ID")]
        plug: Option<String>,
    },
    /// Read a property
    Get {
        key: String,
        #[arg(long, value_name = "PLUG_ID")]
        plug: Option<String>,
    },
    /// Write a property; the value is parsed as JSON when possible
    Set {
        key: String,
        value: String,
        #[arg(long, value_name = "PLUG_ID")]
        plug: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, config).await {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            info!("Loading configuration from: {}", DEFAULT_CONFIG_FILE);
            ClientConfig::load_from_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => ClientConfig::default(),
    };

    if let Some(url) = &cli.broker {
        let broker = BrokerSection::from_url(url)?;
        config.broker = BrokerSection {
            keep_alive_secs: config.broker.keep_alive_secs,
            connect_timeout_secs: config.broker.connect_timeout_secs,
            ..broker
        };
    }
    if let Some(plug_id) = &cli.plug_id {
        config.device.plug_id = Some(plug_id.clone());
    }
    if let Some(password) = &cli.password {
        config.device.password = Some(password.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn run(command: Commands, config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Config { show } => {
            if show {
                let mut shown = config.clone();
                if shown.device.password.is_some() {
                    shown.device.password = Some("********".to_string());
                }
                println!("{}", toml::to_string_pretty(&shown)?);
            } else {
                println!("Configuration is valid");
            }
            Ok(())
        }
        Commands::Enroll {
            hwid,
            model,
            enroll_password,
        } => {
            let client = CloudPlugsClient::new(config)?;
            let credentials = client.enroll(&hwid, &model, &enroll_password).await?;
            print_credentials(&credentials);
            Ok(())
        }
        Commands::EnrollCtrl {
            hwid,
            model,
            ctrl_hwid,
            enroll_password,
        } => {
            let client = CloudPlugsClient::new(config)?;
            let credentials = client
                .enroll_ctrl(&hwid, &model, &ctrl_hwid, &enroll_password)
                .await?;
            print_credentials(&credentials);
            Ok(())
        }
        Commands::Session(command) => {
            let client = CloudPlugsClient::new(config)?;
            client.connect().await?;
            let result = run_connected(&client, command).await;
            client.disconnect().await?;
            result
        }
    }
}

async fn run_connected(
    client: &CloudPlugsClient,
    command: SessionCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        SessionCommand::Publish {
            topic,
            message,
            ttl,
            of,
        } => {
            let options = PublishOptions {
                ttl,
                plug_id_of: of,
            };
            client.publish_with(&topic, &message, options).await?;
            info!("Published to {}", topic);
        }
        SessionCommand::Subscribe {
            topics,
            no_prefix,
            plug,
        } => {
            let mut messages = client.message_channel();
            for topic in &topics {
                let options = SubscribeOptions {
                    prefix: no_prefix.then_some(false),
                    plug_id: plug.clone(),
                };
                let filter = client.subscribe_with(topic, options).await?;
                info!("Subscribed to {}", filter);
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, shutting down");
                        break;
                    }
                    event = messages.recv() => match event {
                        Some(SinkEvent::Message(message)) => {
                            println!("{} {}", message.topic, String::from_utf8_lossy(&message.payload));
                        }
                        Some(SinkEvent::ConnectionLost(reason)) => {
                            return Err(format!("connection lost: {reason}").into());
                        }
                        None => break,
                    }
                }
            }
        }
        SessionCommand::Get { key, plug } => {
            let value = match plug {
                Some(plug) => client.get_property_of(&plug, &key).await?,
                None => client.get_property(&key).await?,
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        SessionCommand::Set { key, value, plug } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            match plug {
                Some(plug) => client.set_property_of(&plug, &key, value).await?,
                None => client.set_property(&key, value).await?,
            }
            info!("Property {} updated", key);
        }
    }
    Ok(())
}

fn print_credentials(credentials: &EnrollCredentials) {
    println!("[device]");
    println!("plug_id = \"{}\"", credentials.plug_id);
    println!("password = \"{}\"", credentials.auth);
}
