//! Manual smoke-test harness for the engine (SPEC_FULL.md §1.1 "CLI"): drives
//! `connect`/`publish`/`subscribe`/`disconnect` against a real broker the way
//! a developer would from a terminal, rather than from an automated test.

use std::{process::ExitCode, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use mqtt_client::{Callbacks, Client, ConnectOptions, DisconnectOptions, Engine, EngineConfig, QosLevel, TokioTransport};

#[derive(Debug, Parser)]
#[command(name = "mqtt-cli")]
#[command(about = "Manual smoke-test client for the mqtt-client engine", long_about = None)]
struct Cli {
    /// Broker address, e.g. tcp://localhost:1883 or ssl://localhost:8883
    #[arg(long, default_value = "tcp://localhost:1883", global = true)]
    server: String,

    /// MQTT client id to connect with
    #[arg(long, default_value = "mqtt-cli", global = true)]
    client_id: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connect to the broker and disconnect immediately.
    Connect {
        #[arg(long, default_value_t = 60)]
        keep_alive_secs: u64,
    },
    /// Publish a single message, wait for its ack, then disconnect.
    Publish {
        #[arg(value_name = "TOPIC")]
        topic: String,
        #[arg(value_name = "PAYLOAD")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long, default_value_t = false)]
        retained: bool,
    },
    /// Subscribe to a topic filter and print messages until interrupted.
    Subscribe {
        #[arg(value_name = "TOPIC_FILTER")]
        topic: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
    },
    /// Connect then disconnect right away, exercising the clean-session path.
    Disconnect,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = EngineConfig::default();
    let _ = mqtt_client::EngineLogger::new(&config).init(config.log_level());

    let cli = Cli::parse();
    if let Err(err) = run(cli, config).await {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli, config: EngineConfig) -> Result<(), mqtt_client::ClientError> {
    let engine = Engine::new(TokioTransport::new(), config);

    match cli.command {
        Commands::Connect { keep_alive_secs } => {
            let client = Client::create(Arc::clone(&engine), cli.client_id, cli.server, None).await?;
            connect(&client, keep_alive_secs).await?;
            println!("connected");
            disconnect(&client).await?;
            println!("disconnected");
            client.destroy().await?;
        }
        Commands::Disconnect => {
            let client = Client::create(Arc::clone(&engine), cli.client_id, cli.server, None).await?;
            connect(&client, 60).await?;
            disconnect(&client).await?;
            println!("disconnected");
            client.destroy().await?;
        }
        Commands::Publish {
            topic,
            payload,
            qos,
            retained,
        } => {
            let client = Client::create(Arc::clone(&engine), cli.client_id, cli.server, None).await?;
            connect(&client, 60).await?;
            let qos = parse_qos(qos)?;
            let token = client.publish(&topic, Bytes::from(payload.into_bytes()), qos, retained).await?;
            client.wait_for_completion(token, Duration::from_secs(30)).await?;
            println!("published to {topic}");
            disconnect(&client).await?;
            client.destroy().await?;
        }
        Commands::Subscribe { topic, qos } => {
            let client = Client::create(Arc::clone(&engine), cli.client_id.clone(), cli.server, None).await?;
            client
                .set_callbacks(Callbacks {
                    on_connection_lost: Some(Box::new(|reason| {
                        println!("connection lost: {reason:?}");
                    })),
                    on_message_arrived: Some(Box::new(|topic, payload, qos, retained, dup| {
                        println!(
                            "{} qos={:?} retained={retained} dup={dup}: {}",
                            topic.as_str(),
                            qos,
                            String::from_utf8_lossy(payload)
                        );
                        true
                    })),
                    on_delivery_complete: None,
                })
                .await?;
            connect(&client, 60).await?;
            let qos = parse_qos(qos)?;
            let token = client.subscribe(&topic, qos).await?;
            let outcome = client.wait_for_completion(token, Duration::from_secs(30)).await?;
            println!("subscribed: {outcome:?}");

            println!("listening for messages on `{topic}`, press ctrl-c to stop");
            let _ = tokio::signal::ctrl_c().await;
            disconnect(&client).await?;
            client.destroy().await?;
        }
    }

    Ok(())
}

async fn connect<T: mqtt_client::Transport>(client: &Client<T>, keep_alive_secs: u64) -> Result<(), mqtt_client::ClientError> {
    let token = client
        .connect(ConnectOptions {
            keep_alive_secs,
            ..Default::default()
        })
        .await?;
    client.wait_for_completion(token, Duration::from_secs(30)).await?;
    Ok(())
}

async fn disconnect<T: mqtt_client::Transport>(client: &Client<T>) -> Result<(), mqtt_client::ClientError> {
    let token = client.disconnect(DisconnectOptions::default()).await?;
    client.wait_for_completion(token, Duration::from_secs(10)).await?;
    Ok(())
}

fn parse_qos(raw: u8) -> Result<QosLevel, mqtt_client::ClientError> {
    QosLevel::try_from(raw).map_err(|err| {
        mqtt_client::ClientError::new(mqtt_client::ClientErrorKind::InvalidArgument, err.message().to_string())
    })
}
