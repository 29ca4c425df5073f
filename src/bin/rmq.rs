//! rmq CLI: publish to and consume from a Redis message queue.

use std::convert::Infallible;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use redis_message_queue::config::Config;
use redis_message_queue::telemetry::{TelemetryConfig, init_telemetry};
use redis_message_queue::{GracefulInterruptHandler, Interrupt, Message, QueueBuilder};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "rmq", about = "Reliable work queue on Redis lists")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one message
    Publish {
        /// Queue name
        queue: String,
        /// Message payload
        message: String,
        /// Deduplicate on this key instead of the payload
        #[arg(long, conflicts_with = "no_dedup")]
        dedup_key: Option<String>,
        /// Skip deduplication
        #[arg(long)]
        no_dedup: bool,
    },
    /// Print messages as they arrive until interrupted
    Consume {
        /// Queue name
        queue: String,
        /// Keep processed messages in the completed log
        #[arg(long)]
        completed_log: bool,
        /// Keep failed messages in the failed log
        #[arg(long)]
        failed_log: bool,
        /// Stop after the first message
        #[arg(long)]
        once: bool,
        /// Use the blocking client on a worker thread
        #[arg(long)]
        blocking: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "rmq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Publish {
            queue,
            message,
            dedup_key,
            no_dedup,
        } => cmd_publish(&config, queue, message, dedup_key, no_dedup).await,
        Command::Consume {
            queue,
            completed_log,
            failed_log,
            once,
            blocking,
        } => {
            let interrupt = GracefulInterruptHandler::install()?;
            let builder = builder(&config, queue)?
                .completed_queue(completed_log || config.queue.enable_completed_queue)
                .failed_queue(failed_log || config.queue.enable_failed_queue)
                .interrupt(Arc::new(interrupt.clone()));
            if blocking {
                tokio::task::spawn_blocking(move || consume_blocking(builder, interrupt, once))
                    .await?
            } else {
                consume_async(builder, interrupt, once).await
            }
        }
    }
}

fn builder(config: &Config, queue: String) -> anyhow::Result<QueueBuilder> {
    let client = redis::Client::open(config.redis_url.expose_secret())?;
    Ok(QueueBuilder::new(queue)
        .settings(&config.queue)
        .client(client))
}

async fn cmd_publish(
    config: &Config,
    queue: String,
    message: String,
    dedup_key: Option<String>,
    no_dedup: bool,
) -> anyhow::Result<()> {
    let mut builder = builder(config, queue)?;
    if no_dedup {
        builder = builder.deduplication(false);
    }
    let queue = builder.build_async().await?;

    let published = match dedup_key {
        Some(key) => queue.publish_with_dedup_key(&message, &key).await?,
        None => queue.publish(&message).await?,
    };

    if published {
        println!("Published to {}", queue.keys().pending());
    } else {
        println!("Duplicate, not published");
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!("{message}");
}

async fn consume_async(
    builder: QueueBuilder,
    interrupt: GracefulInterruptHandler,
    once: bool,
) -> anyhow::Result<()> {
    let queue = builder.build_async().await?;
    info!(queue = queue.keys().name(), "consuming");

    while !interrupt.is_interrupted() {
        let handled = queue
            .process_message(|message| async move {
                print_message(&message);
                Ok::<_, Infallible>(())
            })
            .await?;
        if handled.is_some() && once {
            break;
        }
    }
    info!("consumer stopped");
    Ok(())
}

fn consume_blocking(
    builder: QueueBuilder,
    interrupt: GracefulInterruptHandler,
    once: bool,
) -> anyhow::Result<()> {
    let mut queue = builder.build()?;
    info!(queue = queue.keys().name(), "consuming");

    while !interrupt.is_interrupted() {
        let handled = queue.process_message(|message| {
            print_message(message);
            Ok::<_, Infallible>(())
        })?;
        if handled.is_some() && once {
            break;
        }
    }
    info!("consumer stopped");
    Ok(())
}
