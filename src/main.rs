use anyhow::Result;
use kafka_connector::config::Config;
use kafka_connector::producer::callback;
use kafka_connector::runner::{ConnectorRunner, JobContext, Runner};
use kafka_connector::{utils, MessageHandlers};
use tracing::{error, info};

// Records sent to topic-a every 5 seconds
async fn produce_topic_a(ctx: JobContext) -> Result<()> {
    ctx.producer.send_and_forget("topic-a", None, "xxxxxxxxxxxxxx");
    Ok(())
}

const SEQUENCE: u32 = 20;

// Bring listener1 up on demand, then feed its topic
async fn start_listener1(ctx: JobContext) -> Result<()> {
    ctx.registry.start("listener1").await?;
    info!("🏭 Producing message {}", SEQUENCE);

    let mut transaction = ctx.producer.begin();
    transaction.send("test", None, format!("xxx{}", SEQUENCE + 1));
    transaction.commit().await?;
    Ok(())
}

async fn send_with_callback(ctx: JobContext) -> Result<()> {
    ctx.producer.send_with_callback(
        "xxxxx",
        None,
        "test",
        callback(
            |result| info!("✅ Message sent to {}[{}]@{}", result.topic, result.partition, result.offset),
            |e| error!("❌ Message send failed: {}", e),
        ),
    );
    Ok(())
}

async fn send_blocking(ctx: JobContext) -> Result<()> {
    let timeout = std::time::Duration::from_secs(10);
    if let Err(e) = ctx
        .producer
        .send_and_wait_timeout("xxxxx", None, "test", timeout)
        .await
    {
        error!("❌ Blocking send failed: {}", e);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&path)?;

    utils::initialize_logging(&config.logging);
    utils::display_startup_info(&config);

    ConnectorRunner::new()
        .with_config(config)
        .add_handler("forward", MessageHandlers::replying("group1", "forwarded message: "))
        .add_handler("acknowledge", MessageHandlers::acknowledging("group2"))
        .add_handler("topic-a", MessageHandlers::acknowledging("topic-a"))
        .add_handler("xxxxx", MessageHandlers::acknowledging("xxxxx"))
        .add_handler("print", MessageHandlers::logging_only("listener1"))
        .add_handler("return", MessageHandlers::replying("topic-return", "consumer return:"))
        .add_job("produce_topic_a", produce_topic_a)
        .add_job("start_listener1", start_listener1)
        .add_job("send_with_callback", send_with_callback)
        .add_job("send_blocking", send_blocking)
        .run()
        .await
}
