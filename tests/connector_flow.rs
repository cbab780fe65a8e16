use anyhow::anyhow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kafka_connector::broker::BrokerClient;
use kafka_connector::config::{BrokerConfig, Config, ListenerConfig, RetryConfig};
use kafka_connector::{handler_fn, AcknowledgmentToken, ConnectorRunner, Handler, MemoryBroker, MessageHandlers, Record};

fn listener(id: &str, topic: &str, group: &str, handler: &str) -> ListenerConfig {
    ListenerConfig {
        id: Some(id.to_string()),
        topics: vec![topic.to_string()],
        group_id: Some(group.to_string()),
        handler: handler.to_string(),
        forward_to: None,
        auto_start: true,
    }
}

fn base_config() -> Config {
    let mut config = Config::for_service("connector-flow");
    config.broker.default_partitions = 2;
    config.shutdown.timeout_secs = 2;
    config.shutdown.grace_period_secs = 1;
    config.retry = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    };
    config
}

fn collecting(seen: Arc<Mutex<Vec<String>>>) -> Handler {
    handler_fn(move |record: Record, token: AcknowledgmentToken| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(record.value().to_string());
            token.commit()?;
            anyhow::Ok(())
        }
    })
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_shared_group_splits_records_while_other_group_sees_all() {
    let broker = MemoryBroker::new(BrokerConfig {
        default_partitions: 2,
        ..BrokerConfig::default()
    });
    let member_a = Arc::new(Mutex::new(Vec::new()));
    let member_b = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::new(Mutex::new(Vec::new()));

    let mut config = base_config();
    config.listeners = vec![
        listener("group1", "testTopic", "testGroup", "a"),
        listener("group2", "testTopic", "testGroup", "b"),
        listener("audit", "testTopic", "auditGroup", "observer"),
    ];

    let connector = ConnectorRunner::new()
        .with_config(config)
        .with_broker(Arc::new(broker.clone()))
        .add_handler("a", collecting(member_a.clone()))
        .add_handler("b", collecting(member_b.clone()))
        .add_handler("observer", collecting(observer.clone()))
        .start()
        .await
        .unwrap();

    const N: usize = 20;
    for i in 0..N {
        let key = format!("k{}", i);
        connector
            .producer()
            .send_and_wait("testTopic", Some(key.as_str()), format!("m{}", i))
            .await
            .unwrap();
    }

    wait_until(|| {
        member_a.lock().unwrap().len() + member_b.lock().unwrap().len() == N && observer.lock().unwrap().len() == N
    })
    .await;

    let mut shared: Vec<String> = member_a.lock().unwrap().clone();
    shared.extend(member_b.lock().unwrap().iter().cloned());
    shared.sort();
    shared.dedup();
    assert_eq!(shared.len(), N);

    let mut expected: Vec<String> = (0..N).map(|i| format!("m{}", i)).collect();
    expected.sort();
    let mut audited = observer.lock().unwrap().clone();
    audited.sort();
    assert_eq!(audited, expected);
    assert_eq!(shared, expected);

    connector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reply_is_forwarded_to_derivative_topic() {
    let forwarded = Arc::new(Mutex::new(Vec::new()));

    let mut config = base_config();
    config.listeners = vec![
        ListenerConfig {
            forward_to: Some("topic-a".to_string()),
            ..listener("group1", "testTopic", "testGroup", "forward")
        },
        listener("topic-a", "topic-a", "topicAGroup", "sink"),
    ];

    let connector = ConnectorRunner::new()
        .with_config(config)
        .add_handler("forward", MessageHandlers::replying("group1", "forwarded: "))
        .add_handler("sink", collecting(forwarded.clone()))
        .start()
        .await
        .unwrap();

    connector.producer().send_and_wait("testTopic", None, "hello").await.unwrap();
    wait_until(|| !forwarded.lock().unwrap().is_empty()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*forwarded.lock().unwrap(), vec!["forwarded: hello".to_string()]);

    connector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_handler_is_redelivered_and_committed_once() {
    let broker = MemoryBroker::new(BrokerConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let flaky = handler_fn(move |_record: Record, token: AcknowledgmentToken| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt < 3 {
                return Err(anyhow!("transient failure #{}", attempt));
            }
            token.commit()?;
            anyhow::Ok(())
        }
    });

    let mut config = base_config();
    config.broker.default_partitions = 1;
    config.listeners = vec![listener("flaky", "retryTopic", "retryGroup", "flaky")];

    let connector = ConnectorRunner::new()
        .with_config(config)
        .with_broker(Arc::new(broker.clone()))
        .add_handler("flaky", flaky)
        .start()
        .await
        .unwrap();

    let _ = broker.send("retryTopic", None, "payload".to_string()).await.unwrap();
    wait_until(|| broker.committed_offset("retryGroup", "retryTopic", 0) == Some(1)).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let commits = broker
        .commit_log()
        .into_iter()
        .filter(|position| position.group_id == "retryGroup")
        .count();
    assert_eq!(commits, 1);

    connector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scheduled_job_starts_dormant_listener() {
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut config = base_config();
    config.listeners = vec![ListenerConfig {
        auto_start: false,
        ..listener("listener1", "test", "listener1", "print")
    }];
    config.jobs.insert("start_listener1".to_string(), "* * * * * ?".to_string());

    let connector = ConnectorRunner::new()
        .with_config(config)
        .add_handler("print", collecting(received.clone()))
        .add_job("start_listener1", |ctx| async move {
            ctx.registry.start("listener1").await?;
            let mut transaction = ctx.producer.begin();
            transaction.send("test", None, "xxx21");
            transaction.commit().await?;
            anyhow::Ok(())
        })
        .start()
        .await
        .unwrap();

    for _ in 0..500 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connector.registry().is_running("listener1"));
    assert_eq!(received.lock().unwrap()[0], "xxx21");

    connector.shutdown().await.unwrap();
}
