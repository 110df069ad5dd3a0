// src/main.rs
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use reliable_rabbitmq::config::{self, ClientConfig};
use reliable_rabbitmq::env::apply_env;
use reliable_rabbitmq::rabbitmq::{
    redact_url, ConnectionManager, Consumer, Delivery, Emitter, ExchangeKind, HandlerResult,
    Producer, RpcClient, RpcServer, Topology, DEFAULT_EVENT_EXCHANGE,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RPC_QUEUE: &str = "rpc_queue";
const TASK_QUEUE: &str = "task_queue";

const USAGE: &str = "Usage: reliable_rabbitmq <command> [args...]

Commands:
  emit-log [message...]             publish to the 'logs' fanout exchange
  receive-logs                      print everything published to 'logs'
  emit-topic <routing_key> [msg...] publish to the 'logs_topic' exchange
  receive-topic <binding_key>...    print 'logs_topic' messages matching the keys
  receive-direct <severity>...      print 'logs_direct' messages for the severities
  emit-severity <severity>          push nine events through the event emitter
  new-task [message...]             queue a task on 'task_queue'
  worker                            process 'task_queue', one second per '.'
  rpc-server                        answer fib(n) requests on 'rpc_queue'
  rpc-client [n]                    request fib(n) (default 30)
  init-config [path]                write a default configuration file";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    if command == "init-config" {
        let path = rest.first().map(String::as_str).unwrap_or(config::CONFIG_FILE_NAME);
        return config::create_default_config_file(Path::new(path));
    }

    let client_config = load_client_config()?;
    info!(url = %redact_url(&client_config.connection.uri), "Starting {}", command);
    let connection = client_config.start_connection();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let result = run(command, rest, &client_config, &connection, cancel).await;

    if let Err(e) = connection.close().await {
        warn!("Failed to close connection: {}", e);
    }
    result
}

async fn run(
    command: &str,
    args: &[String],
    client_config: &ClientConfig,
    connection: &ConnectionManager,
    cancel: CancellationToken,
) -> Result<()> {
    connection
        .wait_for_connection(CONNECT_TIMEOUT)
        .await
        .context("RabbitMQ is not reachable")?;

    match command {
        "emit-log" => {
            let producer = Producer::with_config(connection, client_config.producer_config());
            producer.declare_exchange("logs", ExchangeKind::Fanout).await?;
            let body = body_from(args);
            producer.publish("logs", "", body.as_bytes()).await?;
            info!(" [x] Sent {}", body);
            producer.close().await?;
        }
        "emit-topic" => {
            let (routing_key, words) = args
                .split_first()
                .ok_or_else(|| anyhow!("Usage: emit-topic <routing_key> [message...]"))?;
            let producer = Producer::with_config(connection, client_config.producer_config());
            producer.declare_exchange("logs_topic", ExchangeKind::Topic).await?;
            let body = body_from(words);
            producer.publish("logs_topic", routing_key, body.as_bytes()).await?;
            info!(" [x] Sent {}: {}", routing_key, body);
            producer.close().await?;
        }
        "emit-severity" => {
            let severity = args
                .first()
                .ok_or_else(|| anyhow!("Usage: emit-severity <severity>"))?;
            let emitter = Emitter::with_config(
                connection,
                DEFAULT_EVENT_EXCHANGE,
                client_config.producer_config(),
            )
            .await?;
            for i in 1..10 {
                emitter.push(&format!("[{}] - {}", i, severity), severity).await?;
            }
            emitter.close().await?;
        }
        "new-task" => {
            let producer = Producer::with_config(connection, client_config.producer_config());
            let body = body_from(args);
            producer.publish("", TASK_QUEUE, body.as_bytes()).await?;
            info!(" [x] Sent {}", body);
            producer.close().await?;
        }
        "receive-logs" => {
            let topology = Topology::fanout("logs").with_prefetch(client_config.consumer.prefetch_count);
            Consumer::new(connection)
                .listen(cancel, topology, print_delivery("logs"))
                .await?;
        }
        "receive-topic" => {
            bind_and_print(connection, client_config, cancel, "logs_topic", ExchangeKind::Topic, args)
                .await?;
        }
        "receive-direct" => {
            bind_and_print(connection, client_config, cancel, "logs_direct", ExchangeKind::Direct, args)
                .await?;
        }
        "worker" => {
            let topology = Topology::work_queue(TASK_QUEUE)
                .durable(true)
                .with_prefetch(client_config.consumer.prefetch_count);
            Consumer::new(connection)
                .listen(cancel, topology, work)
                .await?;
        }
        "rpc-server" => {
            RpcServer::new(connection)
                .serve(cancel, RPC_QUEUE, answer_fib)
                .await?;
        }
        "rpc-client" => {
            let n: u32 = match args.first() {
                Some(arg) => arg.parse().with_context(|| format!("Invalid number: {}", arg))?,
                None => 30,
            };
            info!(" [x] Requesting fib({})", n);
            let client = RpcClient::new(connection);
            let reply = client.call("", RPC_QUEUE, n.to_string().as_bytes()).await?;
            info!(" [.] Got {}", String::from_utf8_lossy(&reply));
            client.close().await?;
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
    Ok(())
}

fn load_client_config() -> Result<ClientConfig> {
    let file_config = match config::find_config_file() {
        Ok(path) => config::load_config_from(&path)?,
        Err(e) => {
            debug!("Using default configuration: {}", e);
            ClientConfig::default()
        }
    };
    apply_env(file_config)
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Interrupted, shutting down");
            cancel.cancel();
        }
        Err(e) => error!("Failed to listen for ctrl-c: {}", e),
    }
}

async fn bind_and_print(
    connection: &ConnectionManager,
    client_config: &ClientConfig,
    cancel: CancellationToken,
    exchange: &str,
    kind: ExchangeKind,
    keys: &[String],
) -> Result<()> {
    if keys.is_empty() {
        bail!("Usage: <binding_key>...");
    }

    let consumer = Consumer::new(connection);
    let listeners = keys.iter().map(|key| {
        info!("Binding to key: {}", key);
        let topology = Topology::new(exchange, kind.clone(), "", key)
            .with_prefetch(client_config.consumer.prefetch_count);
        consumer.listen(cancel.clone(), topology, print_delivery(key))
    });

    for (key, result) in keys.iter().zip(join_all(listeners).await) {
        if let Err(e) = result {
            error!("Failed to listen for {}: {}", key, e);
        }
    }
    Ok(())
}

fn print_delivery(
    label: &str,
) -> impl Fn(Delivery) -> futures::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
    let label = label.to_string();
    move |delivery: Delivery| {
        info!(" [x] {}: {}", label, delivery.body_str());
        futures::future::ready(Ok(()))
    }
}

async fn work(delivery: Delivery) -> HandlerResult {
    info!("Received a message: {}", delivery.body_str());
    let dots = delivery.body.iter().filter(|b| **b == b'.').count() as u64;
    tokio::time::sleep(Duration::from_secs(dots)).await;
    info!("Done");
    Ok(())
}

async fn answer_fib(body: Vec<u8>) -> Result<Vec<u8>> {
    let n: u32 = String::from_utf8(body)?
        .trim()
        .parse()
        .context("Failed to convert body to integer")?;
    if n > MAX_FIB {
        bail!("fib({}) does not fit in 64 bits, the largest supported n is {}", n, MAX_FIB);
    }
    info!(" [.] fib({})", n);
    Ok(fib(n).to_string().into_bytes())
}

fn body_from(args: &[String]) -> String {
    if args.is_empty() || args[0].is_empty() {
        "hello".to_string()
    } else {
        args.join(" ")
    }
}

/// Largest n whose Fibonacci number fits in a `u64`.
const MAX_FIB: u32 = 93;

fn fib(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        // b overflows one step past the value returned for MAX_FIB
        (a, b) = (b, a.wrapping_add(b));
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_defaults_to_hello() {
        assert_eq!(body_from(&[]), "hello");
        assert_eq!(body_from(&["".to_string()]), "hello");
        assert_eq!(body_from(&["a".to_string(), "b.".to_string()]), "a b.");
    }

    #[test]
    fn test_fib() {
        assert_eq!(fib(0), 0);
        assert_eq!(fib(1), 1);
        assert_eq!(fib(10), 55);
        assert_eq!(fib(30), 832040);
        assert_eq!(fib(MAX_FIB), 12200160415121876738);
    }

    #[tokio::test]
    async fn test_answer_fib_rejects_out_of_range_requests() {
        assert_eq!(answer_fib(b"10".to_vec()).await.unwrap(), b"55");
        assert_eq!(
            answer_fib(b"93".to_vec()).await.unwrap(),
            b"12200160415121876738"
        );
        assert!(answer_fib(b"94".to_vec()).await.is_err());
        assert!(answer_fib(b"4000000000".to_vec()).await.is_err());
        assert!(answer_fib(b"abc".to_vec()).await.is_err());
    }
}
