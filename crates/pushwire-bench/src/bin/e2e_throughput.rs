//! End-to-end throughput benchmark for pushwire.
//!
//! Connects Direct clients to a running server, subscribes them all to one
//! topic and has each of them publish into it as fast as it can. Relies on
//! the server relaying client publishes (`[payload] relay = true`).

use pushwire_protocol::{direct, DirectParser};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Barrier;

const SERVER_ADDR: &str = "127.0.0.1:7979";
const TOPIC: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let addr = args.get(2).cloned().unwrap_or_else(|| SERVER_ADDR.to_string());

    println!("pushwire end-to-end throughput benchmark");
    println!("  Server: {} (Direct listener must be enabled)", addr);
    println!();

    run_pubsub_benchmark(num_clients, addr).await;
}

async fn run_pubsub_benchmark(num_clients: usize, addr: String) {
    println!("Pub/Sub benchmark: {} clients", num_clients);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let addr = addr.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &addr, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("Results");
    println!("  Clients:          {:>10}", num_clients);
    println!("  Duration:         {:>10.2}s", elapsed.as_secs_f64());
    println!("  Total messages:   {:>10}", total_messages);
    println!("  Throughput:       {:>10.0} msg/s", msgs_per_sec);
    println!("  Per client:       {:>10.0} msg/s", msgs_per_sec_per_client);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    addr: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    writer
        .write_all(&direct::encode(&format!("uid=bench-{}", client_id)))
        .await?;
    writer
        .write_all(&direct::encode(&format!("subscribe={}", TOPIC)))
        .await?;

    barrier.wait().await;

    let publish = direct::encode(&format!(
        "publish({},%7B%22sender%22%3A%22bench-{}%22%7D)",
        TOPIC, client_id
    ));

    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        let mut parser = DirectParser::new();
        let mut buf = vec![0u8; 65536];
        while let Ok(n) = reader.read(&mut buf).await {
            if n == 0 {
                break;
            }
            let received = parser.push(&buf[..n]).len();
            recv_count.fetch_add(received as u64, Ordering::Relaxed);
        }
    });

    loop {
        if writer.write_all(&publish).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
