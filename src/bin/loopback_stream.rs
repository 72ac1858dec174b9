use pipe_queue::{LoopbackTransport, Open, QueueConfig, QueueError, Registry, Selector, Transport};
use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const OUT_PIPE: u8 = 0x02;
const IN_PIPE: u8 = 0x82;

fn parse_arg(args: &[String], index: usize, default: usize, name: &str) -> usize {
    match args.get(index) {
        None => default,
        Some(raw) => match raw.parse::<usize>() {
            Ok(value) => value,
            Err(_) => {
                eprintln!("Error: Invalid {} '{}' - must be a number", name, raw);
                std::process::exit(1);
            }
        },
    }
}

/// Write `count` sequence-tagged chunks, collecting write results as we go.
fn produce(registry: &Registry<LoopbackTransport>, queue: pipe_queue::QueueHandle<LoopbackTransport>, chunk_size: usize, count: u64) -> Result<u64, QueueError> {
    let mut queue = Some(queue);
    let mut chunk = vec![0u8; chunk_size];
    let mut written = 0u64;

    for seq in 0..count {
        chunk[..8].copy_from_slice(&seq.to_le_bytes());
        loop {
            let handle = queue.as_ref().ok_or(QueueError::InvalidParameter)?;
            match registry.write(handle, &chunk, false) {
                Ok(()) => break,
                Err(QueueError::Busy) => {
                    written += registry.write_status(&mut queue, true)? as u64;
                }
                Err(e) => return Err(e),
            }
        }
    }

    loop {
        match registry.write_status(&mut queue, true) {
            Ok(bytes) => written += bytes as u64,
            Err(QueueError::NoMoreItems) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Read `count` chunks and count the ones that arrived out of sequence.
fn consume(registry: &Registry<LoopbackTransport>, queue: pipe_queue::QueueHandle<LoopbackTransport>, chunk_size: usize, count: u64) -> Result<u64, QueueError> {
    let mut queue = Some(queue);
    let mut buffer = vec![0u8; chunk_size];
    let mut out_of_order = 0;

    for expected in 0..count {
        let bytes = registry.read(&mut queue, &mut buffer, true)?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buffer[..8]);
        if bytes != chunk_size || u64::from_le_bytes(seq) != expected {
            out_of_order += 1;
        }
    }
    Ok(out_of_order)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format(|buf, record| {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            buf,
            "[{} {}] {}",
            ts,
            record.level(),
            record.args()
        )
    })
    .init();

    let args: Vec<String> = env::args().collect();
    if args.len() > 4 {
        eprintln!("Usage: {} [chunk_size] [capacity] [count]", args[0]);
        eprintln!("Example: {} 1024 8 10000", args[0]);
        std::process::exit(1);
    }
    let chunk_size = parse_arg(&args, 1, 1024, "chunk size");
    let capacity = parse_arg(&args, 2, 8, "capacity");
    let count = parse_arg(&args, 3, 1000, "count") as u64;
    if chunk_size < 8 {
        eprintln!("Error: chunk size must be at least 8 bytes to carry a sequence number");
        std::process::exit(1);
    }

    println!("Pipe queue loopback stream (version {:#010x})", pipe_queue::version());
    println!("Chunk size: {} bytes, capacity: {}, chunks: {}", chunk_size, capacity, count);

    let transport = match LoopbackTransport::open(&Selector::Index(0)) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            eprintln!("✗ Failed to open device: {}", e);
            std::process::exit(1);
        }
    };
    let registry = Arc::new(Registry::new());
    let config = QueueConfig::default().chunk_size(chunk_size).capacity(capacity);

    let (writer, reader) = match (
        registry.create_queue(&transport, OUT_PIPE, config.clone()),
        registry.create_queue(&transport, IN_PIPE, config),
    ) {
        (Ok(writer), Ok(reader)) => (writer, reader),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("✗ Failed to create queues: {}", e);
            registry.shutdown();
            std::process::exit(1);
        }
    };
    println!("✓ Queues created on pipes {} and {}", writer.pipe(), reader.pipe());

    let started = Instant::now();
    let producer = tokio::task::spawn_blocking({
        let registry = registry.clone();
        let writer = writer.clone();
        move || produce(&registry, writer, chunk_size, count)
    });
    let consumer = tokio::task::spawn_blocking({
        let registry = registry.clone();
        let reader = reader.clone();
        move || consume(&registry, reader, chunk_size, count)
    });

    while !(producer.is_finished() && consumer.is_finished()) {
        sleep(Duration::from_millis(500)).await;

        let out = writer.metrics();
        let input = reader.metrics();
        println!(
            "📊 {:?}: written {} chunks ({} bytes), read {} chunks ({} bytes), in flight {}/{}",
            started.elapsed(),
            out.completed,
            out.bytes,
            input.completed,
            input.bytes,
            out.pending + out.write_status,
            input.pending
        );
    }

    let written = producer.await.expect("producer task panicked");
    let out_of_order = consumer.await.expect("consumer task panicked");
    let elapsed = started.elapsed();

    match (written, out_of_order) {
        (Ok(written), Ok(out_of_order)) => {
            let mbps = written as f64 / elapsed.as_secs_f64() / 1_000_000.0;
            println!("\nFinal metrics:");
            println!("  Bytes written: {}", written);
            println!("  Elapsed: {:?} ({:.2} MB/s)", elapsed, mbps);
            println!("  Busy rejections: {}", writer.metrics().busy_rejections);
            println!("  Out of order chunks: {}", out_of_order);
        }
        (Err(e), _) | (_, Err(e)) => eprintln!("✗ Stream failed: {}", e),
    }

    registry.shutdown();
    if let Err(e) = transport.close() {
        eprintln!("Error closing device: {}", e);
    }
    println!("👋 Goodbye!");
}
