//! Flip-Flop - demo & benchmark in-process
//!
//! Menjalankan producer dan beberapa consumer di thread terpisah. Setiap
//! thread punya mapping sendiri ke segment yang sama, jadi jalurnya identik
//! dengan skenario multi-proses (mutex/condvar process-shared).

use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use flipflop::{ChannelConfig, ChannelError, ChannelOwner, Consumer};

fn main() -> Result<(), ChannelError> {
    flipflop::init_tracing();

    println!("🔁 Flip-Flop Shared Memory Channel - Demo");
    println!("=========================================\n");

    benchmark_round_trip()?;
    benchmark_broadcast(4)?;

    println!("\n✅ All benchmarks complete!");
    println!("\nMulti-process: run flipflop_producer, then flipflop_consumer (x2)");
    Ok(())
}

fn demo_name(tag: &str) -> String {
    format!("/flipflop-demo-{}-{}", tag, std::process::id())
}

fn benchmark_round_trip() -> Result<(), ChannelError> {
    println!("📊 Round Trip (1 producer, 1 consumer, same thread)");
    println!("---------------------------------------------------");

    const ITERATIONS: usize = 100_000;

    let config = ChannelConfig::new(demo_name("rtt")).with_consumers(1);
    let owner = ChannelOwner::replace(config.clone())?;
    let mut producer = owner.producer()?;
    let mut consumer = Consumer::attach(config)?;

    let start = Instant::now();
    for i in 0..ITERATIONS {
        // Payload teks: NUL tidak boleh ada di dalam slot
        let payload = format!("{:010}", i);
        producer.publish(payload.as_bytes())?;
        let received = consumer.recv()?;
        debug_assert_eq!(received.version, i as u64 + 1);
        producer.wait_for_drain()?;
    }
    let duration = start.elapsed();

    let ns = duration.as_nanos() as f64 / ITERATIONS as f64;
    println!("  Operations: {}", ITERATIONS);
    println!("  Publish+recv+drain: {:.2} ns/op ({:.3} μs/op)", ns, ns / 1000.0);
    println!(
        "  Throughput: {:.2} M versions/sec\n",
        ITERATIONS as f64 / duration.as_secs_f64() / 1_000_000.0
    );

    consumer.detach();
    producer.detach();
    owner.destroy()
}

fn benchmark_broadcast(consumers: u32) -> Result<(), ChannelError> {
    println!("📊 Broadcast (1 producer, {} consumer threads)", consumers);
    println!("----------------------------------------------");

    const ITERATIONS: u64 = 20_000;

    let config = ChannelConfig::new(demo_name("bcast"))
        .with_consumers(consumers)
        .with_version_timeout(Some(Duration::from_secs(5)));
    let owner = ChannelOwner::replace(config.clone())?;
    let mut producer = owner.producer()?;

    let ready = Arc::new(Barrier::new(consumers as usize + 1));
    let handles: Vec<_> = (0..consumers)
        .map(|_| {
            let config = config.clone();
            let ready = Arc::clone(&ready);
            thread::spawn(move || -> Result<u64, ChannelError> {
                let mut consumer = Consumer::attach(config)?;
                ready.wait();
                let mut seen = 0;
                while consumer.last_seen_version() < ITERATIONS {
                    consumer.recv()?;
                    seen += 1;
                }
                consumer.detach();
                Ok(seen)
            })
        })
        .collect();

    ready.wait();
    let start = Instant::now();
    for i in 0..ITERATIONS {
        producer.publish_and_drain(format!("{:010}", i).as_bytes())?;
    }
    let duration = start.elapsed();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                let seen = result?;
                println!("  Consumer saw {} versions", seen);
            }
            Err(_) => println!("  ⚠️  consumer thread panicked"),
        }
    }

    let ns = duration.as_nanos() as f64 / ITERATIONS as f64;
    println!("  Versions: {}", ITERATIONS);
    println!("  Publish+drain: {:.2} ns/version ({:.3} μs)", ns, ns / 1000.0);
    println!(
        "  Throughput: {:.2} K versions/sec",
        ITERATIONS as f64 / duration.as_secs_f64() / 1000.0
    );

    producer.detach();
    owner.destroy()
}
