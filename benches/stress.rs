use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const BASE: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
const SLOT: i64 = 30 * 60_000;

const ALWAYS_OPEN: &str = r#"{"workingDays":[
    {"day":"monday","isActive":true,"startTime":"00:00","endTime":"24:00"},
    {"day":"tuesday","isActive":true,"startTime":"00:00","endTime":"24:00"},
    {"day":"wednesday","isActive":true,"startTime":"00:00","endTime":"24:00"},
    {"day":"thursday","isActive":true,"startTime":"00:00","endTime":"24:00"},
    {"day":"friday","isActive":true,"startTime":"00:00","endTime":"24:00"},
    {"day":"saturday","isActive":true,"startTime":"00:00","endTime":"24:00"},
    {"day":"sunday","isActive":true,"startTime":"00:00","endTime":"24:00"}
],"slotDuration":30,"utcOffsetMinutes":0}"#;

async fn connect_db(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("slotkeeper")
        .password("slotkeeper");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Connect to a fresh tenant of its own.
async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    connect_db(host, port, &format!("bench_{}", Ulid::new())).await
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        percentile(latencies, 100.0).as_secs_f64() * 1000.0,
    );
}

/// Provider open around the clock with one 30 minute service.
async fn seed_provider(client: &tokio_postgres::Client) -> (Ulid, Ulid) {
    let pid = Ulid::new();
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO providers (id, name) VALUES ('{pid}', 'bench')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (provider_id, schedule) VALUES ('{pid}', '{ALWAYS_OPEN}')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, provider_id, name, duration) VALUES ('{sid}', '{pid}', 'slot', 30)"
        ))
        .await
        .unwrap();
    (pid, sid)
}

async fn book(
    client: &tokio_postgres::Client,
    pid: Ulid,
    sid: Ulid,
    slot: i64,
) -> Result<(), tokio_postgres::Error> {
    let id = Ulid::new();
    let start = BASE + slot * SLOT;
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (id, provider_id, service_id, start) VALUES ('{id}', '{pid}', '{sid}', {start})"
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (pid, sid) = seed_provider(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, pid, sid, i as i64).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots of one provider. Every slot must be
/// won exactly once.
async fn phase2_contended(host: &str, port: u16) {
    let tenant = format!("bench_{}", Ulid::new());
    let setup = connect_db(host, port, &tenant).await;
    let (pid, sid) = seed_provider(&setup).await;
    drop(setup);

    let n_tasks = 16;
    let n_slots = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let (won, lost) = (won.clone(), lost.clone());
        handles.push(tokio::spawn(async move {
            let client = connect_db(&host, port, &tenant).await;
            for slot in 0..n_slots {
                match book(&client, pid, sid, slot).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots in {:.2}s: {won} won, {lost} rejected",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_slots as usize, "every slot must be booked exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = format!("bench_{}", Ulid::new());
    let setup = connect_db(host, port, &tenant).await;
    let (pid, sid) = seed_provider(&setup).await;
    // Every other slot of the first day is taken
    for slot in (0..48).step_by(2) {
        book(&setup, pid, sid, slot).await.unwrap();
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect_db(&host, port, &tenant).await;
            // Writers book their own later days so they never collide.
            let mut slot = 48 * (w + 1) * 7;
            while !stop.load(Ordering::Relaxed) {
                let _ = book(&client, pid, sid, slot).await;
                slot += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect_db(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM free_slots WHERE provider_id = '{pid}' AND date = '2024-01-01' AND service_id = '{sid}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("free_slots query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (pid, sid) = seed_provider(&client).await;
            for slot in 0..ops_per_conn {
                book(&client, pid, sid, slot).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTKEEPER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTKEEPER_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTKEEPER_PORT");

    println!("=== slotkeeper stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings on one provider");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] free-slot latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
