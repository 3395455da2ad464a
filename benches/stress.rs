//! Standalone stress harness: points at a running tally server and races
//! reservation traffic at a handful of slots. Run with
//! `cargo bench --bench stress` while `TALLY_HOST`/`TALLY_PORT` are set.

use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("tally")
        .user("tally")
        .password("tally");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Arena {
    resource: Ulid,
    slot: Ulid,
    capacity: u32,
    members: Vec<Ulid>,
}

/// One resource per capacity tier, each with a Monday slot, plus twice as
/// many members as total capacity so SlotFull is actually exercised.
async fn setup(client: &tokio_postgres::Client) -> Vec<Arena> {
    let capacities = [1u32, 2, 5, 10];
    let mut arenas = Vec::new();

    for &capacity in &capacities {
        let resource = Ulid::new();
        let slot = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO resources (id, name, capacity, benefit) \
                 VALUES ('{resource}', 'bench-{capacity}', {capacity}, 'Bench Access')"
            ))
            .await
            .expect("create resource");
        client
            .batch_execute(&format!(
                "INSERT INTO slots (id, resource_id, weekday, start, \"end\") \
                 VALUES ('{slot}', '{resource}', 'mon', '09:00', '10:00')"
            ))
            .await
            .expect("create slot");

        let mut members = Vec::new();
        for i in 0..capacity * 2 {
            let member = Ulid::new();
            let subscription = Ulid::new();
            client
                .batch_execute(&format!(
                    "INSERT INTO members (id, name) VALUES ('{member}', 'bench member {i}')"
                ))
                .await
                .expect("create member");
            client
                .batch_execute(&format!(
                    "INSERT INTO subscriptions (id, member_id, plan, starts_on, ends_on) \
                     VALUES ('{subscription}', '{member}', 'Bench', '2026-01-01', '2026-12-31')"
                ))
                .await
                .expect("create subscription");
            client
                .batch_execute(&format!(
                    "INSERT INTO entitlements (id, subscription_id, benefit, allocated) \
                     VALUES ('{}', '{subscription}', 'Bench Access', 100)",
                    Ulid::new()
                ))
                .await
                .expect("grant entitlement");
            members.push(member);
        }

        arenas.push(Arena { resource, slot, capacity, members });
    }
    arenas
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TALLY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TALLY_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5455);

    println!("stress: connecting to {host}:{port}");
    let admin = connect(&host, port).await;
    let arenas = setup(&admin).await;
    println!("stress: seeded {} arenas", arenas.len());

    // Consecutive Mondays, one date per round.
    let first = chrono::NaiveDate::from_ymd_opt(2026, 8, 10).unwrap();
    let dates: Vec<String> = (0..20)
        .map(|week| (first + chrono::Duration::weeks(week)).to_string())
        .collect();

    for arena in &arenas {
        let mut create_latencies = Vec::new();
        let mut confirmed = 0u32;
        let mut slot_full = 0u32;

        for date in &dates {
            let mut handles = Vec::new();
            for &member in &arena.members {
                let client = connect(&host, port).await;
                let (resource, slot, date) = (arena.resource, arena.slot, date.clone());
                handles.push(tokio::spawn(async move {
                    let start = Instant::now();
                    let result = client
                        .batch_execute(&format!(
                            "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
                             VALUES ('{}', '{member}', '{resource}', '{slot}', '{date}')",
                            Ulid::new()
                        ))
                        .await;
                    (start.elapsed(), result)
                }));
            }

            let mut date_confirmed = 0u32;
            for h in handles {
                let (elapsed, result) = h.await.expect("task panicked");
                create_latencies.push(elapsed);
                match result {
                    Ok(_) => date_confirmed += 1,
                    Err(e) => {
                        let msg = e.as_db_error().map(|d| d.message().to_string()).unwrap_or_default();
                        assert!(msg.contains("slot full"), "unexpected error: {msg}");
                        slot_full += 1;
                    }
                }
            }

            // The whole point: exactly capacity winners per date, never more.
            assert_eq!(date_confirmed, arena.capacity, "capacity ceiling violated");
            confirmed += date_confirmed;
        }

        println!(
            "capacity={}: confirmed={confirmed}, slot_full={slot_full} (expected confirmed={})",
            arena.capacity,
            arena.capacity * dates.len() as u32
        );
        assert_eq!(confirmed, arena.capacity * dates.len() as u32);
        print_latency(&format!("create capacity={}", arena.capacity), &mut create_latencies);
    }

    println!("stress: all capacity ceilings held");
}
