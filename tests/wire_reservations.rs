use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use tally::engine::Engine;
use tally::notify::NotifyHub;
use tally::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tally_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(dir.join("tally.wal"), notify).unwrap());

    let accept_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let eng = accept_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, eng, "tally".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tally")
        .user("tally")
        .password("tally");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Seed a member with an active subscription granting `allocated` credits
/// of "Pool Access", plus a 4-spot pool lane with a Monday slot.
struct Seeded {
    member: Ulid,
    resource: Ulid,
    slot: Ulid,
}

async fn seed(client: &tokio_postgres::Client, allocated: u32, capacity: u32) -> Seeded {
    let member = Ulid::new();
    let subscription = Ulid::new();
    let resource = Ulid::new();
    let slot = Ulid::new();

    client
        .batch_execute(&format!("INSERT INTO members (id, name) VALUES ('{member}', 'Alice')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions (id, member_id, plan, starts_on, ends_on) \
             VALUES ('{subscription}', '{member}', 'Gold', '2026-01-01', '2026-12-31')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO entitlements (id, subscription_id, benefit, allocated) \
             VALUES ('{}', '{subscription}', 'Pool Access', {allocated})",
            Ulid::new()
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, capacity, benefit) \
             VALUES ('{resource}', 'Lane 1', {capacity}, 'Pool Access')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO slots (id, resource_id, weekday, start, \"end\") \
             VALUES ('{slot}', '{resource}', 'mon', '09:00', '10:00')"
        ))
        .await
        .unwrap();

    Seeded { member, resource, slot }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_list_resources() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let rid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO resources (id, name, capacity) VALUES ('{rid}', 'Gym', 30)"))
        .await
        .unwrap();

    let rows = data_rows(client.simple_query("SELECT * FROM resources").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(rid.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some("Gym"));
}

#[tokio::test]
async fn reservation_returning_carries_receipt() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 3, 4).await;

    let resv = Ulid::new();
    let rows = data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
                 VALUES ('{resv}', '{}', '{}', '{}', '2026-08-10') RETURNING *",
                seeded.member, seeded.resource, seeded.slot
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(resv.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some("Lane 1"));
    assert_eq!(rows[0].get(2), Some("2026-08-10"));
    assert_eq!(rows[0].get(3), Some("09:00:00"));
    assert_eq!(rows[0].get(4), Some("10:00:00"));
    assert_eq!(rows[0].get(5), Some("2"));
}

#[tokio::test]
async fn availability_reflects_bookings_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 3, 4).await;

    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
             VALUES ('{}', '{}', '{}', '{}', '2026-08-10')",
            Ulid::new(),
            seeded.member,
            seeded.resource,
            seeded.slot
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE resource_id = '{}' AND date = '2026-08-10'",
                seeded.resource
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(seeded.slot.to_string().as_str()));
    assert_eq!(rows[0].get(3), Some("1")); // booked_count
    assert_eq!(rows[0].get(4), Some("3")); // available_spots
    assert_eq!(rows[0].get(5), Some("f")); // is_full
}

#[tokio::test]
async fn slot_full_surfaces_as_typed_error() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 3, 1).await;

    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
             VALUES ('{}', '{}', '{}', '{}', '2026-08-10')",
            Ulid::new(),
            seeded.member,
            seeded.resource,
            seeded.slot
        ))
        .await
        .unwrap();

    // A second member races for the same single spot.
    let other = Ulid::new();
    let sub = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO members (id, name) VALUES ('{other}', 'Nia')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions (id, member_id, plan, starts_on, ends_on) \
             VALUES ('{sub}', '{other}', 'Gold', '2026-01-01', '2026-12-31')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO entitlements (id, subscription_id, benefit, allocated) \
             VALUES ('{}', '{sub}', 'Pool Access', 1)",
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
             VALUES ('{}', '{other}', '{}', '{}', '2026-08-10')",
            Ulid::new(),
            seeded.resource,
            seeded.slot
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert!(db_err.message().contains("slot full"), "got: {}", db_err.message());
    assert!(db_err.message().contains('1')); // configured capacity
}

#[tokio::test]
async fn cancel_via_update_refunds_credit() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 2, 4).await;

    let resv = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
             VALUES ('{resv}', '{}', '{}', '{}', '2026-08-10')",
            seeded.member, seeded.resource, seeded.slot
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            "UPDATE reservations SET status = 'cancelled', actor = 'staff:jo', reason = 'illness' \
             WHERE id = '{resv}'"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM ledger WHERE member_id = '{}'", seeded.member))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(1), Some("Pool Access"));
    assert_eq!(rows[0].get(2), Some("2")); // allocated
    assert_eq!(rows[0].get(3), Some("0")); // used, refunded
    assert_eq!(rows[0].get(4), Some("2")); // remaining

    // Double cancel is a typed error
    let err = client
        .batch_execute(&format!("UPDATE reservations SET status = 'cancelled' WHERE id = '{resv}'"))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("already cancelled"));
}

#[tokio::test]
async fn member_reservations_and_calendar_views() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 3, 4).await;

    let resv = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, member_id, resource_id, slot_id, date) \
             VALUES ('{resv}', '{}', '{}', '{}', '2026-08-10')",
            seeded.member, seeded.resource, seeded.slot
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE reservations SET status = 'attended' WHERE id = '{resv}'"))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM reservations WHERE member_id = '{}' AND status = 'attended'",
                seeded.member
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(resv.to_string().as_str()));
    assert_eq!(rows[0].get(7), Some("attended"));

    let rows = data_rows(
        client
            .simple_query(
                "SELECT * FROM calendar WHERE start >= '2026-08-01' AND \"end\" <= '2026-08-31'",
            )
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(2), Some("Alice")); // member identity in staff view
}

#[tokio::test]
async fn listen_on_reservation_channel_is_accepted() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 3, 4).await;

    client
        .batch_execute(&format!("LISTEN reservations_{}", seeded.resource))
        .await
        .unwrap();

    let err = client.batch_execute("LISTEN bogus_channel").await.unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("invalid channel"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let seeded = seed(&client, 3, 4).await;

    // Extended query protocol: $n parameters substituted as text.
    let statement = client
        .prepare("INSERT INTO reservations (id, member_id, resource_id, slot_id, date) VALUES ($1, $2, $3, $4, $5)")
        .await
        .unwrap();
    let resv = Ulid::new().to_string();
    client
        .execute(
            &statement,
            &[
                &resv.as_str(),
                &seeded.member.to_string().as_str(),
                &seeded.resource.to_string().as_str(),
                &seeded.slot.to_string().as_str(),
                &"2026-08-10",
            ],
        )
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE resource_id = '{}' AND date = '2026-08-10'",
                seeded.resource
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get(3), Some("1"));
}
