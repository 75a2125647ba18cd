use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotbook::auth::SlotbookAuthSource;
use slotbook::clock::ManualClock;
use slotbook::config::BookingPolicy;
use slotbook::engine::Engine;
use slotbook::model::*;
use slotbook::wire::{self, SlotbookFactory};

/// 2025-06-01T00:00:00Z.
const NOW: Ms = 1_748_736_000_000;
const SLOT: Ms = 30 * MINUTE_MS;
const DAY4_10: Ms = NOW + 4 * DAY_MS + 10 * HOUR_MS;

const CUSTOMER_PASSWORD: &str = "slotbook";
const ADMIN_USER: &str = "admin";
const ADMIN_PASSWORD: &str = "admin-secret";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(capacity: u32) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let policy = BookingPolicy {
        grid: GridSpec {
            horizon: Span::new(NOW, NOW + 10 * DAY_MS),
            slot_len: SLOT,
            capacity,
        },
        min_advance: 3 * DAY_MS,
    };
    let engine = Arc::new(Engine::open(&dir, policy, Arc::new(ManualClock::new(NOW))).unwrap());

    let auth = SlotbookAuthSource::new(
        CUSTOMER_PASSWORD.to_string(),
        ADMIN_USER.to_string(),
        ADMIN_PASSWORD.to_string(),
    );
    let factory = Arc::new(SlotbookFactory::new(engine.clone(), auth, ADMIN_USER.to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_as(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    Ok(client)
}

async fn customer(addr: SocketAddr) -> Client {
    connect_as(addr, "alice", CUSTOMER_PASSWORD).await.unwrap()
}

async fn admin(addr: SocketAddr) -> Client {
    connect_as(addr, ADMIN_USER, ADMIN_PASSWORD).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Result<Vec<SimpleQueryRow>, tokio_postgres::Error> {
    Ok(client
        .simple_query(sql)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect())
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.code().map(|c| c.code()).unwrap_or("")
}

/// Create a reservation and return its id from the confirmation row.
async fn reserve(client: &Client, customer_id: u64, start: Ms, end: Ms, participants: u32) -> String {
    let result = rows(
        client,
        &format!(
            r#"INSERT INTO reservations (customer_id, start, "end", participants) VALUES ({customer_id}, {start}, {end}, {participants})"#
        ),
    )
    .await
    .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].get("message"), Some("reservation requested"));
    result[0].get("id").unwrap().to_string()
}

async fn slot_remaining(client: &Client, start: Ms) -> i64 {
    let result = rows(
        client,
        &format!(r#"SELECT * FROM slots WHERE start >= {start} AND "end" <= {}"#, start + SLOT),
    )
    .await
    .unwrap();
    assert_eq!(result.len(), 1);
    result[0].get("remaining").unwrap().parse().unwrap()
}

// ── Authentication ───────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _) = start_test_server(10).await;
    assert!(connect_as(addr, "alice", "nope").await.is_err());
    // The customer password does not open an admin session.
    assert!(connect_as(addr, ADMIN_USER, CUSTOMER_PASSWORD).await.is_err());
}

// ── Lifecycle over the wire ──────────────────────────────────

#[tokio::test]
async fn reserve_confirm_and_query() {
    let (addr, engine) = start_test_server(10).await;
    let alice = customer(addr).await;
    let boss = admin(addr).await;

    let id = reserve(&alice, 7, DAY4_10, DAY4_10 + 2 * SLOT, 4).await;
    assert_eq!(slot_remaining(&alice, DAY4_10).await, 10);

    let result = rows(&boss, &format!("UPDATE reservations SET confirmed = true WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(result[0].get("message"), Some("reservation confirmed"));
    assert_eq!(slot_remaining(&alice, DAY4_10).await, 6);
    assert_eq!(slot_remaining(&alice, DAY4_10 + SLOT).await, 6);

    let mine = rows(&alice, "SELECT * FROM reservations WHERE customer_id = 7").await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(id.as_str()));
    assert_eq!(mine[0].get("participants"), Some("4"));
    assert_eq!(mine[0].get("start"), Some(DAY4_10.to_string().as_str()));

    assert_eq!(engine.reservation_count(), 1);
}

#[tokio::test]
async fn availability_skips_lead_time_and_full_slots() {
    let (addr, _) = start_test_server(3).await;
    let alice = customer(addr).await;
    let boss = admin(addr).await;

    let id = reserve(&alice, 1, DAY4_10, DAY4_10 + SLOT, 3).await;
    rows(&boss, &format!("UPDATE reservations SET confirmed = true WHERE id = '{id}'"))
        .await
        .unwrap();

    let open = rows(
        &alice,
        &format!(r#"SELECT * FROM availability WHERE start >= {NOW} AND "end" <= {}"#, NOW + 10 * DAY_MS),
    )
    .await
    .unwrap();
    let starts: Vec<Ms> = open
        .iter()
        .map(|r| r.get("start").unwrap().parse().unwrap())
        .collect();
    assert_eq!(starts.first(), Some(&(NOW + 3 * DAY_MS)));
    assert!(!starts.contains(&DAY4_10));
    assert_eq!(starts.len(), 7 * 48 - 1);
}

#[tokio::test]
async fn dates_are_accepted_as_strings() {
    let (addr, _) = start_test_server(10).await;
    let alice = customer(addr).await;

    // 2025-06-05 10:00 UTC is four days and ten hours after NOW.
    let result = rows(
        &alice,
        r#"INSERT INTO reservations (customer_id, start, "end", participants) VALUES (2, '2025-06-05 10:00:00', '2025-06-05T10:30:00Z', 1)"#,
    )
    .await
    .unwrap();
    assert_eq!(result.len(), 1);

    let listed = rows(&alice, "SELECT * FROM reservations WHERE customer_id = 2").await.unwrap();
    assert_eq!(listed[0].get("start"), Some(DAY4_10.to_string().as_str()));
}

#[tokio::test]
async fn owner_edit_and_delete() {
    let (addr, _) = start_test_server(10).await;
    let alice = customer(addr).await;

    let id = reserve(&alice, 5, DAY4_10, DAY4_10 + SLOT, 2).await;

    let result = rows(
        &alice,
        &format!("UPDATE reservations SET participants = 6 WHERE id = '{id}' AND customer_id = 5"),
    )
    .await
    .unwrap();
    assert_eq!(result[0].get("message"), Some("reservation updated"));

    let err = rows(
        &alice,
        &format!("UPDATE reservations SET participants = 1 WHERE id = '{id}' AND customer_id = 6"),
    )
    .await
    .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let err = rows(
        &alice,
        &format!("UPDATE reservations SET participants = 11 WHERE id = '{id}' AND customer_id = 5"),
    )
    .await
    .unwrap_err();
    assert_eq!(sqlstate(&err), "53400");

    let listed = rows(&alice, "SELECT * FROM reservations WHERE customer_id = 5").await.unwrap();
    assert_eq!(listed[0].get("participants"), Some("6"));

    let result = rows(&alice, &format!("DELETE FROM reservations WHERE id = '{id}' AND customer_id = 5"))
        .await
        .unwrap();
    assert_eq!(result[0].get("message"), Some("reservation deleted"));
    assert!(rows(&alice, "SELECT * FROM reservations WHERE customer_id = 5")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn error_codes_follow_error_kind() {
    let (addr, _) = start_test_server(10).await;
    let alice = customer(addr).await;
    let boss = admin(addr).await;

    // Inside the lead time.
    let err = rows(
        &alice,
        &format!(
            r#"INSERT INTO reservations (customer_id, start, "end", participants) VALUES (1, {}, {}, 1)"#,
            NOW + DAY_MS,
            NOW + DAY_MS + SLOT
        ),
    )
    .await
    .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    // Owner cannot delete once confirmed.
    let id = reserve(&alice, 1, DAY4_10, DAY4_10 + SLOT, 1).await;
    rows(&boss, &format!("UPDATE reservations SET confirmed = true WHERE id = '{id}'"))
        .await
        .unwrap();
    let err = rows(&alice, &format!("DELETE FROM reservations WHERE id = '{id}' AND customer_id = 1"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    let err = rows(&boss, &format!("DELETE FROM reservations WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "02000");

    let err = rows(&alice, "SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn admin_only_statements_need_an_admin_session() {
    let (addr, _) = start_test_server(10).await;
    let alice = customer(addr).await;
    let boss = admin(addr).await;

    let id = reserve(&alice, 1, DAY4_10, DAY4_10 + SLOT, 1).await;

    for sql in [
        "SELECT * FROM reservations".to_string(),
        format!("UPDATE reservations SET confirmed = true WHERE id = '{id}'"),
        format!("UPDATE reservations SET participants = 2 WHERE id = '{id}'"),
        format!("DELETE FROM reservations WHERE id = '{id}'"),
    ] {
        let err = rows(&alice, &sql).await.unwrap_err();
        assert_eq!(sqlstate(&err), "42501", "{sql}");
    }

    assert_eq!(rows(&boss, "SELECT * FROM reservations").await.unwrap().len(), 1);
    rows(&boss, &format!("UPDATE reservations SET participants = 2 WHERE id = '{id}'"))
        .await
        .unwrap();
}

/// Preserved as-is: admin delete of a confirmed reservation leaves its
/// capacity consumed.
#[tokio::test]
async fn admin_delete_of_confirmed_does_not_restore_capacity() {
    let (addr, _) = start_test_server(10).await;
    let alice = customer(addr).await;
    let boss = admin(addr).await;

    let id = reserve(&alice, 1, DAY4_10, DAY4_10 + SLOT, 4).await;
    rows(&boss, &format!("UPDATE reservations SET confirmed = true WHERE id = '{id}'"))
        .await
        .unwrap();
    let result = rows(&boss, &format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(result[0].get("message"), Some("reservation deleted"));
    assert_eq!(slot_remaining(&alice, DAY4_10).await, 6);
}

#[tokio::test]
async fn concurrent_confirms_across_sessions() {
    let (addr, _) = start_test_server(10).await;
    let alice = customer(addr).await;

    let mut ids = Vec::new();
    for customer_id in 0..6 {
        ids.push(reserve(&alice, customer_id, DAY4_10, DAY4_10 + SLOT, 4).await);
    }

    let mut handles = Vec::new();
    for id in ids {
        handles.push(tokio::spawn(async move {
            let boss = admin(addr).await;
            rows(&boss, &format!("UPDATE reservations SET confirmed = true WHERE id = '{id}'"))
                .await
                .map(|_| ())
                .map_err(|e| sqlstate(&e).to_string())
        }));
    }

    let mut confirmed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => confirmed += 1,
            Err(code) => assert_eq!(code, "53400"),
        }
    }
    assert_eq!(confirmed, 2);
    assert_eq!(slot_remaining(&alice, DAY4_10).await, 2);
}
