use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roombook::auth::{LoginThrottle, Roles, RoomBookStartupHandler};
use roombook::clock::SystemClock;
use roombook::engine::Engine;
use roombook::wire::{self, RoomBookFactory};

const MAX_FAILED_LOGINS: u32 = 3;

fn password_of(user: &str) -> String {
    format!("{user}-secret")
}

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roombook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("rooms.wal"), Arc::new(SystemClock), Tz::UTC).unwrap());
    let users: HashMap<String, String> = ["admin", "alice", "bob"]
        .into_iter()
        .map(String::from)
        .chain((0..8).map(|i| format!("user{i}")))
        .map(|u| {
            let password = password_of(&u);
            (u, password)
        })
        .collect();
    let auth = RoomBookStartupHandler::new(
        users,
        LoginThrottle::new(MAX_FAILED_LOGINS, Duration::from_secs(60)),
    );
    let factory = Arc::new(RoomBookFactory::new(engine, Roles::new(["admin"]), auth));

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

    addr
}

async fn connect_as(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roombook")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    connect_as(addr, user, &password_of(user)).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Far enough ahead that the wall clock never catches up.
fn at(d: u32, h: u32) -> i64 {
    Utc.with_ymd_and_hms(2099, 1, d, h, 0, 0)
        .unwrap()
        .timestamp_millis()
}

async fn create_room(admin: &Client, name: &str) -> Ulid {
    let id = Ulid::new();
    admin
        .simple_query(&format!(
            "INSERT INTO rooms (id, name, capacity, equipment) VALUES ('{id}', '{name}', 8, 'projector, whiteboard')"
        ))
        .await
        .unwrap();
    id
}

fn reserve_sql(id: Ulid, room: Ulid, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{id}', '{room}', {start}, {end})"#)
}

// ── Tests ────────────────────────────────────────────────────

fn error_code(err: &tokio_postgres::Error) -> String {
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let addr = start_test_server().await;
    let err = connect_as(addr, "alice", "nope").await.unwrap_err();
    assert_eq!(error_code(&err), "28P01");
    let err = connect_as(addr, "mallory", "anything").await.unwrap_err();
    assert_eq!(error_code(&err), "28P01");
}

#[tokio::test]
async fn member_cannot_log_in_as_someone_else() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let room = create_room(&admin, "Aurora").await;

    // alice's own password opens neither the admin account nor bob's.
    assert!(connect_as(addr, "admin", &password_of("alice")).await.is_err());
    assert!(connect_as(addr, "bob", &password_of("alice")).await.is_err());

    let bob = connect(addr, "bob").await;
    let id = Ulid::new();
    bob.simple_query(&reserve_sql(id, room, at(15, 10), at(15, 11)))
        .await
        .unwrap();
    let alice = connect(addr, "alice").await;
    let cancel = format!("DELETE FROM reservations WHERE id = '{id}'");
    assert_eq!(sqlstate(&alice, &cancel).await, "42501");
}

#[tokio::test]
async fn repeated_failures_lock_the_login() {
    let addr = start_test_server().await;
    for _ in 0..MAX_FAILED_LOGINS {
        let err = connect_as(addr, "alice", "guess").await.unwrap_err();
        assert_eq!(error_code(&err), "28P01");
    }

    // Even the right password is refused while locked.
    let err = connect_as(addr, "alice", &password_of("alice")).await.unwrap_err();
    assert_eq!(error_code(&err), "28000");
    let message = err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default();
    assert!(message.contains("too many failed login attempts"), "{message}");

    // Other logins are unaffected.
    connect(addr, "bob").await;
}

#[tokio::test]
async fn rooms_roundtrip() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let id = create_room(&admin, "Aurora").await;

    let listed = rows(&admin, "SELECT * FROM rooms").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(listed[0].get("name"), Some("Aurora"));
    assert_eq!(listed[0].get("capacity"), Some("8"));
    assert_eq!(listed[0].get("equipment"), Some(r#"["projector","whiteboard"]"#));

    let one = rows(&admin, &format!("SELECT * FROM rooms WHERE id = '{id}'")).await;
    assert_eq!(one.len(), 1);

    admin
        .simple_query(&format!("DELETE FROM rooms WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(rows(&admin, "SELECT * FROM rooms").await.is_empty());
    assert_eq!(
        sqlstate(&admin, &format!("SELECT * FROM rooms WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn members_cannot_create_rooms() {
    let addr = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let sql = format!("INSERT INTO rooms (id, name) VALUES ('{}', 'Aurora')", Ulid::new());
    assert_eq!(sqlstate(&alice, &sql).await, "42501");
}

#[tokio::test]
async fn booked_day_end_to_end() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let room = create_room(&admin, "Aurora").await;

    alice
        .simple_query(&reserve_sql(Ulid::new(), room, at(15, 10), at(15, 12)))
        .await
        .unwrap();

    let free = rows(
        &alice,
        &format!("SELECT * FROM availability WHERE room_id = '{room}' AND date = '2099-01-15'"),
    )
    .await;
    let spans: Vec<(String, String)> = free
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect();
    assert_eq!(
        spans,
        vec![
            (at(15, 0).to_string(), at(15, 10).to_string()),
            (at(15, 12).to_string(), (at(16, 0) - 1).to_string()),
        ]
    );
    assert_eq!(free[0].get("message"), None);

    let overlapping = reserve_sql(Ulid::new(), room, at(15, 11), at(15, 13));
    assert_eq!(sqlstate(&alice, &overlapping).await, "23P01");

    let check = rows(
        &alice,
        &format!(
            r#"SELECT * FROM reservation_check WHERE room_id = '{room}' AND start = {} AND "end" = {}"#,
            at(15, 11),
            at(15, 13)
        ),
    )
    .await;
    assert_eq!(check[0].get("accepted"), Some("f"));
    assert_eq!(check[0].get("reason"), Some("Conflict"));
}

#[tokio::test]
async fn empty_day_carries_message() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let room = create_room(&admin, "Aurora").await;

    let free = rows(
        &admin,
        &format!("SELECT * FROM availability WHERE room_id = '{room}' AND date = {}", at(20, 9)),
    )
    .await;
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get("start"), Some(at(20, 0).to_string().as_str()));
    assert_eq!(free[0].get("message"), Some("room is available all day"));
}

#[tokio::test]
async fn invalid_ranges_and_unknown_rooms() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let room = create_room(&admin, "Aurora").await;

    let inverted = reserve_sql(Ulid::new(), room, at(15, 12), at(15, 10));
    assert_eq!(sqlstate(&alice, &inverted).await, "22023");

    let past = reserve_sql(Ulid::new(), room, 1_000, 2_000);
    assert_eq!(sqlstate(&alice, &past).await, "22023");

    let nowhere = reserve_sql(Ulid::new(), Ulid::new(), at(15, 10), at(15, 11));
    assert_eq!(sqlstate(&alice, &nowhere).await, "P0002");

    assert_eq!(sqlstate(&alice, "SELECT * FROM bookings").await, "42601");
}

#[tokio::test]
async fn owner_cancels_and_others_cannot() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;
    let room = create_room(&admin, "Aurora").await;

    let id = Ulid::new();
    alice
        .simple_query(&reserve_sql(id, room, at(15, 10), at(15, 11)))
        .await
        .unwrap();

    let listed = rows(&bob, &format!("SELECT * FROM reservations WHERE room_id = '{room}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("user"), Some("alice"));
    assert_eq!(listed[0].get("status"), Some("confirmed"));

    let cancel = format!("DELETE FROM reservations WHERE id = '{id}'");
    assert_eq!(sqlstate(&bob, &cancel).await, "42501");
    alice.simple_query(&cancel).await.unwrap();
    assert!(rows(&bob, &format!("SELECT * FROM reservations WHERE room_id = '{room}'"))
        .await
        .is_empty());
}

#[tokio::test]
async fn extended_protocol_insert() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let room = create_room(&admin, "Aurora").await;

    let id = Ulid::new().to_string();
    let room_str = room.to_string();
    let start = at(15, 10).to_string();
    let end = at(15, 11).to_string();
    let inserted = admin
        .execute(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ($1, $2, $3, $4)"#,
            &[&id, &room_str, &start, &end],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = rows(&admin, &format!("SELECT * FROM reservations WHERE room_id = '{room}'")).await;
    assert_eq!(listed[0].get("id"), Some(id.as_str()));
}

#[tokio::test]
async fn huge_placeholder_index_is_refused() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let err = admin
        .prepare("SELECT * FROM reservations WHERE room_id = $3000000000")
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "42601");

    // The connection stays usable.
    assert!(rows(&admin, "SELECT * FROM rooms").await.is_empty());
}

#[tokio::test]
async fn concurrent_clients_book_one_slot_once() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let room = create_room(&admin, "Aurora").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &format!("user{i}")).await;
            client
                .simple_query(&reserve_sql(Ulid::new(), room, at(15, 10), at(15, 12)))
                .await
                .is_ok()
        }));
    }
    let mut accepted = 0;
    for h in handles {
        if h.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
}
