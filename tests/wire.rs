use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use jamroom::config::BookingPolicy;
use jamroom::tenant::TenantManager;
use jamroom::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("jamroom_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        Duration::from_secs(3600),
        BookingPolicy::default(),
    ));

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "jamroom".to_string(), None).await;
            });
        }
    });

    addr
}

/// Everything the server pushes outside of query results.
enum Pushed {
    Notification(Notification),
    Notice(String),
}

async fn connect(addr: SocketAddr, dbname: &str) -> (Client, mpsc::UnboundedReceiver<Pushed>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("frontdesk")
        .password("jamroom");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            let pushed = match msg {
                Ok(AsyncMessage::Notification(n)) => Pushed::Notification(n),
                Ok(AsyncMessage::Notice(notice)) => Pushed::Notice(notice.message().to_string()),
                Ok(_) => continue,
                Err(_) => break,
            };
            let _ = tx.send(pushed);
        }
    });

    (client, rx)
}

async fn next_notification(rx: &mut mpsc::UnboundedReceiver<Pushed>) -> Option<Notification> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.ok()?? {
            Pushed::Notification(n) => return Some(n),
            Pushed::Notice(_) => continue,
        }
    }
}

fn drain_notices(rx: &mut mpsc::UnboundedReceiver<Pushed>) -> Vec<String> {
    let mut notices = Vec::new();
    while let Ok(pushed) = rx.try_recv() {
        if let Pushed::Notice(message) = pushed {
            notices.push(message);
        }
    }
    notices
}

async fn rows(client: &Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
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

/// RFC 3339 bounds of a slot `days` out at `hour`:00 UTC.
fn slot(days: i64, hour: u32, hours: u32) -> (String, String) {
    let day = (Utc::now() + TimeDelta::days(days)).format("%Y-%m-%d");
    (
        format!("{day}T{hour:02}:00:00Z"),
        format!("{day}T{:02}:00:00Z", hour + hours),
    )
}

fn book_sql(id: Ulid, user: Ulid, (start, end): &(String, String)) -> String {
    format!(
        r#"INSERT INTO reservations (id, user_id, start, "end") VALUES ('{id}', '{user}', '{start}', '{end}')"#
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.code()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_read_back() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;

    let (id, user) = (Ulid::new(), Ulid::new());
    client.batch_execute(&book_sql(id, user, &slot(10, 18, 2))).await.unwrap();

    let found = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("user_id"), Some(user.to_string().as_str()));
    assert_eq!(found[0].get("status"), Some("scheduled"));
    assert_eq!(found[0].get("cost"), Some("30.00"));
    assert_eq!(found[0].get("series_id"), None);

    let charges = rows(&client, &format!("SELECT * FROM charges WHERE reservation_id = '{id}'")).await;
    assert_eq!(charges[0].get("status"), Some("pending"));

    client
        .batch_execute(&format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{id}'"))
        .await
        .unwrap();
    let found = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(found[0].get("status"), Some("confirmed"));
}

#[tokio::test]
async fn overlapping_booking_reports_blockers() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;

    let first = Ulid::new();
    client.batch_execute(&book_sql(first, Ulid::new(), &slot(10, 18, 2))).await.unwrap();

    let err = client
        .batch_execute(&book_sql(Ulid::new(), Ulid::new(), &slot(10, 19, 2)))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::EXCLUSION_VIOLATION));
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains(&first.to_string()), "{message}");

    let (start, end) = slot(10, 17, 4);
    let conflicts = rows(
        &client,
        &format!(r#"SELECT * FROM conflicts WHERE start = '{start}' AND "end" = '{end}'"#),
    )
    .await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].get("kind"), Some("reservation"));
    assert_eq!(conflicts[0].get("id"), Some(first.to_string().as_str()));
}

#[tokio::test]
async fn credits_flow_through_the_ledger() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;
    let user = Ulid::new();

    client
        .batch_execute(&format!(
            "INSERT INTO credit_transactions (user_id, credit_type, amount, description) VALUES ('{user}', 'free_hours', 2, 'welcome')"
        ))
        .await
        .unwrap();

    let (start, end) = slot(10, 18, 2);
    let quote = rows(
        &client,
        &format!(r#"SELECT * FROM cost WHERE user_id = '{user}' AND start = '{start}' AND "end" = '{end}'"#),
    )
    .await;
    assert_eq!(quote[0].get("free_blocks"), Some("2"));
    assert_eq!(quote[0].get("cost"), Some("15.00"));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO credit_transactions (user_id, credit_type, amount) VALUES ('{user}', 'free_hours', -5)"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::CHECK_VIOLATION));

    client.batch_execute(&book_sql(Ulid::new(), user, &(start, end))).await.unwrap();
    let balances = rows(&client, &format!("SELECT * FROM credit_balances WHERE user_id = '{user}'")).await;
    let free = balances
        .iter()
        .find(|r| r.get("credit_type") == Some("free_hours"))
        .unwrap();
    assert_eq!(free.get("balance"), Some("0"));

    let txns = rows(
        &client,
        &format!("SELECT * FROM credit_transactions WHERE user_id = '{user}' AND credit_type = 'free_hours'"),
    )
    .await;
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[1].get("source"), Some("reservation_charge"));
    assert_eq!(txns[1].get("amount"), Some("-2"));
}

#[tokio::test]
async fn prepared_statements_bind_parameters() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;
    let user = Ulid::new();
    client.batch_execute(&book_sql(Ulid::new(), user, &slot(10, 18, 2))).await.unwrap();

    let found = client
        .query("SELECT * FROM reservations WHERE user_id = $1", &[&user.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let hours: &str = found[0].get("hours_used");
    assert_eq!(hours, "2");
    let free_blocks: i64 = found[0].get("free_blocks");
    assert_eq!(free_blocks, 0);
}

#[tokio::test]
async fn bound_values_are_stored_verbatim() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;

    let (id, user) = (Ulid::new(), Ulid::new());
    let (start, end) = slot(10, 18, 2);
    let notes = "bring $1 amp, it's loud";
    client
        .execute(
            r#"INSERT INTO reservations (id, user_id, start, "end", notes) VALUES ($1, $2, $3, $4, $5)"#,
            &[&id.to_string(), &user.to_string(), &start, &end, &notes],
        )
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(found[0].get("notes"), Some(notes));
    assert_eq!(found[0].get("user_id"), Some(user.to_string().as_str()));
}

#[tokio::test]
async fn oversized_placeholder_is_rejected() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;

    let err = client.prepare("SELECT * FROM reservations WHERE user_id = $4294967295").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::UNDEFINED_PARAMETER));

    // the connection is still usable afterwards
    assert!(rows(&client, "SELECT * FROM closures").await.is_empty());
}

#[tokio::test]
async fn listen_delivers_on_next_statement() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr, "north").await;
    let (writer, _wrx) = connect(addr, "north").await;

    let user = Ulid::new();
    listener.batch_execute("LISTEN calendar").await.unwrap();
    listener.batch_execute(&format!("LISTEN user_{user}")).await.unwrap();

    let id = Ulid::new();
    writer.batch_execute(&book_sql(id, user, &slot(10, 18, 2))).await.unwrap();

    listener.simple_query("SELECT * FROM closures").await.unwrap();
    let mut channels = Vec::new();
    for _ in 0..2 {
        let n = next_notification(&mut rx).await.expect("notification");
        assert!(n.payload().contains("ReservationBooked"));
        assert!(n.payload().contains(&id.to_string()));
        channels.push(n.channel().to_string());
    }
    channels.sort();
    assert_eq!(channels, vec!["calendar".to_string(), format!("user_{user}")]);

    listener.batch_execute("UNLISTEN *").await.unwrap();
    writer
        .batch_execute(&book_sql(Ulid::new(), user, &slot(11, 18, 2)))
        .await
        .unwrap();
    listener.simple_query("SELECT * FROM closures").await.unwrap();
    assert!(next_notification(&mut rx).await.is_none());
}

#[tokio::test]
async fn closure_warns_about_overlapped_bookings() {
    let addr = start_test_server().await;
    let (client, mut rx) = connect(addr, "north").await;

    let id = Ulid::new();
    client.batch_execute(&book_sql(id, Ulid::new(), &slot(12, 18, 2))).await.unwrap();
    let (start, end) = slot(12, 9, 13);
    client
        .batch_execute(&format!(
            r#"INSERT INTO closures (start, "end", closure_type, notes) VALUES ('{start}', '{end}', 'maintenance', 'new floor')"#
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let notices = drain_notices(&mut rx);
    assert!(notices.iter().any(|n| n.contains(&id.to_string())), "{notices:?}");

    let closures = rows(&client, "SELECT * FROM closures").await;
    assert_eq!(closures.len(), 1);
    assert_eq!(closures[0].get("closure_type"), Some("maintenance"));
}

#[tokio::test]
async fn spaces_are_isolated_by_database() {
    let addr = start_test_server().await;
    let (north, _) = connect(addr, "north").await;
    let (south, _) = connect(addr, "south").await;

    north.batch_execute(&book_sql(Ulid::new(), Ulid::new(), &slot(10, 18, 2))).await.unwrap();
    south.batch_execute(&book_sql(Ulid::new(), Ulid::new(), &slot(10, 18, 2))).await.unwrap();
    assert_eq!(rows(&north, "SELECT * FROM reservations").await.len(), 1);
    assert_eq!(rows(&south, "SELECT * FROM reservations").await.len(), 1);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "north").await;

    let err = client.batch_execute("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::UNDEFINED_TABLE));

    let err = client
        .batch_execute(&format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));

    let err = client.batch_execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::SYNTAX_ERROR));
}
