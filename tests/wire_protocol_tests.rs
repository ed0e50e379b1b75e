mod common;

use common::{MockShards, TestProxy};
use shardproxy::{FieldDescription, ProxyError, ResultSet, ShardError, keyspace_id};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

const INT4_OID: u32 = 23;

fn orders_shards() -> MockShards {
    MockShards::new(|database, sql| {
        if sql.starts_with("SELECT") {
            Ok(vec![ResultSet::with_rows(
                vec![FieldDescription::typed("id", INT4_OID, 4), FieldDescription::text("shard")],
                vec![vec![Some("42".into()), Some(database.to_string())]],
            )])
        } else if sql.contains("VALUES (13") {
            Err(ShardError {
                severity: "ERROR".into(),
                code: "23505".into(),
                message: "duplicate key value violates unique constraint \"orders_pkey\"".into(),
                detail: Some("Key (id)=(13) already exists.".into()),
                constraint: Some("orders_pkey".into()),
                ..ShardError::default()
            }
            .into())
        } else if sql.starts_with("UPDATE") {
            Ok(vec![ResultSet::command(3)])
        } else {
            Ok(vec![ResultSet::command(1)])
        }
    })
}

async fn connect(proxy: &TestProxy) -> (Client, tokio::task::JoinHandle<Result<(), tokio_postgres::Error>>) {
    let (client, connection) = tokio_postgres::connect(&proxy.connection_string(), NoTls)
        .await
        .expect("Failed to connect");
    (client, tokio::spawn(connection))
}

fn rows(messages: &[SimpleQueryMessage]) -> Vec<Vec<Option<String>>> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn affected(messages: &[SimpleQueryMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::CommandComplete(n) => Some(*n),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_select_is_routed_to_owning_shard() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let (client, _conn) = connect(&proxy).await;

    let messages = client
        .simple_query("SELECT * FROM orders WHERE id = 42")
        .await
        .unwrap();

    let owner = proxy.cluster.shard_for_keyspace_id("42").unwrap().name().to_string();
    assert_eq!(rows(&messages), vec![vec![Some("42".to_string()), Some(owner.clone())]]);
    assert_eq!(affected(&messages), vec![1]);
    assert_eq!(
        shards.shard_statements(),
        vec![(owner, "SELECT * FROM orders WHERE id = 42".to_string())]
    );

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_command_tags_and_batches() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let (client, _conn) = connect(&proxy).await;

    let messages = client
        .simple_query("INSERT INTO orders (id, total) VALUES (42, 100)")
        .await
        .unwrap();
    assert_eq!(affected(&messages), vec![1]);

    let messages = client
        .simple_query(
            "UPDATE orders SET total = 5 WHERE id = 7; DELETE FROM orders WHERE id = 8",
        )
        .await
        .unwrap();
    assert_eq!(affected(&messages), vec![3, 1]);

    let executed = shards.shard_statements();
    assert_eq!(executed.len(), 3);
    let id7 = keyspace_id("7");
    let owner = proxy
        .cluster
        .shards()
        .iter()
        .find(|s| s.owns(id7))
        .unwrap()
        .name()
        .to_string();
    assert_eq!(executed[1].0, owner);

    client
        .batch_execute("DELETE FROM orders WHERE id = 1; DELETE FROM orders WHERE id = 2")
        .await
        .unwrap();

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_shard_errors_are_forwarded_verbatim() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let (client, _conn) = connect(&proxy).await;

    let err = client
        .simple_query("INSERT INTO orders (id) VALUES (13)")
        .await
        .unwrap_err();
    let db = err.as_db_error().expect("database error");
    assert_eq!(db.code(), &SqlState::UNIQUE_VIOLATION);
    assert_eq!(db.detail(), Some("Key (id)=(13) already exists."));
    assert_eq!(db.constraint(), Some("orders_pkey"));

    // The session stays usable after an error.
    let messages = client
        .simple_query("SELECT * FROM orders WHERE id = 42")
        .await
        .unwrap();
    assert_eq!(rows(&messages).len(), 1);

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_rejected_statements_never_reach_shards() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let (client, _conn) = connect(&proxy).await;

    for sql in [
        "DELETE FROM orders WHERE id = 42 OR status = 'paid'",
        "UPDATE orders SET id = 43 WHERE id = 42",
        "SELECT * FROM orders",
        "INSERT INTO countries (code) VALUES ('FR')",
        "CREATE TABLE t (id INT)",
        "SELEC broken",
    ] {
        let err = client.simple_query(sql).await.unwrap_err();
        let db = err.as_db_error().expect("database error");
        assert_eq!(db.code(), &SqlState::INTERNAL_ERROR, "{}", sql);
        assert_eq!(db.severity(), "ERROR");
    }
    assert!(shards.shard_statements().is_empty());

    // Reference tables are read from the first shard.
    client.simple_query("SELECT * FROM countries").await.unwrap();
    let first = proxy.cluster.shards()[0].name().to_string();
    assert_eq!(shards.shard_statements()[0].0, first);

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_extended_protocol_is_rejected() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let (client, _conn) = connect(&proxy).await;

    let err = client
        .query("SELECT * FROM orders WHERE id = $1", &[&42i32])
        .await
        .unwrap_err();
    assert!(
        err.as_db_error()
            .unwrap()
            .message()
            .contains("unsupported frontend message")
    );

    let messages = client
        .simple_query("SELECT * FROM orders WHERE id = 42")
        .await
        .unwrap();
    assert_eq!(rows(&messages).len(), 1);

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_ssl_request_is_denied() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;

    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    // SSLRequest, code 80877103
    socket
        .write_all(&[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f])
        .await
        .unwrap();
    assert_eq!(socket.read_u8().await.unwrap(), b'N');

    // Plain startup after the denial
    let mut startup = Vec::new();
    let params = b"user\0alice\0database\0shop\0\0";
    startup.extend_from_slice(&(8 + params.len() as i32).to_be_bytes());
    startup.extend_from_slice(&196_608i32.to_be_bytes());
    startup.extend_from_slice(params);
    socket.write_all(&startup).await.unwrap();
    assert_eq!(socket.read_u8().await.unwrap(), b'R');

    drop(socket);
    proxy.stop().await;
}

async fn read_message(socket: &mut TcpStream) -> (u8, Vec<u8>) {
    let tag = socket.read_u8().await.unwrap();
    let len = socket.read_i32().await.unwrap() as usize;
    let mut body = vec![0; len - 4];
    socket.read_exact(&mut body).await.unwrap();
    (tag, body)
}

async fn raw_startup(proxy: &TestProxy) -> TcpStream {
    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    let params = b"user\0alice\0database\0shop\0\0";
    let mut startup = Vec::new();
    startup.extend_from_slice(&(8 + params.len() as i32).to_be_bytes());
    startup.extend_from_slice(&196_608i32.to_be_bytes());
    startup.extend_from_slice(params);
    socket.write_all(&startup).await.unwrap();
    while read_message(&mut socket).await.0 != b'Z' {}
    socket
}

/// Type OIDs of a RowDescription body
fn column_types(body: &[u8]) -> Vec<(String, u32)> {
    let count = i16::from_be_bytes([body[0], body[1]]) as usize;
    let mut rest = &body[2..];
    let mut columns = Vec::new();
    for _ in 0..count {
        let end = rest.iter().position(|b| *b == 0).unwrap();
        let name = String::from_utf8(rest[..end].to_vec()).unwrap();
        let field = &rest[end + 1..];
        let oid = u32::from_be_bytes([field[6], field[7], field[8], field[9]]);
        columns.push((name, oid));
        rest = &field[18..];
    }
    columns
}

#[tokio::test]
async fn test_column_types_reach_the_client() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let mut socket = raw_startup(&proxy).await;

    let sql = b"SELECT * FROM orders WHERE id = 42\0";
    socket.write_u8(b'Q').await.unwrap();
    socket.write_i32(4 + sql.len() as i32).await.unwrap();
    socket.write_all(sql).await.unwrap();

    let (tag, body) = read_message(&mut socket).await;
    assert_eq!(tag, b'T');
    assert_eq!(
        column_types(&body),
        vec![
            ("id".to_string(), INT4_OID),
            ("shard".to_string(), FieldDescription::TEXT_OID)
        ]
    );
    assert_eq!(read_message(&mut socket).await.0, b'D');
    assert_eq!(read_message(&mut socket).await.0, b'C');
    assert_eq!(read_message(&mut socket).await.0, b'Z');

    drop(socket);
    proxy.stop().await;
}

#[tokio::test]
async fn test_shutdown_sends_fatal_notice() {
    let shards = orders_shards();
    let proxy = TestProxy::start(&shards).await;
    let (client, conn) = connect(&proxy).await;

    client
        .simple_query("SELECT * FROM orders WHERE id = 1")
        .await
        .unwrap();

    proxy.shutdown.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), conn)
        .await
        .expect("connection should end")
        .unwrap();
    let err = outcome.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::ADMIN_SHUTDOWN));
    assert!(client.is_closed());

    proxy.stop().await;
}

#[tokio::test]
async fn test_cluster_rejects_bad_host_lists() {
    let shards = orders_shards();
    let options = shardproxy::ClusterOptions::default();

    let three: Vec<String> = (0..3).map(|i| format!("h{}:5432", i)).collect();
    let err = shardproxy::Cluster::connect("shop", &three, &shards, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ShardCount(3)));

    let bad = vec!["nohostport".to_string()];
    let err = shardproxy::Cluster::connect("shop", &bad, &shards, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::BadHost(_)));
}
