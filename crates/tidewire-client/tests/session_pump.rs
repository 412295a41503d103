//! Session-level tests against scripted responses over an in-memory pipe.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::time::Duration;

use support::{MessageScanner, ResponseBuilder};
use tidewire_client::error::Error;
use tidewire_client::{Session, SessionState};
use tidewire_proto::packet::PacketKind;
use tidewire_proto::rpc::RpcParam;
use tidewire_proto::token::{DoneStatus, TokenId};
use tidewire_proto::value::Value;
use tidewire_proto::version::TdsVersion;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tidewire_stream::{IoTransport, TdsLink};

fn session_over(
    pipe_size: usize,
) -> (Session<IoTransport<DuplexStream>>, DuplexStream) {
    let (client, server) = tokio::io::duplex(pipe_size);
    let link = TdsLink::new(IoTransport(client));
    (Session::attach(link, TdsVersion::V7_4), server)
}

fn select_test_20() -> (Vec<(&'static str, tidewire_proto::TypeInfo)>, ResponseBuilder) {
    let columns = vec![
        ("a", ResponseBuilder::nvarchar_type(8)),
        ("b", ResponseBuilder::int_type()),
    ];
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .colmetadata(&columns)
        .row(&columns, &[Value::from("test"), Value::I32(20)])
        .done(TokenId::Done, DoneStatus::COUNT, 1);
    (columns, response)
}

#[tokio::test]
async fn select_row_then_empty_fetch() {
    let (mut session, mut server) = session_over(1 << 16);
    let (_, response) = select_test_20();
    server.write_all(&response.into_packets(4096)).await.unwrap();

    session.submit_plain_query("select 'test', 20").await.unwrap();
    assert!(session.find_result_or_done().await.unwrap());
    assert_eq!(session.columns().len(), 2);
    assert_eq!(session.columns()[0].name, "a");

    assert!(session.next_row().await.unwrap());
    assert_eq!(
        session.take_row().unwrap(),
        vec![Value::from("test"), Value::I32(20)]
    );

    // Advancing past the last row is empty and ends the result set.
    assert!(!session.next_row().await.unwrap());
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.rows_affected(), 1);

    // And stays empty without further reads.
    assert!(!session.next_row().await.unwrap());
}

#[tokio::test]
async fn parsing_is_transparent_to_packet_boundaries() {
    // The same token stream chunked at a tiny block size must decode to
    // the same row.
    for block_size in [64usize, 128, 512, 4096] {
        let (mut session, mut server) = session_over(1 << 16);
        let (_, response) = select_test_20();
        server
            .write_all(&response.into_packets(block_size))
            .await
            .unwrap();

        session.submit_plain_query("select 'test', 20").await.unwrap();
        assert!(session.find_result_or_done().await.unwrap());
        assert!(session.next_row().await.unwrap());
        assert_eq!(
            session.take_row().unwrap(),
            vec![Value::from("test"), Value::I32(20)],
            "block size {block_size}"
        );
        assert!(!session.next_row().await.unwrap());
    }
}

#[tokio::test]
async fn nbcrow_nulls_second_of_three_columns() {
    let (mut session, mut server) = session_over(1 << 16);
    let columns = vec![
        ("x", ResponseBuilder::int_type()),
        ("y", ResponseBuilder::int_type()),
        ("z", ResponseBuilder::int_type()),
    ];
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .colmetadata(&columns)
        .nbcrow(&columns, &[0b010], &[Value::I32(10), Value::I32(30)])
        .done(TokenId::Done, DoneStatus::COUNT, 1);
    server.write_all(&response.into_packets(4096)).await.unwrap();

    session.submit_plain_query("select x, y, z from t").await.unwrap();
    assert!(session.find_result_or_done().await.unwrap());
    assert!(session.next_row().await.unwrap());
    assert_eq!(
        session.take_row().unwrap(),
        vec![Value::I32(10), Value::Null, Value::I32(30)]
    );
}

#[tokio::test]
async fn callproc_with_output_and_two_result_sets() {
    let (mut session, mut server) = session_over(1 << 16);
    let one_int = vec![("", ResponseBuilder::int_type())];
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .colmetadata(&one_int)
        .row(&one_int, &[Value::I32(4)])
        .done(
            TokenId::DoneInProc,
            DoneStatus::MORE | DoneStatus::COUNT,
            1,
        )
        .colmetadata(&one_int)
        .row(&one_int, &[Value::I32(5)])
        .done(
            TokenId::DoneInProc,
            DoneStatus::MORE | DoneStatus::COUNT,
            1,
        )
        .return_status(0)
        .return_value(0, "@A", &Value::I32(3))
        .done(TokenId::DoneProc, DoneStatus::empty(), 0);
    server.write_all(&response.into_packets(4096)).await.unwrap();

    let output = RpcParam::output("@A", Value::I32(1), TdsVersion::V7_4);
    assert!(session.callproc("P", vec![output]).await.unwrap());

    assert!(session.next_row().await.unwrap());
    assert_eq!(session.take_row().unwrap(), vec![Value::I32(4)]);
    assert!(!session.next_row().await.unwrap());

    assert!(session.next_set().await.unwrap());
    assert!(session.next_row().await.unwrap());
    assert_eq!(session.take_row().unwrap(), vec![Value::I32(5)]);

    let outputs = session.get_proc_outputs().await.unwrap();
    assert_eq!(outputs, vec![Value::I32(3)]);
    assert_eq!(session.return_status(), Some(0));

    // Row access fails fast once outputs were read.
    assert!(session.next_row().await.is_err());
}

#[tokio::test]
async fn done_error_raises_last_message_and_elides_3621() {
    let (mut session, mut server) = session_over(1 << 16);
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .server_error(2627, 14, "Violation of PRIMARY KEY constraint")
        .server_error(3621, 0, "The statement has been terminated.")
        .done(TokenId::Done, DoneStatus::ERROR, 0);
    server.write_all(&response.into_packets(4096)).await.unwrap();

    session.submit_plain_query("insert into t values (1)").await.unwrap();
    let err = session.find_result_or_done().await.unwrap_err();
    match err {
        Error::Integrity { number, .. } => assert_eq!(number, 2627),
        other => panic!("expected integrity error, got {other}"),
    }
    // The session survives server-reported errors.
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn cancel_drains_to_the_attention_done() {
    let (mut session, mut server) = session_over(1 << 16);
    let columns = vec![("n", ResponseBuilder::int_type())];
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .colmetadata(&columns)
        .row(&columns, &[Value::I32(1)])
        .done(TokenId::Done, DoneStatus::ATTENTION, 0);
    server.write_all(&response.into_packets(4096)).await.unwrap();

    session.submit_plain_query("select n from big").await.unwrap();
    session.cancel_if_pending().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    // No further rows surface after a cancel.
    assert!(!session.next_row().await.unwrap());

    // The server received the query and then the attention packet.
    drop(session);
    let mut raw = Vec::new();
    server.read_to_end(&mut raw).await.unwrap();
    let mut scanner = MessageScanner::new();
    scanner.push(&raw);
    let (first, _) = scanner.pop_message().expect("query message");
    assert_eq!(first, PacketKind::Query);
    let (second, payload) = scanner.pop_message().expect("cancel message");
    assert_eq!(second, PacketKind::Cancel);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn read_timeout_sends_cancel_and_surfaces_timeout() {
    let (mut session, mut server) = session_over(1 << 16);
    session.set_query_timeout(Some(Duration::from_millis(50)));

    // The server stays silent until it sees the attention packet, then
    // acknowledges the cancellation.
    let server_task = tokio::spawn(async move {
        let mut scanner = MessageScanner::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            scanner.push(&buf[..n]);
            let mut saw_cancel = false;
            while let Some((kind, _)) = scanner.pop_message() {
                if kind == PacketKind::Cancel {
                    saw_cancel = true;
                }
            }
            if saw_cancel {
                break;
            }
        }
        let ack = ResponseBuilder::new(TdsVersion::V7_4)
            .done(TokenId::Done, DoneStatus::ATTENTION, 0)
            .into_packets(4096);
        server.write_all(&ack).await.unwrap();
        server
    });

    session.submit_plain_query("waitfor delay '00:01:00'").await.unwrap();
    let err = session.find_result_or_done().await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(session.state(), SessionState::Idle);

    server_task.await.unwrap();
}

#[tokio::test]
async fn unknown_token_kills_the_session() {
    let (mut session, mut server) = session_over(1 << 16);
    let packets = support::frame_message(PacketKind::Reply, &[0x42, 0x00, 0x00], 4096);
    server.write_all(&packets).await.unwrap();

    session.submit_plain_query("select 1").await.unwrap();
    let err = session.find_result_or_done().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Dead);

    // A dead session refuses further work.
    assert!(session.submit_plain_query("select 1").await.is_err());
}

#[tokio::test]
async fn packet_size_envchange_resizes_the_writer() {
    let (mut session, mut server) = session_over(1 << 16);
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .env_packet_size(8192)
        .done(TokenId::Done, DoneStatus::empty(), 0);
    server.write_all(&response.into_packets(4096)).await.unwrap();

    session.submit_plain_query("select 1").await.unwrap();
    assert!(!session.find_result_or_done().await.unwrap());

    // Next request is framed with the new block size: a payload larger
    // than 4096 now fits one packet.
    let sql = "x".repeat(3000); // UCS-2 doubles this
    session
        .submit_plain_query(&format!("-- {sql}"))
        .await
        .unwrap();

    drop(session);
    let mut raw = Vec::new();
    server.read_to_end(&mut raw).await.unwrap();
    let mut scanner = MessageScanner::new();
    scanner.push(&raw);
    let _first = scanner.pop_message().expect("first query");
    let (_, payload) = scanner.pop_message().expect("second query");
    assert!(payload.len() > 4096 - 8);
}

#[tokio::test]
async fn executemany_accumulates_rowcounts() {
    let (mut session, mut server) = session_over(1 << 16);
    for _ in 0..3 {
        let response = ResponseBuilder::new(TdsVersion::V7_4)
            .done(TokenId::Done, DoneStatus::COUNT, 2)
            .into_packets(4096);
        server.write_all(&response).await.unwrap();
    }

    let sets = vec![
        tidewire_client::Params::Positional(vec![Value::I32(1)]),
        tidewire_client::Params::Positional(vec![Value::I32(2)]),
        tidewire_client::Params::Positional(vec![Value::I32(3)]),
    ];
    let total = session
        .executemany("insert into t values (%s)", &sets)
        .await
        .unwrap();
    assert_eq!(total, 6);
}

#[tokio::test]
async fn execute_scalar_returns_first_column() {
    let (mut session, mut server) = session_over(1 << 16);
    let columns = vec![("d", ResponseBuilder::int_type())];
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .colmetadata(&columns)
        .row(&columns, &[Value::I32(123)])
        .done(TokenId::Done, DoneStatus::COUNT, 1);
    server.write_all(&response.into_packets(4096)).await.unwrap();

    let scalar = session
        .execute_scalar("select count(*) from t", None)
        .await
        .unwrap();
    assert_eq!(scalar, Some(Value::I32(123)));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn submitting_while_pending_is_an_interface_error() {
    let (mut session, mut server) = session_over(1 << 16);
    let response = ResponseBuilder::new(TdsVersion::V7_4)
        .done(TokenId::Done, DoneStatus::empty(), 0)
        .into_packets(4096);
    server.write_all(&response).await.unwrap();

    session.submit_plain_query("select 1").await.unwrap();
    let err = session.submit_plain_query("select 2").await.unwrap_err();
    assert!(matches!(err, Error::Interface(_)));

    session.drain_response().await.unwrap();
    assert!(session.submit_plain_query("select 2").await.is_ok());
}
