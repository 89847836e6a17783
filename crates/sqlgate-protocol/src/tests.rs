use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::auth::{password_content, verify_password};
use crate::backend::{write_message, BackendMessage};
use crate::error::ProtocolError;
use crate::framer::{decode_initial, next_initial, Framer, PasswordStyle, MAX_STARTUP_LENGTH};
use crate::messages::{Message, MessageBody};
use crate::statement::StatementTracker;
use crate::types::{stringify, type_name};

fn round_trip_tagged(message: Message) {
    let framer = Framer::new();
    let wire = message.to_bytes();
    let parsed = framer.parse_all(&wire).expect("parse");
    assert_eq!(parsed, vec![message]);
}

#[test]
fn round_trip_simple_frames() {
    round_trip_tagged(Message::terminate());
    round_trip_tagged(Message::sync());
    round_trip_tagged(Message::query("SELECT 1"));
    round_trip_tagged(Message::password(b"md5abcdef0123456789"));
}

#[test]
fn round_trip_extended_query_frames() {
    round_trip_tagged(Message::parse_statement("s1", "SELECT $1, $2", &[23, 25]));
    round_trip_tagged(Message::bind(
        "s1",
        "",
        &[0, 1],
        &[Some(42i32.to_be_bytes().to_vec()), None],
        &[0],
    ));
    round_trip_tagged(Message::execute("s1", 0));
    round_trip_tagged(Message::execute("cursor", 50));
}

#[test]
fn round_trip_startup() {
    let mut params = HashMap::new();
    params.insert("user".to_string(), "alice".to_string());
    params.insert("database".to_string(), "orders".to_string());
    let message = Message::startup(&params);
    let mut buf = BytesMut::from(&message.to_bytes()[..]);
    let parsed = next_initial(&mut buf).expect("parse").expect("complete");
    assert_eq!(parsed, message);
    assert!(buf.is_empty());
}

#[test]
fn round_trip_ssl_request() {
    let message = Message::ssl_request();
    let wire = message.to_bytes();
    let mut buf = BytesMut::from(&wire[..]);
    let parsed = next_initial(&mut buf).expect("parse").expect("complete");
    assert_eq!(parsed, message);
}

#[test]
fn cancel_request_is_decoded() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&16i32.to_be_bytes());
    wire.extend_from_slice(&80877102i32.to_be_bytes());
    wire.extend_from_slice(&4242i32.to_be_bytes());
    wire.extend_from_slice(&7i32.to_be_bytes());
    let parsed = decode_initial(16, &wire[4..]).expect("decode");
    assert_eq!(
        parsed.body,
        MessageBody::CancelRequest {
            pid: 4242,
            secret: 7
        }
    );
}

#[test]
fn unsupported_protocol_version_is_rejected() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&9i32.to_be_bytes());
    wire.extend_from_slice(&12345i32.to_be_bytes());
    wire.push(0);
    let err = decode_initial(9, &wire[4..]).expect_err("reject");
    assert!(matches!(
        err,
        ProtocolError::UnsupportedProtocolVersion(12345)
    ));
}

#[test]
fn unrecognized_tag_passes_through_verbatim() {
    let framer = Framer::new();
    let mut wire = vec![b'D'];
    wire.extend_from_slice(&9i32.to_be_bytes());
    wire.extend_from_slice(b"S");
    wire.extend_from_slice(b"s1\0");
    wire.push(0xff);
    let parsed = framer.parse_all(&wire).expect("parse");
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].body, MessageBody::Other);
    assert_eq!(parsed[0].to_bytes(), wire);
}

#[test]
fn truncated_buffer_is_a_framing_error() {
    let framer = Framer::new();
    let wire = Message::query("SELECT 1").to_bytes();
    let err = framer.parse_all(&wire[..wire.len() - 3]).expect_err("fail");
    assert!(matches!(err, ProtocolError::IncompleteFrame { .. }));
}

#[test]
fn invalid_declared_length_is_a_framing_error() {
    let framer = Framer::new();
    let mut buf = BytesMut::from(&[b'Q', 0x00, 0x00, 0x00, 0x02, 0x00][..]);
    let err = framer.next_message(&mut buf).expect_err("fail");
    assert!(matches!(err, ProtocolError::InvalidLength(2)));
}

#[test]
fn absurd_declared_length_is_rejected_before_buffering() {
    let framer = Framer::new();
    let mut buf = BytesMut::from(&[b'Q', 0x7f, 0xff, 0xff, 0xff, 0x00][..]);
    let err = framer.next_message(&mut buf).expect_err("fail");
    assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));

    let mut startup = BytesMut::new();
    startup.extend_from_slice(&(MAX_STARTUP_LENGTH + 1).to_be_bytes());
    startup.extend_from_slice(&[0u8; 8]);
    let err = next_initial(&mut startup).expect_err("fail");
    assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
}

#[test]
fn partial_frame_completes_after_more_bytes() {
    let framer = Framer::new();
    let wire = Message::query("SELECT version()").to_bytes();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&wire[..7]);
    assert!(framer.next_message(&mut buf).expect("partial").is_none());
    buf.extend_from_slice(&wire[7..]);
    let parsed = framer.next_message(&mut buf).expect("parse").expect("some");
    assert_eq!(parsed.body, MessageBody::Query {
        sql: "SELECT version()".to_string()
    });
    assert!(buf.is_empty());
}

#[test]
fn pipelined_frames_parse_in_order() {
    let framer = Framer::new();
    let mut wire = Message::parse_statement("s1", "SELECT $1", &[23]).to_bytes();
    wire.extend_from_slice(&Message::bind("s1", "", &[], &[Some(vec![0, 0, 0, 1])], &[]).to_bytes());
    wire.extend_from_slice(&Message::execute("s1", 0).to_bytes());
    wire.extend_from_slice(&Message::sync().to_bytes());
    let parsed = framer.parse_all(&wire).expect("parse");
    let tags: Vec<u8> = parsed.iter().map(|m| m.header).collect();
    assert_eq!(tags, vec![b'P', b'B', b'E', b'S']);
}

#[test]
fn sasl_initial_response_is_decoded_in_sasl_phase() {
    let mut framer = Framer::new();
    framer.password_style = PasswordStyle::SaslInitial;
    let message = Message::sasl_initial_response("SCRAM-SHA-256", "n,,n=*,r=clientnonce123");
    let parsed = framer.parse_all(&message.to_bytes()).expect("parse");
    assert_eq!(
        parsed[0].body,
        MessageBody::SaslInitialResponse {
            mechanism: "SCRAM-SHA-256".to_string(),
            client_nonce: "clientnonce123".to_string(),
        }
    );
}

#[test]
fn sasl_proof_is_decoded_in_proof_phase() {
    let mut framer = Framer::new();
    framer.password_style = PasswordStyle::SaslProof;
    let client_final = b"c=biws,r=clientnonceservernonce,p=dGhlcHJvb2Y=";
    let mut wire = vec![b'p'];
    wire.extend_from_slice(&((client_final.len() + 4) as i32).to_be_bytes());
    wire.extend_from_slice(client_final);
    let parsed = framer.parse_all(&wire).expect("parse");
    assert_eq!(
        parsed[0].body,
        MessageBody::SaslResponse {
            proof: "dGhlcHJvb2Y=".to_string()
        }
    );
}

#[test]
fn md5_challenge_is_deterministic() {
    let content = password_content("postgres", "postgres", &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(content, "md568be9ed08db75f318087ab337aaea044");
    assert_eq!(content.len(), 35);
}

#[test]
fn password_verification_accepts_and_rejects() {
    let salt = [0xde, 0xad, 0xbe, 0xef];
    let good = password_content("auditor", "s3cret", &salt);
    assert_eq!(good, "md518a9887bc01b48b292b2c1684cad05c4");
    assert!(verify_password(good.as_bytes(), "auditor", "s3cret", &salt).is_ok());
    let err = verify_password(good.as_bytes(), "auditor", "wrong", &salt).expect_err("reject");
    assert!(matches!(err, ProtocolError::AuthenticationFailed(_)));
}

#[test]
fn statement_lifecycle_interpolates() {
    let mut tracker = StatementTracker::new();
    tracker.on_parse("S1", "SELECT $1", &[23]);
    tracker
        .on_bind("S1", &[0], &[Some(42i32.to_be_bytes().to_vec())])
        .expect("bind");
    let statement = tracker.on_execute("S1").expect("execute");
    assert_eq!(statement.interpolate(), "SELECT '42'");
}

#[test]
fn rebinding_replaces_parameters_only() {
    let mut tracker = StatementTracker::new();
    tracker.on_parse("S1", "SELECT $1", &[23]);
    tracker
        .on_bind("S1", &[0], &[Some(1i32.to_be_bytes().to_vec())])
        .expect("bind");
    tracker
        .on_bind("S1", &[1], &[Some(2i32.to_be_bytes().to_vec())])
        .expect("rebind");
    let statement = tracker.on_execute("S1").expect("execute");
    assert_eq!(statement.query, "SELECT $1");
    assert_eq!(statement.param_type_oids, vec![23]);
    assert_eq!(statement.interpolate(), "SELECT '2'");
}

#[test]
fn multi_digit_placeholders_substitute_independently() {
    let mut tracker = StatementTracker::new();
    let sql = "SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11";
    let oids = vec![25; 11];
    tracker.on_parse("wide", sql, &oids);
    let values: Vec<Option<Vec<u8>>> = (1..=11)
        .map(|i| Some(format!("v{i}").into_bytes()))
        .collect();
    tracker.on_bind("wide", &[0; 11], &values).expect("bind");
    let out = tracker.on_execute("wide").expect("execute").interpolate();
    assert_eq!(
        out,
        "SELECT 'v1', 'v2', 'v3', 'v4', 'v5', 'v6', 'v7', 'v8', 'v9', 'v10', 'v11'"
    );
}

#[test]
fn unknown_statement_is_an_error_not_a_panic() {
    let mut tracker = StatementTracker::new();
    let err = tracker.on_bind("ghost", &[], &[]).expect_err("bind");
    assert!(matches!(err, ProtocolError::UnknownStatement(_)));
    let err = tracker.on_execute("ghost").expect_err("execute");
    assert!(matches!(err, ProtocolError::UnknownStatement(_)));
    assert!(tracker.is_empty());
}

#[test]
fn null_parameter_renders_unquoted() {
    let mut tracker = StatementTracker::new();
    tracker.on_parse("S1", "UPDATE t SET a = $1 WHERE b = $2", &[25, 23]);
    tracker
        .on_bind("S1", &[0, 0], &[None, Some(7i32.to_be_bytes().to_vec())])
        .expect("bind");
    let out = tracker.on_execute("S1").expect("execute").interpolate();
    assert_eq!(out, "UPDATE t SET a = NULL WHERE b = '7'");
}

#[test]
fn out_of_range_placeholder_is_left_alone() {
    let mut tracker = StatementTracker::new();
    tracker.on_parse("S1", "SELECT $1, $2", &[23]);
    tracker
        .on_bind("S1", &[0], &[Some(5i32.to_be_bytes().to_vec())])
        .expect("bind");
    let out = tracker.on_execute("S1").expect("execute").interpolate();
    assert_eq!(out, "SELECT '5', $2");
}

#[test]
fn stringifier_covers_scalar_types() {
    assert_eq!(stringify(16, &[0x01]), "true");
    assert_eq!(stringify(16, &[0x00]), "false");
    assert_eq!(stringify(21, &300i16.to_be_bytes()), "300");
    assert_eq!(stringify(23, &(-7i32).to_be_bytes()), "-7");
    assert_eq!(stringify(20, &i64::MAX.to_be_bytes()), i64::MAX.to_string());
    assert_eq!(stringify(25, b"hello"), "hello");
    assert_eq!(stringify(18, &[b'x']), "x");
    assert_eq!(stringify(26, &88i32.to_be_bytes()), "88");
}

#[test]
fn stringifier_falls_back_to_hex() {
    // unmapped OID
    assert_eq!(stringify(999999, &[0xde, 0xad]), "dead");
    // mapped OID with the wrong byte count must not panic
    assert_eq!(stringify(23, &[0x01, 0x02]), "0102");
    assert!(type_name(999999).is_none());
    assert_eq!(type_name(23), Some("int4"));
}

#[tokio::test]
async fn md5_challenge_wire_layout() {
    let (mut client, mut server) = tokio::io::duplex(64);
    write_message(
        &mut server,
        BackendMessage::AuthenticationMd5Password {
            salt: [1, 2, 3, 4],
        },
    )
    .await
    .expect("write");
    let mut bytes = [0u8; 13];
    client.read_exact(&mut bytes).await.expect("read");
    assert_eq!(bytes[0], b'R');
    assert_eq!(i32::from_be_bytes(bytes[1..5].try_into().unwrap()), 12);
    assert_eq!(i32::from_be_bytes(bytes[5..9].try_into().unwrap()), 5);
    assert_eq!(&bytes[9..13], &[1, 2, 3, 4]);
}

#[tokio::test]
async fn ready_for_query_wire_layout() {
    let (mut client, mut server) = tokio::io::duplex(32);
    write_message(&mut server, BackendMessage::ReadyForQuery)
        .await
        .expect("write");
    let mut bytes = [0u8; 6];
    client.read_exact(&mut bytes).await.expect("read");
    assert_eq!(bytes, [b'Z', 0, 0, 0, 5, b'I']);
}

#[tokio::test]
async fn error_response_carries_code_and_message() {
    let (mut client, mut server) = tokio::io::duplex(256);
    write_message(&mut server, BackendMessage::auth_failure("alice"))
        .await
        .expect("write");
    let mut header = [0u8; 5];
    client.read_exact(&mut header).await.expect("read header");
    assert_eq!(header[0], b'E');
    let length = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; length - 4];
    client.read_exact(&mut payload).await.expect("read payload");
    let text = String::from_utf8_lossy(&payload);
    assert!(text.contains("FATAL"));
    assert!(text.contains("28P01"));
    assert!(text.contains("alice"));
    assert_eq!(*payload.last().unwrap(), 0);
}
