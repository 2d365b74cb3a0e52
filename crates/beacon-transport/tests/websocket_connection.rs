#![cfg(feature = "websocket")]

use std::sync::Arc;

use beacon_protocol::{Event, FrameType, RelayMessage};
use beacon_transport::websocket::close_payload;
use beacon_transport::{ClientConnection, RequestInfo};
use futures_util::StreamExt;
use secp256k1::{Keypair, Secp256k1};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Accept one WebSocket client and wrap its write half.
async fn connected_pair() -> (
    Arc<ClientConnection>,
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (sink, _stream) = ws.split();
        let request = RequestInfo::new("/".parse().unwrap(), Default::default(), Some(peer));
        Arc::new(ClientConnection::new(sink, request))
    });

    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    (server.await.unwrap(), client)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_deliver_whole_frames() {
    let (conn, mut client) = connected_pair().await;
    let keys = Keypair::from_seckey_slice(&Secp256k1::new(), &[1u8; 32]).unwrap();

    let producers: Vec<_> = (0..6)
        .map(|p| {
            let conn = conn.clone();
            let event = Event::sign(&keys, 1000 + p, 1, vec![], "x".repeat(2048));
            tokio::spawn(async move {
                for _ in 0..20 {
                    conn.send_event(&format!("sub-{p}"), &event).await.unwrap();
                }
            })
        })
        .collect();

    let mut received = 0;
    while received < 120 {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value[0], "EVENT");
                let sub = value[1].as_str().unwrap();
                let event: Event = serde_json::from_value(value[2].clone()).unwrap();
                assert_eq!(sub, format!("sub-{}", event.created_at - 1000));
                assert!(event.verify().is_ok());
                received += 1;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    for producer in producers {
        producer.await.unwrap();
    }
}

#[tokio::test]
async fn auth_challenge_and_close_reach_the_client() {
    let (conn, mut client) = connected_pair().await;
    assert!(conn.request().remote_addr().is_some());

    conn.write_json(&RelayMessage::auth(conn.challenge()))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Text(text) => {
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value, serde_json::json!(["AUTH", conn.challenge()]));
        }
        other => panic!("unexpected frame {other:?}"),
    }

    conn.write_message(FrameType::Close, close_payload(1000, "done"))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason, "done");
        }
        other => panic!("unexpected frame {other:?}"),
    }
}
