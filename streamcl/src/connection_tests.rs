#![cfg(test)]
use crate::codec::{Codec, ContactHeader, Frame, Message, ShutdownReason};
use crate::config::Config;
use crate::connection::{Command, Connection, ConnectionEvent, Error, Negotiated};
use futures::{SinkExt, StreamExt};
use perigee_bpa::{ContactReason, OutboundBundle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

type Peer = Framed<tokio::io::DuplexStream, Codec>;

fn config() -> Config {
    let mut config = Config::new("dtn://a/".parse().unwrap());
    config.keepalive_interval = 0;
    config
}

fn peer_header(keepalive_interval: u16) -> ContactHeader {
    ContactHeader {
        version: 3,
        segment_ack_enabled: true,
        reactive_frag_enabled: false,
        negative_ack_enabled: false,
        keepalive_interval,
        eid: "dtn://b/".parse().unwrap(),
    }
}

async fn establish(
    config: Config,
    header: ContactHeader,
    active: bool,
) -> (
    tokio::sync::mpsc::Sender<Command>,
    tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    Peer,
    Negotiated,
) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(8);
    let (evt_tx, evt_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut peer = Framed::new(server, Codec::default());

    let (conn, _) = tokio::join!(
        Connection::start(client, config, active, cmd_rx, evt_tx),
        async {
            peer.send(Frame::ContactHeader(header)).await.unwrap();
            assert!(matches!(
                peer.next().await,
                Some(Ok(Frame::ContactHeader(_)))
            ));
        }
    );
    let conn = conn.unwrap();
    let negotiated = conn.negotiated().clone();
    tokio::spawn(conn.run());
    (cmd_tx, evt_rx, peer, negotiated)
}

async fn next_msg(peer: &mut Peer) -> Message {
    match peer.next().await {
        Some(Ok(Frame::Message(msg))) => msg,
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn sender_segments_with_start_end_flags_and_completes_on_acks() {
    let mut config = config();
    config.segment_length = 4;
    let (cmd_tx, mut evt_rx, mut peer, _) = establish(config, peer_header(0), true).await;

    cmd_tx
        .send(Command::SendBundle(OutboundBundle {
            id: 1,
            bytes: Bytes::from_static(b"ABCDEFG"),
        }))
        .await
        .unwrap();

    assert_eq!(
        next_msg(&mut peer).await,
        Message::DataSegment {
            start: true,
            end: false,
            data: Bytes::from_static(b"ABCD"),
        }
    );
    assert_eq!(
        next_msg(&mut peer).await,
        Message::DataSegment {
            start: false,
            end: true,
            data: Bytes::from_static(b"EFG"),
        }
    );

    peer.send(Frame::Message(Message::AckSegment { acked: 4 }))
        .await
        .unwrap();
    peer.send(Frame::Message(Message::AckSegment { acked: 7 }))
        .await
        .unwrap();

    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 1 }));
}

#[tokio::test]
async fn single_segment_bundle_carries_both_flags() {
    let mut config = config();
    config.segment_length = 64;
    let (cmd_tx, mut evt_rx, mut peer, _) = establish(config, peer_header(0), true).await;

    cmd_tx
        .send(Command::SendBundle(OutboundBundle {
            id: 9,
            bytes: Bytes::from_static(b"tiny"),
        }))
        .await
        .unwrap();

    assert_eq!(
        next_msg(&mut peer).await,
        Message::DataSegment {
            start: true,
            end: true,
            data: Bytes::from_static(b"tiny"),
        }
    );
    peer.send(Frame::Message(Message::AckSegment { acked: 4 }))
        .await
        .unwrap();
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 9 }));
}

#[tokio::test]
async fn receiver_acks_cumulative_counts() {
    let (_cmd_tx, mut evt_rx, mut peer, _) = establish(config(), peer_header(0), true).await;

    peer.send(Frame::Message(Message::DataSegment {
        start: true,
        end: false,
        data: Bytes::from_static(b"ABCD"),
    }))
    .await
    .unwrap();
    assert_eq!(next_msg(&mut peer).await, Message::AckSegment { acked: 4 });

    peer.send(Frame::Message(Message::DataSegment {
        start: false,
        end: true,
        data: Bytes::from_static(b"EFG"),
    }))
    .await
    .unwrap();
    assert_eq!(next_msg(&mut peer).await, Message::AckSegment { acked: 7 });

    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::BundleReceived {
            bytes: Bytes::from_static(b"ABCDEFG"),
        })
    );
}

#[tokio::test]
async fn negotiation_takes_min_keepalive_and_ands_flags() {
    let mut cfg = config();
    cfg.keepalive_interval = 10;
    let (_c, _e, _p, negotiated) = establish(cfg, peer_header(7), true).await;
    assert_eq!(negotiated.keepalive_interval, 7);
    assert!(negotiated.segment_ack);
    assert!(!negotiated.reactive_frag);
    assert_eq!(negotiated.peer_eid, "dtn://b/".parse().unwrap());

    // The passive side takes the max so it cannot time the peer out
    // before the link parameters are known.
    let mut cfg = config();
    cfg.keepalive_interval = 10;
    let (_c, _e, _p, negotiated) = establish(cfg, peer_header(7), false).await;
    assert_eq!(negotiated.keepalive_interval, 10);
}

#[tokio::test]
async fn no_segment_acks_when_peer_does_not_support_them() {
    let mut header = peer_header(0);
    header.segment_ack_enabled = false;
    let (cmd_tx, mut evt_rx, mut peer, negotiated) = establish(config(), header, true).await;
    assert!(!negotiated.segment_ack);

    cmd_tx
        .send(Command::SendBundle(OutboundBundle {
            id: 2,
            bytes: Bytes::from_static(b"fire-and-forget"),
        }))
        .await
        .unwrap();

    assert!(matches!(
        next_msg(&mut peer).await,
        Message::DataSegment { end: true, .. }
    ));
    // Completion without any ack
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 2 }));
}

#[tokio::test]
async fn version_mismatch_shuts_down() {
    let (client, server) = tokio::io::duplex(1 << 16);
    let (_cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(8);
    let (evt_tx, _evt_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut peer = Framed::new(server, Codec::default());

    let mut header = peer_header(0);
    header.version = 2;

    let (result, _) = tokio::join!(
        Connection::start(client, config(), true, cmd_rx, evt_tx),
        async {
            peer.send(Frame::ContactHeader(header)).await.unwrap();
            assert!(matches!(
                peer.next().await,
                Some(Ok(Frame::ContactHeader(_)))
            ));
        }
    );
    assert!(matches!(result, Err(Error::VersionMismatch(2))));
    assert_eq!(
        next_msg(&mut peer).await,
        Message::Shutdown {
            reason: Some(ShutdownReason::VersionMismatch),
            delay: None,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn keepalive_emitted_when_line_is_quiet() {
    let mut cfg = config();
    cfg.keepalive_interval = 2;
    cfg.data_timeout = 60_000;
    let (_cmd_tx, _evt_rx, mut peer, negotiated) = establish(cfg, peer_header(2), true).await;
    assert_eq!(negotiated.keepalive_interval, 2);

    assert_eq!(next_msg(&mut peer).await, Message::Keepalive);
    assert_eq!(next_msg(&mut peer).await, Message::Keepalive);
}

#[tokio::test(start_paused = true)]
async fn data_timeout_breaks_the_contact() {
    let mut cfg = config();
    cfg.keepalive_interval = 30;
    cfg.data_timeout = 1_000;
    let (_cmd_tx, mut evt_rx, _peer, _) = establish(cfg, peer_header(30), true).await;

    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::ContactDown {
            reason: ContactReason::Broken,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn keepalive_faults_tolerated_when_configured() {
    let mut cfg = config();
    cfg.keepalive_interval = 30;
    cfg.data_timeout = 1_000;
    cfg.tolerate_keepalive_faults = true;
    let (_cmd_tx, mut evt_rx, _peer, _) = establish(cfg, peer_header(30), true).await;

    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
    assert!(evt_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn idle_ondemand_link_shuts_down_cleanly() {
    let mut cfg = config();
    cfg.idle_close_time = 2;
    let (cmd_tx, mut evt_rx, mut peer, _) = establish(cfg, peer_header(0), true).await;

    // One bundle of traffic, fully acknowledged
    cmd_tx
        .send(Command::SendBundle(OutboundBundle {
            id: 1,
            bytes: Bytes::from_static(b"last traffic"),
        }))
        .await
        .unwrap();
    let Message::DataSegment { data, .. } = next_msg(&mut peer).await else {
        panic!("expected data segment");
    };
    peer.send(Frame::Message(Message::AckSegment {
        acked: data.len() as u64,
    }))
    .await
    .unwrap();
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 1 }));

    // Three seconds of silence: a clean SHUTDOWN with IDLE_TIMEOUT
    assert_eq!(
        next_msg(&mut peer).await,
        Message::Shutdown {
            reason: Some(ShutdownReason::IdleTimeout),
            delay: None,
        }
    );
    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::ContactDown {
            reason: ContactReason::Idle,
        })
    );
}

#[tokio::test]
async fn peer_shutdown_is_echoed_and_contact_closes() {
    let (_cmd_tx, mut evt_rx, mut peer, _) = establish(config(), peer_header(0), true).await;

    peer.send(Frame::Message(Message::Shutdown {
        reason: Some(ShutdownReason::Busy),
        delay: None,
    }))
    .await
    .unwrap();

    assert_eq!(
        next_msg(&mut peer).await,
        Message::Shutdown {
            reason: None,
            delay: None,
        }
    );
    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::ContactDown {
            reason: ContactReason::Shutdown,
        })
    );
}

#[tokio::test]
async fn refuse_breaks_the_contact() {
    let (_cmd_tx, mut evt_rx, mut peer, _) = establish(config(), peer_header(0), true).await;

    peer.send(Frame::Message(Message::RefuseBundle))
        .await
        .unwrap();
    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::ContactDown {
            reason: ContactReason::Broken,
        })
    );
}

#[tokio::test]
async fn bundles_pipeline_up_to_the_inflight_cap() {
    let mut cfg = config();
    cfg.segment_length = 64;
    cfg.max_inflight_bundles = 2;
    let (cmd_tx, mut evt_rx, mut peer, _) = establish(cfg, peer_header(0), true).await;

    for (id, bytes) in [(1, &b"first"[..]), (2, b"second"), (3, b"third")] {
        cmd_tx
            .send(Command::SendBundle(OutboundBundle {
                id,
                bytes: Bytes::from_static(bytes),
            }))
            .await
            .unwrap();
    }

    // Bundle 2's bytes follow bundle 1's immediately — no ack between
    // them — but bundle 3 is held back by the cap.
    assert_eq!(
        next_msg(&mut peer).await,
        Message::DataSegment {
            start: true,
            end: true,
            data: Bytes::from_static(b"first"),
        }
    );
    assert_eq!(
        next_msg(&mut peer).await,
        Message::DataSegment {
            start: true,
            end: true,
            data: Bytes::from_static(b"second"),
        }
    );

    // Acking bundle 1 completes it and frees a slot for bundle 3.
    peer.send(Frame::Message(Message::AckSegment { acked: 5 }))
        .await
        .unwrap();
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 1 }));
    assert_eq!(
        next_msg(&mut peer).await,
        Message::DataSegment {
            start: true,
            end: true,
            data: Bytes::from_static(b"third"),
        }
    );

    peer.send(Frame::Message(Message::AckSegment { acked: 6 }))
        .await
        .unwrap();
    peer.send(Frame::Message(Message::AckSegment { acked: 5 }))
        .await
        .unwrap();
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 2 }));
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 3 }));
}

#[tokio::test]
async fn cancel_applies_only_before_bytes_hit_the_wire() {
    let mut cfg = config();
    cfg.segment_length = 64;
    cfg.max_inflight_bundles = 1;
    let (cmd_tx, mut evt_rx, mut peer, _) = establish(cfg, peer_header(0), true).await;

    // Bundle 1 goes on the wire and waits for its ack; the in-flight cap
    // of one keeps bundle 2 queued.
    cmd_tx
        .send(Command::SendBundle(OutboundBundle {
            id: 1,
            bytes: Bytes::from_static(b"in flight"),
        }))
        .await
        .unwrap();
    assert!(matches!(
        next_msg(&mut peer).await,
        Message::DataSegment { .. }
    ));
    cmd_tx
        .send(Command::SendBundle(OutboundBundle {
            id: 2,
            bytes: Bytes::from_static(b"still queued"),
        }))
        .await
        .unwrap();

    // Bundle 2 has no bytes on the wire: cancelled.
    cmd_tx.send(Command::CancelBundle { id: 2 }).await.unwrap();
    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::BundleSendCancelled { id: 2 })
    );

    // Bundle 1 is mid-transmission: cancellation is ignored.
    cmd_tx.send(Command::CancelBundle { id: 1 }).await.unwrap();
    peer.send(Frame::Message(Message::AckSegment { acked: 9 }))
        .await
        .unwrap();
    assert_eq!(evt_rx.recv().await, Some(ConnectionEvent::BundleSent { id: 1 }));
}

#[tokio::test(start_paused = true)]
async fn storage_full_pauses_delivery_until_space_appears() {
    let space = Arc::new(AtomicBool::new(false));
    let mut cfg = config();
    let check = space.clone();
    cfg.quota = Some(Arc::new(move |_| check.load(Ordering::SeqCst)));
    let (_cmd_tx, mut evt_rx, mut peer, _) = establish(cfg, peer_header(0), true).await;

    peer.send(Frame::Message(Message::DataSegment {
        start: true,
        end: true,
        data: Bytes::from_static(b"held bundle"),
    }))
    .await
    .unwrap();
    assert_eq!(next_msg(&mut peer).await, Message::AckSegment { acked: 11 });

    // No space: nothing delivered
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    assert!(evt_rx.try_recv().is_err());

    // Space appears; the 5-second retry delivers the bundle
    space.store(true, Ordering::SeqCst);
    assert_eq!(
        evt_rx.recv().await,
        Some(ConnectionEvent::BundleReceived {
            bytes: Bytes::from_static(b"held bundle"),
        })
    );
}
