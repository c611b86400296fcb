use super::*;
use codec::{Codec, ContactHeader, Frame, Message, ShutdownReason};
use futures::{SinkExt, StreamExt};
use perigee_bpa::{ContactReason, OutboundBundle};
use perigee_bpv6::Eid;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Duration, Instant};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::Framed;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Peer closed the connection")]
    Hangup,

    #[error("Peer version {0} below ours")]
    VersionMismatch(u8),

    #[error("No traffic from peer within the data timeout")]
    Timeout,

    #[error("Peer refused a bundle")]
    Refused,

    #[error("Peer violated the stream protocol: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Codec(#[from] codec::Error),
}

/// Commands from the agent to a live connection.
#[derive(Debug)]
pub enum Command {
    SendBundle(OutboundBundle),
    /// Drop a bundle that has not yet touched the wire; ignored otherwise.
    CancelBundle { id: u64 },
    Shutdown { reason: ShutdownReason },
}

/// Notifications from a connection back to the agent.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    BundleReceived { bytes: Bytes },
    BundleSent { id: u64 },
    BundleSendCancelled { id: u64 },
    ContactDown { reason: ContactReason },
}

/// The outcome of the contact-header exchange.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub keepalive_interval: u16,
    pub segment_ack: bool,
    pub reactive_frag: bool,
    pub peer_eid: Eid,
}

/// A bundle whose transmission has started. Its bytes may all be written
/// while earlier bundles are still awaiting their final ack; acks arrive
/// in bundle order, so the front of the in-flight queue is always the one
/// being acknowledged.
struct InFlight {
    id: u64,
    bytes: Bytes,
    /// Next byte to put on the wire.
    offset: usize,
    /// Cumulative bytes the peer has acknowledged.
    acked: u64,
}

impl InFlight {
    fn fully_written(&self) -> bool {
        self.offset == self.bytes.len()
    }
}

enum Close {
    /// We sent SHUTDOWN after the idle timer expired.
    Idle,
    /// The agent asked us to shut down.
    User,
    /// The peer initiated the shutdown handshake.
    Peer,
}

pub struct Connection<S> {
    transport: Framed<S, Codec>,
    config: Config,
    negotiated: Negotiated,
    commands: tokio::sync::mpsc::Receiver<Command>,
    events: tokio::sync::mpsc::UnboundedSender<ConnectionEvent>,

    queue: VecDeque<OutboundBundle>,
    inflight: VecDeque<InFlight>,

    ingress: Option<BytesMut>,
    pending_delivery: VecDeque<Bytes>,
    last_quota_attempt: Instant,

    last_sent: Instant,
    last_recv: Instant,
    last_data_activity: Instant,
}

/// Storage-full deliveries retry on this period.
const QUOTA_RETRY: Duration = Duration::from_secs(5);

/// Keepalives go out this much before the negotiated interval elapses.
const KEEPALIVE_MARGIN: Duration = Duration::from_millis(500);

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs the contact-header exchange and negotiation.
    ///
    /// Both sides send their header immediately. The received version must
    /// be at least ours, otherwise a SHUTDOWN with VERSION_MISMATCH is
    /// written and the connection abandoned. The keepalive interval
    /// negotiates to the minimum on the active side; the passive side
    /// takes the maximum so it cannot time the peer out before the link
    /// parameters are known. Option flags negotiate by AND.
    pub async fn start(
        stream: S,
        config: Config,
        active: bool,
        commands: tokio::sync::mpsc::Receiver<Command>,
        events: tokio::sync::mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Connection<S>, Error> {
        let mut transport = Framed::new(stream, Codec::default());

        transport
            .send(Frame::ContactHeader(ContactHeader {
                version: config.version,
                segment_ack_enabled: config.segment_ack_enabled,
                reactive_frag_enabled: config.reactive_frag_enabled,
                negative_ack_enabled: false,
                keepalive_interval: config.keepalive_interval,
                eid: config.local_eid.clone(),
            }))
            .await?;

        let peer = match transport.next().await {
            None => return Err(Error::Hangup),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Frame::ContactHeader(header))) => header,
            Some(Ok(Frame::Message(_))) => {
                return Err(Error::Protocol("message before contact header"));
            }
        };

        if peer.version < config.version {
            info!(
                "peer speaks stream CL version {}, ours is {}",
                peer.version, config.version
            );
            let _ = transport
                .send(Frame::Message(Message::Shutdown {
                    reason: Some(ShutdownReason::VersionMismatch),
                    delay: None,
                }))
                .await;
            let _ = transport.close().await;
            return Err(Error::VersionMismatch(peer.version));
        }

        let keepalive_interval = if active {
            config.keepalive_interval.min(peer.keepalive_interval)
        } else {
            config.keepalive_interval.max(peer.keepalive_interval)
        };

        if let Some(expected) = &config.expected_remote_eid {
            if *expected != peer.eid {
                info!("peer EID {} does not match configured {expected}", peer.eid);
            }
        }

        let now = Instant::now();
        Ok(Connection {
            transport,
            negotiated: Negotiated {
                keepalive_interval,
                segment_ack: config.segment_ack_enabled && peer.segment_ack_enabled,
                reactive_frag: config.reactive_frag_enabled && peer.reactive_frag_enabled,
                peer_eid: peer.eid,
            },
            config,
            commands,
            events,
            queue: VecDeque::new(),
            inflight: VecDeque::new(),
            ingress: None,
            pending_delivery: VecDeque::new(),
            last_quota_attempt: now,
            last_sent: now,
            last_recv: now,
            last_data_activity: now,
        })
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Drives the connection until it closes, then reports ContactDown.
    pub async fn run(mut self) {
        let reason = match self.main_loop().await {
            Ok(Close::Idle) => ContactReason::Idle,
            Ok(Close::User) => ContactReason::User,
            Ok(Close::Peer) => ContactReason::Shutdown,
            Err(Error::Hangup) => {
                info!("peer hung up");
                ContactReason::Broken
            }
            Err(Error::Timeout) => {
                info!("data timeout expired, breaking contact");
                ContactReason::Broken
            }
            Err(Error::Refused) => {
                info!("peer refused a bundle, breaking contact");
                ContactReason::Broken
            }
            Err(e) => {
                info!("connection failed: {e}");
                ContactReason::Broken
            }
        };
        let _ = self.transport.close().await;
        let _ = self.events.send(ConnectionEvent::ContactDown { reason });
    }

    async fn main_loop(&mut self) -> Result<Close, Error> {
        loop {
            self.try_deliver();

            let deadline = self.next_deadline();
            let can_send = self.can_send();
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    None => return self.shutdown(ShutdownReason::NoReason).await.map(|_| Close::User),
                    Some(Command::SendBundle(bundle)) => {
                        // The queue is unbounded; max_inflight_bundles
                        // gates admission into the in-flight set instead.
                        self.queue.push_back(bundle);
                    }
                    Some(Command::CancelBundle { id }) => self.cancel_bundle(id),
                    Some(Command::Shutdown { reason }) => {
                        return self.shutdown(reason).await.map(|_| Close::User);
                    }
                },
                frame = self.transport.next() => match frame {
                    None => return Err(Error::Hangup),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Frame::ContactHeader(_))) => {
                        return Err(Error::Protocol("unexpected second contact header"));
                    }
                    Some(Ok(Frame::Message(msg))) => {
                        if let Some(close) = self.on_message(msg).await? {
                            return Ok(close);
                        }
                    }
                },
                _ = std::future::ready(()), if can_send => {
                    self.send_next_segment().await?;
                }
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
                ), if deadline.is_some() => {
                    if let Some(close) = self.on_deadline().await? {
                        return Ok(close);
                    }
                }
            }
        }
    }

    /// Another segment may go out when the newest in-flight bundle still
    /// has unwritten bytes, or when a queued bundle can be admitted under
    /// the in-flight cap — earlier bundles waiting only on their acks do
    /// not hold the line.
    fn can_send(&self) -> bool {
        if self
            .inflight
            .back()
            .is_some_and(|inflight| !inflight.fully_written())
        {
            return true;
        }
        !self.queue.is_empty() && self.inflight.len() < self.config.max_inflight_bundles
    }

    async fn send_next_segment(&mut self) -> Result<(), Error> {
        if !self
            .inflight
            .back()
            .is_some_and(|inflight| !inflight.fully_written())
        {
            if self.inflight.len() >= self.config.max_inflight_bundles {
                return Ok(());
            }
            let Some(bundle) = self.queue.pop_front() else {
                return Ok(());
            };
            self.inflight.push_back(InFlight {
                id: bundle.id,
                bytes: bundle.bytes,
                offset: 0,
                acked: 0,
            });
        }
        let inflight = self.inflight.back_mut().expect("just placed");

        let remaining = inflight.bytes.len() - inflight.offset;
        let take = remaining.min(self.config.segment_length);
        let start = inflight.offset == 0;
        let end = take == remaining;
        let data = inflight.bytes.slice(inflight.offset..inflight.offset + take);
        inflight.offset += take;

        self.transport
            .send(Frame::Message(Message::DataSegment { start, end, data }))
            .await?;
        self.last_sent = Instant::now();
        self.last_data_activity = self.last_sent;

        // Without segment acks the transfer completes as soon as the last
        // segment is flushed.
        if end && !self.negotiated.segment_ack {
            let id = self.inflight.pop_back().expect("just placed").id;
            let _ = self.events.send(ConnectionEvent::BundleSent { id });
        }
        Ok(())
    }

    fn cancel_bundle(&mut self, id: u64) {
        // Only a bundle with no bytes on the wire may be cancelled.
        if let Some(pos) = self.inflight.iter().position(|b| b.id == id) {
            if self.inflight[pos].offset == 0 {
                self.inflight.remove(pos);
                let _ = self
                    .events
                    .send(ConnectionEvent::BundleSendCancelled { id });
            } else {
                debug!("bundle {id} already on the wire; cancel ignored");
            }
            return;
        }
        if let Some(pos) = self.queue.iter().position(|b| b.id == id) {
            self.queue.remove(pos);
            let _ = self
                .events
                .send(ConnectionEvent::BundleSendCancelled { id });
        }
    }

    async fn on_message(&mut self, msg: Message) -> Result<Option<Close>, Error> {
        self.last_recv = Instant::now();
        match msg {
            Message::Keepalive => Ok(None),
            Message::DataSegment { start, end, data } => {
                self.last_data_activity = self.last_recv;
                if start {
                    if self.ingress.is_some() {
                        return Err(Error::Protocol("segment restarts an open bundle"));
                    }
                    self.ingress = Some(BytesMut::with_capacity(data.len()));
                }
                let Some(ingress) = &mut self.ingress else {
                    return Err(Error::Protocol("segment outside a bundle"));
                };
                ingress.extend_from_slice(&data);
                let received = ingress.len() as u64;

                if self.negotiated.segment_ack {
                    // Acks ride along opportunistically: flush only when no
                    // data segment is about to follow anyway.
                    self.transport
                        .feed(Frame::Message(Message::AckSegment { acked: received }))
                        .await?;
                    if !self.can_send() {
                        self.transport.flush().await?;
                    }
                    self.last_sent = Instant::now();
                }

                if end {
                    let bundle = self.ingress.take().expect("checked above").freeze();
                    self.pending_delivery.push_back(bundle);
                }
                Ok(None)
            }
            Message::AckSegment { acked } => {
                // Acks land on bundles in the order they were sent.
                let Some(inflight) = self.inflight.front_mut() else {
                    debug!("stray ack of {acked} bytes");
                    return Ok(None);
                };
                if acked < inflight.acked {
                    info!(
                        "cumulative ack went backwards: {} then {acked}",
                        inflight.acked
                    );
                    return Ok(None);
                }
                if acked > inflight.offset as u64 {
                    return Err(Error::Protocol("ack beyond bytes sent"));
                }
                inflight.acked = acked;
                if inflight.acked == inflight.bytes.len() as u64 {
                    let id = self.inflight.pop_front().expect("checked above").id;
                    let _ = self.events.send(ConnectionEvent::BundleSent { id });
                }
                Ok(None)
            }
            Message::RefuseBundle => {
                // Refusal semantics are not supported on this framing.
                Err(Error::Refused)
            }
            Message::Shutdown { reason, .. } => {
                info!("peer shut down the contact: {reason:?}");
                // Echo a bare SHUTDOWN and close.
                let _ = self
                    .transport
                    .send(Frame::Message(Message::Shutdown {
                        reason: None,
                        delay: None,
                    }))
                    .await;
                Ok(Some(Close::Peer))
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |t: Instant| {
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        };

        if self.negotiated.keepalive_interval > 0 {
            let keepalive = Duration::from_secs(self.negotiated.keepalive_interval as u64);
            consider(self.last_sent + keepalive.saturating_sub(KEEPALIVE_MARGIN));
            consider(self.last_recv + Duration::from_millis(self.config.data_timeout as u64));
        }
        if self.config.idle_close_time > 0 && self.inflight.is_empty() && self.queue.is_empty() {
            consider(
                self.last_data_activity + Duration::from_secs(self.config.idle_close_time as u64),
            );
        }
        if !self.pending_delivery.is_empty() {
            consider(self.last_quota_attempt + QUOTA_RETRY);
        }
        deadline
    }

    async fn on_deadline(&mut self) -> Result<Option<Close>, Error> {
        let now = Instant::now();

        if self.negotiated.keepalive_interval > 0 {
            let data_timeout = Duration::from_millis(self.config.data_timeout as u64);
            if now >= self.last_recv + data_timeout {
                if self.config.tolerate_keepalive_faults {
                    warn!("data timeout expired; tolerating keepalive fault");
                    self.last_recv = now;
                } else {
                    return Err(Error::Timeout);
                }
            }
        }

        if self.config.idle_close_time > 0
            && self.inflight.is_empty()
            && self.queue.is_empty()
            && now >= self.last_data_activity + Duration::from_secs(self.config.idle_close_time as u64)
        {
            debug!("idle for {}s, closing cleanly", self.config.idle_close_time);
            return self
                .shutdown(ShutdownReason::IdleTimeout)
                .await
                .map(|_| Some(Close::Idle));
        }

        if self.negotiated.keepalive_interval > 0 {
            let keepalive = Duration::from_secs(self.negotiated.keepalive_interval as u64);
            if now >= self.last_sent + keepalive.saturating_sub(KEEPALIVE_MARGIN) && !self.can_send()
            {
                self.transport.send(Frame::Message(Message::Keepalive)).await?;
                self.last_sent = Instant::now();
            }
        }
        Ok(None)
    }

    /// Writes SHUTDOWN with the reason and flushes; the peer echoes and
    /// both sides close.
    async fn shutdown(&mut self, reason: ShutdownReason) -> Result<(), Error> {
        self.transport
            .send(Frame::Message(Message::Shutdown {
                reason: Some(reason),
                delay: None,
            }))
            .await?;
        Ok(())
    }

    /// Hands completed bundles up, pausing while payload storage is full;
    /// the contact stays alive on keepalives and the attempt repeats every
    /// five seconds.
    fn try_deliver(&mut self) {
        while let Some(front) = self.pending_delivery.front() {
            if let Some(quota) = &self.config.quota {
                if !quota(front.len()) {
                    self.last_quota_attempt = Instant::now();
                    debug!("payload storage full; delivery deferred");
                    return;
                }
            }
            let bytes = self.pending_delivery.pop_front().expect("checked above");
            let _ = self.events.send(ConnectionEvent::BundleReceived { bytes });
        }
    }
}
