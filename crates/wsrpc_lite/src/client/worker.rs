//! The owning worker task.
//!
//! Every piece of protocol state (registry, batches, outbox, connection
//! state) lives on this task and is touched only from its event loop.
//! Caller submissions, socket frames, stateless responses and timer
//! ticks are all funneled in through channels, so no locking is needed
//! and side-effect ordering within one event is exact.

use std::pin::Pin;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, Sleep};
use tracing::{debug, warn};

use super::config::ClientConfig;
use super::handle::{CallHandle, CallSpec, StreamHandle, StreamUpdate};
use crate::batch::{BatchTracker, PollState};
use crate::envelope::{self, Envelope, Kind};
use crate::error::ClientError;
use crate::outbox::{Origin, Outbox, OutboxEntry};
use crate::registry::{CallResolver, Registry, Resolver, StreamResolver};
use crate::transport::{
    self, ConnectionState, Socket, TransportEvent, TransportManager, WsError, WsMessage,
};

pub(crate) enum Command {
    Call {
        calls: Vec<CallSpec>,
        ack: oneshot::Sender<Result<Vec<CallHandle>, ClientError>>,
    },
    Stream {
        calls: Vec<CallSpec>,
        /// Command sender embedded into the returned handles so they can
        /// cancel themselves.
        commands: mpsc::UnboundedSender<Command>,
        ack: oneshot::Sender<Result<Vec<StreamHandle>, ClientError>>,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

enum Tick {
    Command(Option<Command>),
    Event(TransportEvent),
    Frame(Option<Result<WsMessage, WsError>>),
    SampleWindow,
    Poll,
    Reconnect,
}

pub(crate) struct Worker {
    cfg: ClientConfig,
    http: reqwest::Client,
    registry: Registry,
    batches: BatchTracker,
    outbox: Outbox,
    transport: TransportManager,
    socket: Socket,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl Worker {
    /// Build the worker and spawn its event loop, returning the command
    /// funnel and the connection-state watch.
    pub fn spawn(
        cfg: ClientConfig,
    ) -> Result<
        (
            mpsc::UnboundedSender<Command>,
            watch::Receiver<ConnectionState>,
        ),
        ClientError,
    > {
        let (transport, state_rx) = TransportManager::new(&cfg)?;
        let http = reqwest::Client::builder().build()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            cfg,
            http,
            registry: Registry::new(),
            batches: BatchTracker::new(),
            outbox: Outbox::new(),
            transport,
            socket: Socket::Closed,
            commands: cmd_rx,
            events_tx,
            events_rx,
            reconnect: None,
        };
        tokio::spawn(worker.run());

        Ok((cmd_tx, state_rx))
    }

    async fn run(mut self) {
        if self.cfg.disable_websocket {
            self.enter_degraded("persistent transport administratively disabled")
                .await;
        } else {
            self.begin_connect();
        }

        let mut sample = tokio::time::interval(self.cfg.error_window);
        sample.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = tokio::time::interval(self.cfg.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let tick = tokio::select! {
                cmd = self.commands.recv() => Tick::Command(cmd),
                Some(event) = self.events_rx.recv() => Tick::Event(event),
                frame = self.socket.next_frame() => Tick::Frame(frame),
                _ = sample.tick(), if !self.transport.is_degraded() => Tick::SampleWindow,
                _ = poll.tick(), if self.transport.is_degraded() => Tick::Poll,
                _ = wait_reconnect(&mut self.reconnect) => Tick::Reconnect,
            };

            match tick {
                Tick::Command(None) | Tick::Command(Some(Command::Shutdown)) => break,
                Tick::Command(Some(cmd)) => self.handle_command(cmd).await,
                Tick::Event(event) => self.handle_event(event).await,
                Tick::Frame(frame) => self.handle_frame(frame).await,
                Tick::SampleWindow => self.close_sample_window().await,
                Tick::Poll => self.poll_tick().await,
                Tick::Reconnect => {
                    self.reconnect = None;
                    self.begin_connect();
                }
            }
        }

        self.socket.close().await;
        debug!("client worker stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { calls, ack } => {
                let _ = ack.send(self.submit_calls(calls).await);
            }
            Command::Stream {
                calls,
                commands,
                ack,
            } => {
                let _ = ack.send(self.submit_streams(calls, commands).await);
            }
            Command::Cancel { id } => self.cancel_stream(id),
            Command::Shutdown => {}
        }
    }

    async fn submit_calls(
        &mut self,
        calls: Vec<CallSpec>,
    ) -> Result<Vec<CallHandle>, ClientError> {
        if calls.is_empty() {
            return Err(ClientError::EmptySubmission);
        }

        let mut handles = Vec::with_capacity(calls.len());
        let mut group = Vec::with_capacity(calls.len());
        for spec in calls {
            let (reply_tx, reply_rx) = oneshot::channel();
            let id = self
                .registry
                .register_with(|_| Resolver::Call(CallResolver { reply: reply_tx }));
            group.push(Envelope::request(
                id,
                Kind::Call,
                spec.method.as_str(),
                spec.params,
                spec.header,
            ));
            handles.push(CallHandle { id, reply: reply_rx });
        }

        let payload = match envelope::encode_group(&group) {
            Ok(payload) => payload,
            Err(e) => {
                for env in &group {
                    self.registry.remove(env.id);
                }
                return Err(e.into());
            }
        };
        self.submit_entry(OutboxEntry {
            payload,
            origin: Origin::Call,
        })
        .await;

        Ok(handles)
    }

    async fn submit_streams(
        &mut self,
        calls: Vec<CallSpec>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Result<Vec<StreamHandle>, ClientError> {
        if calls.is_empty() {
            return Err(ClientError::EmptySubmission);
        }

        let batched = calls.len() > 1;
        let mut ids = Vec::with_capacity(calls.len());
        let mut receivers = Vec::with_capacity(calls.len());
        for spec in calls {
            let (update_tx, update_rx) = mpsc::unbounded_channel();
            let id = self.registry.register_with(|id| {
                Resolver::Stream(StreamResolver {
                    batch_id: None,
                    last_payload: Envelope::request(
                        id,
                        Kind::Stream,
                        spec.method.as_str(),
                        spec.params.clone(),
                        spec.header.clone(),
                    ),
                    updates: update_tx,
                    poll: PollState::Idle,
                })
            });
            ids.push(id);
            receivers.push(update_rx);
        }

        let batch_id = if batched {
            let batch_id = self.batches.open(ids.clone());
            for id in &ids {
                if let Some(Resolver::Stream(stream)) = self.registry.get_mut(*id) {
                    stream.batch_id = Some(batch_id);
                }
            }
            Some(batch_id)
        } else {
            None
        };

        let group: Vec<Envelope> = ids
            .iter()
            .filter_map(|id| match self.registry.get(*id) {
                Some(Resolver::Stream(stream)) => Some(stream.last_payload.clone()),
                _ => None,
            })
            .collect();
        let payload = match envelope::encode_group(&group) {
            Ok(payload) => payload,
            Err(e) => {
                for id in &ids {
                    self.registry.remove(*id);
                }
                if let Some(batch_id) = batch_id {
                    for id in &ids {
                        self.batches.remove_member(batch_id, *id);
                    }
                }
                return Err(e.into());
            }
        };
        let origin = match batch_id {
            Some(batch_id) => Origin::Batch(batch_id),
            None => Origin::Solo(ids[0]),
        };
        self.submit_entry(OutboxEntry { payload, origin }).await;

        let handles = ids
            .into_iter()
            .zip(receivers)
            .map(|(id, updates)| StreamHandle {
                id,
                batch_id,
                updates,
                commands: commands.clone(),
            })
            .collect();
        Ok(handles)
    }

    /// Send discipline: an OPEN socket sends right away; otherwise the
    /// group queues and waits for the open-transition flush or the
    /// degraded tick.
    async fn submit_entry(&mut self, entry: OutboxEntry) {
        self.mark_origin(entry.origin, PollState::Queued);
        self.outbox.enqueue(entry);
        if self.transport.is_open() {
            self.flush_socket().await;
        }
    }

    fn mark_origin(&mut self, origin: Origin, poll: PollState) {
        match origin {
            Origin::Call => {}
            Origin::Batch(batch_id) => self.batches.set_poll(batch_id, poll),
            Origin::Solo(id) => {
                if let Some(Resolver::Stream(stream)) = self.registry.get_mut(id) {
                    stream.poll = poll;
                }
            }
        }
    }

    /// Drain the outbox over the open socket in FIFO order. A failed
    /// send re-queues its entry at the head and drops the connection.
    async fn flush_socket(&mut self) {
        while self.transport.is_open() {
            let Some(entry) = self.outbox.pop() else {
                break;
            };
            match self.socket.send_text(&entry.payload).await {
                Ok(()) => self.mark_origin(entry.origin, PollState::InFlight),
                Err(e) => {
                    warn!(error = %e, "websocket send failed");
                    self.transport.sampler.record();
                    self.mark_origin(entry.origin, PollState::Queued);
                    self.outbox.requeue_front(entry);
                    self.socket_lost().await;
                    break;
                }
            }
        }
    }

    fn begin_connect(&mut self) {
        if self.transport.is_degraded() {
            return;
        }
        self.transport.set_state(ConnectionState::Connecting);
        transport::spawn_connect(
            self.transport.ws_url.clone(),
            self.cfg.connect_timeout,
            self.events_tx.clone(),
        );
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.transport.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling websocket reconnect");
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
    }

    /// The socket is gone. Schedule a reconnect and rebuild stream polls
    /// whose responses were lost in flight; queued entries stay put.
    async fn socket_lost(&mut self) {
        self.socket = Socket::Closed;
        if self.transport.is_degraded() {
            return;
        }
        self.transport.set_state(ConnectionState::Closed);
        self.schedule_reconnect();
        self.resubmit_lost_polls().await;
    }

    async fn resubmit_lost_polls(&mut self) {
        for batch_id in self.batches.ids() {
            if self.batches.poll(batch_id) == Some(PollState::InFlight) {
                self.resubmit_batch(batch_id).await;
            }
        }
        for id in self.registry.solo_stream_ids() {
            let in_flight = matches!(
                self.registry.get(id),
                Some(Resolver::Stream(stream)) if stream.poll == PollState::InFlight
            );
            if in_flight {
                self.resubmit_solo(id).await;
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(ws) => {
                if self.transport.is_degraded() {
                    // The handshake raced the latch; the socket stays
                    // unused and drops here.
                    return;
                }
                self.socket = Socket::Open(ws);
                self.transport.set_state(ConnectionState::Open);
                self.transport.backoff.reset();
                self.registry.reset_ids();
                debug!("websocket open, flushing outbox");
                self.flush_socket().await;
            }
            TransportEvent::ConnectFailed => {
                if self.transport.is_degraded() {
                    return;
                }
                self.transport.sampler.record();
                self.transport.set_state(ConnectionState::Closed);
                self.schedule_reconnect();
            }
            TransportEvent::HttpDone { entry, result } => self.handle_http(entry, result).await,
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<WsMessage, WsError>>) {
        match frame {
            Some(Ok(WsMessage::Text(text))) => self.dispatch_payload(text.as_str(), None).await,
            Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    let text = text.to_string();
                    self.dispatch_payload(&text, None).await;
                }
                Err(_) => warn!("dropping non-utf8 binary frame"),
            },
            Some(Ok(WsMessage::Ping(data))) => {
                let _ = self.socket.send_pong(data).await;
            }
            Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("websocket closed by peer");
                self.socket_lost().await;
            }
            Some(Err(e)) => {
                warn!(error = %e, "websocket error");
                self.transport.sampler.record();
                self.socket_lost().await;
            }
        }
    }

    async fn handle_http(&mut self, entry: OutboxEntry, result: Result<String, reqwest::Error>) {
        match result {
            Ok(body) => self.dispatch_payload(&body, Some(entry.origin)).await,
            Err(e) => {
                debug!(error = %e, "stateless request failed");
                self.transport.sampler.record();
                self.mark_origin(entry.origin, PollState::Queued);
                self.outbox.requeue_front(entry);
            }
        }
    }

    async fn close_sample_window(&mut self) {
        if self.transport.sampler.close_window() {
            self.enter_degraded("transport error rate over threshold")
                .await;
        }
    }

    /// One-way latch: abandon the socket for good and fall back to the
    /// stateless transport on a timer.
    async fn enter_degraded(&mut self, reason: &str) {
        warn!(reason, "entering degraded mode");
        self.reconnect = None;
        self.socket.close().await;
        self.transport.set_state(ConnectionState::Degraded);
        // In-flight socket polls will never be answered now.
        self.resubmit_lost_polls().await;
        self.drain_stateless();
    }

    /// Degraded cadence: re-poll idle stream units, then push everything
    /// queued through the stateless transport.
    async fn poll_tick(&mut self) {
        for batch_id in self.batches.ids() {
            if self.batches.poll(batch_id) == Some(PollState::Idle) {
                self.resubmit_batch(batch_id).await;
            }
        }
        for id in self.registry.solo_stream_ids() {
            let idle = matches!(
                self.registry.get(id),
                Some(Resolver::Stream(stream)) if stream.poll == PollState::Idle
            );
            if idle {
                self.resubmit_solo(id).await;
            }
        }
        self.drain_stateless();
    }

    /// Hand every queued group to a POST task; outcomes funnel back as
    /// events.
    fn drain_stateless(&mut self) {
        while let Some(entry) = self.outbox.pop() {
            self.mark_origin(entry.origin, PollState::InFlight);
            transport::spawn_post(
                self.http.clone(),
                self.transport.http_url.clone(),
                entry,
                self.events_tx.clone(),
            );
        }
    }

    /// Re-issue every remaining member of a batch as one group, each
    /// envelope carrying its latest observed continuation header.
    async fn resubmit_batch(&mut self, batch_id: u64) {
        let group: Vec<Envelope> = {
            let Some(members) = self.batches.members(batch_id) else {
                return;
            };
            members
                .iter()
                .filter_map(|id| match self.registry.get(*id) {
                    Some(Resolver::Stream(stream)) => Some(stream.last_payload.clone()),
                    _ => None,
                })
                .collect()
        };
        if group.is_empty() {
            return;
        }
        match envelope::encode_group(&group) {
            Ok(payload) => {
                Box::pin(self.submit_entry(OutboxEntry {
                    payload,
                    origin: Origin::Batch(batch_id),
                }))
                .await;
            }
            Err(e) => warn!(error = %e, batch_id, "failed to encode batch re-submission"),
        }
    }

    async fn resubmit_solo(&mut self, id: u64) {
        let Some(Resolver::Stream(stream)) = self.registry.get(id) else {
            return;
        };
        match envelope::encode_group(std::slice::from_ref(&stream.last_payload)) {
            Ok(payload) => {
                Box::pin(self.submit_entry(OutboxEntry {
                    payload,
                    origin: Origin::Solo(id),
                }))
                .await;
            }
            Err(e) => warn!(error = %e, id, "failed to encode stream re-submission"),
        }
    }

    /// Decode an inbound payload and route each envelope. Malformed
    /// payloads are dropped; a poll unit that got one back goes idle so
    /// the next tick retries it.
    async fn dispatch_payload(&mut self, data: &str, origin: Option<Origin>) {
        let envelopes = match envelope::decode_payload(data) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "dropping malformed inbound payload");
                if let Some(origin) = origin {
                    self.mark_origin(origin, PollState::Idle);
                }
                return;
            }
        };
        for env in envelopes {
            self.dispatch_envelope(env).await;
        }
    }

    async fn dispatch_envelope(&mut self, env: Envelope) {
        match self.registry.get(env.id) {
            None => debug!(id = env.id, "dropping response with no registered resolver"),
            Some(Resolver::Call(_)) => self.complete_call(env),
            Some(Resolver::Stream(_)) => self.advance_stream(env).await,
        }
    }

    /// Calls are single-shot: the resolver is removed on the first
    /// response, success or error.
    fn complete_call(&mut self, env: Envelope) {
        let Some(Resolver::Call(call)) = self.registry.remove(env.id) else {
            return;
        };
        let outcome = match env.error.clone() {
            Some(err) => Err(err),
            None => Ok(env),
        };
        // The caller may have dropped its handle already.
        let _ = call.reply.send(outcome);
    }

    /// Stream state machine: events and non-terminal errors leave the
    /// resolver in place; the sentinel and cancellation remove it. Off
    /// the socket, every response also re-arms the unit's poll.
    async fn advance_stream(&mut self, env: Envelope) {
        let id = env.id;
        let unit = match self.registry.get(id) {
            Some(Resolver::Stream(stream)) => {
                stream.batch_id.map(Origin::Batch).unwrap_or(Origin::Solo(id))
            }
            _ => return,
        };
        let disconnected = !self.transport.is_open();

        match env.error.clone() {
            Some(err) if err.is_terminal() => {
                let Some(Resolver::Stream(stream)) = self.registry.remove(id) else {
                    return;
                };
                let _ = stream.updates.send(StreamUpdate::Complete(env));
                if let Some(batch_id) = stream.batch_id {
                    self.batches.remove_member(batch_id, id);
                }
            }
            Some(err) => {
                let canceled = match self.registry.get_mut(id) {
                    Some(Resolver::Stream(stream)) => {
                        stream.updates.send(StreamUpdate::Error(err)).is_err()
                    }
                    _ => return,
                };
                if canceled {
                    self.cancel_stream(id);
                }
            }
            None => {
                let canceled = match self.registry.get_mut(id) {
                    Some(Resolver::Stream(stream)) => {
                        let header = env.header.clone();
                        if stream.updates.send(StreamUpdate::Event(env)).is_err() {
                            true
                        } else {
                            stream.last_payload.header = header;
                            false
                        }
                    }
                    _ => return,
                };
                if canceled {
                    self.cancel_stream(id);
                }
            }
        }

        // A response settles the unit's outstanding poll; off the socket
        // the unit is re-polled at once so events keep flowing.
        if disconnected {
            self.mark_origin(unit, PollState::Idle);
            self.resubmit_unit(unit).await;
        }
    }

    async fn resubmit_unit(&mut self, unit: Origin) {
        match unit {
            Origin::Call => {}
            Origin::Batch(batch_id) => self.resubmit_batch(batch_id).await,
            Origin::Solo(id) => self.resubmit_solo(id).await,
        }
    }

    /// Caller-initiated cancellation: remove the resolver and its batch
    /// membership. The protocol has no cancellation frame, so later
    /// pushes for the id arrive as strays and get dropped.
    fn cancel_stream(&mut self, id: u64) {
        match self.registry.get(id) {
            Some(Resolver::Stream(_)) => {}
            _ => return,
        }
        let Some(Resolver::Stream(stream)) = self.registry.remove(id) else {
            return;
        };
        debug!(id, "stream canceled");
        if let Some(batch_id) = stream.batch_id {
            self.batches.remove_member(batch_id, id);
        }
    }
}

async fn wait_reconnect(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        // The timer may have fired on a round another branch won; it
        // must not be polled again after completing.
        Some(sleep) if sleep.is_elapsed() => {}
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
