//! TCP resource host.
//!
//! Accepts observer connections and turns their handshake into bind requests
//! for the profiler. Every bound observer gets each flushed batch; an observer
//! that cannot take one is dropped without affecting the others.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use cycleprof_core::{Delivery, HostEvent, ResourceHost};
use cycleprof_types::{ClientId, ServiceInfo, SubscriberHandle};

use crate::framing::{encode_frame, read_message, write_frame, write_message};
use crate::protocol::{ClientMessage, ServerMessage};

/// A slow observer is dropped after this.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection that has not bound yet.
struct PendingConnection {
    name: Option<String>,
    writer: BufWriter<TcpStream>,
}

/// A bound observer.
struct Subscriber {
    client: ClientId,
    name: String,
    writer: BufWriter<TcpStream>,
}

impl Subscriber {
    fn close(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

pub struct NetHost {
    listener: TcpListener,
    pending: HashMap<ClientId, PendingConnection>,
    subscribers: HashMap<SubscriberHandle, Subscriber>,
    msg_rx: Receiver<(ClientId, ClientMessage)>,
    msg_tx: Sender<(ClientId, ClientMessage)>,
    next_client_id: u64,
    next_handle: u64,
    max_subscribers: Option<usize>,
    closed: bool,
}

impl NetHost {
    /// Bind the host to an address.
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let (msg_tx, msg_rx) = mpsc::channel();

        info!(target: "profiler::net", "listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            pending: HashMap::new(),
            subscribers: HashMap::new(),
            msg_rx,
            msg_tx,
            next_client_id: 0,
            next_handle: 0,
            max_subscribers: None,
            closed: false,
        })
    }

    /// Refuse binds once `max` observers are bound.
    pub fn with_max_subscribers(mut self, max: Option<usize>) -> Self {
        self.max_subscribers = max;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Names of the bound observers.
    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscribers.values().map(|s| s.name.clone()).collect()
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let client_id = ClientId::new(self.next_client_id);
                    self.next_client_id += 1;

                    if let Err(e) = prepare_stream(&stream) {
                        error!(target: "profiler::net", "cannot set up {}: {}", addr, e);
                        continue;
                    }
                    let read_stream = match stream.try_clone() {
                        Ok(s) => s,
                        Err(e) => {
                            error!(target: "profiler::net", "failed to clone stream: {}", e);
                            continue;
                        }
                    };

                    let msg_tx = self.msg_tx.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("cycleprof-{}", client_id))
                        .spawn(move || client_reader_thread(client_id, read_stream, msg_tx));
                    if let Err(e) = spawned {
                        error!(target: "profiler::net", "cannot start reader for {}: {}", addr, e);
                        continue;
                    }

                    self.pending.insert(
                        client_id,
                        PendingConnection {
                            name: None,
                            writer: BufWriter::new(stream),
                        },
                    );
                    info!(target: "profiler::net", "{} connected from {}, awaiting Hello", client_id, addr);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "profiler::net", "accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_by_client(&self, client: ClientId) -> Option<SubscriberHandle> {
        self.subscribers
            .iter()
            .find(|(_, s)| s.client == client)
            .map(|(h, _)| *h)
    }

    fn reject(&mut self, client: ClientId, reason: &str) {
        if let Some(mut pending) = self.pending.remove(&client) {
            let msg = ServerMessage::Rejected {
                reason: reason.to_string(),
            };
            if let Err(e) = write_message(&mut pending.writer, &msg) {
                warn!(target: "profiler::net", "failed to send rejection to {}: {}", client, e);
            }
            let _ = pending.writer.get_ref().shutdown(Shutdown::Both);
        }
    }
}

impl ResourceHost for NetHost {
    fn poll_events(&mut self) -> Vec<HostEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        self.accept_connections();

        while let Ok((client, msg)) = self.msg_rx.try_recv() {
            match msg {
                ClientMessage::Hello { client_name } => match self.pending.get_mut(&client) {
                    Some(pending) if pending.name.is_none() => {
                        info!(target: "profiler::net", "{} says hello as '{}'", client, client_name);
                        pending.name = Some(client_name);
                        events.push(HostEvent::Bind(client));
                    }
                    _ => warn!(target: "profiler::net", "unexpected Hello from {}", client),
                },
                ClientMessage::Goodbye => {
                    if let Some(handle) = self.handle_by_client(client) {
                        if let Some(mut sub) = self.subscribers.remove(&handle) {
                            sub.close();
                            info!(target: "profiler::net", "{} ('{}') left", handle, sub.name);
                        }
                        events.push(HostEvent::Destroy(handle));
                    } else if self.pending.remove(&client).is_some() {
                        info!(target: "profiler::net", "{} left before binding", client);
                    }
                }
            }
        }
        events
    }

    fn allocate(
        &mut self,
        client: ClientId,
        service: &ServiceInfo,
    ) -> Result<SubscriberHandle, String> {
        if self.closed {
            return Err("host is shut down".into());
        }
        if !self.pending.contains_key(&client) {
            return Err(format!("{} is not connected", client));
        }
        if let Some(max) = self.max_subscribers {
            if self.subscribers.len() >= max {
                let reason = format!("subscriber limit {} reached", max);
                self.reject(client, &reason);
                return Err(reason);
            }
        }
        let Some(mut pending) = self.pending.remove(&client) else {
            return Err(format!("{} is not connected", client));
        };

        self.next_handle += 1;
        let handle = SubscriberHandle::new(self.next_handle);
        let welcome = ServerMessage::Welcome {
            subscriber: handle,
            service: service.clone(),
        };
        if let Err(e) = write_message(&mut pending.writer, &welcome) {
            let _ = pending.writer.get_ref().shutdown(Shutdown::Both);
            return Err(format!("cannot welcome {}: {}", client, e));
        }

        self.subscribers.insert(
            handle,
            Subscriber {
                client,
                name: pending.name.unwrap_or_default(),
                writer: pending.writer,
            },
        );
        Ok(handle)
    }

    fn release(&mut self, handle: SubscriberHandle) {
        if let Some(mut sub) = self.subscribers.remove(&handle) {
            sub.close();
        }
    }

    fn deliver_all(&mut self, batch: &[u8]) -> Delivery {
        let mut delivery = Delivery::default();
        let frame = match encode_frame(&ServerMessage::Profile {
            batch: batch.to_vec(),
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!(target: "profiler::net", "cannot encode batch: {}", e);
                return delivery;
            }
        };

        for (handle, sub) in &mut self.subscribers {
            match write_frame(&mut sub.writer, &frame) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(target: "profiler::net", "failed to send to {} ('{}'): {}", handle, sub.name, e);
                    delivery.dropped.push(*handle);
                }
            }
        }

        for handle in &delivery.dropped {
            if let Some(mut sub) = self.subscribers.remove(handle) {
                sub.close();
            }
        }
        delivery
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = encode_frame(&ServerMessage::Shutdown).ok();
        for (_, mut sub) in self.subscribers.drain() {
            if let Some(frame) = &frame {
                let _ = write_frame(&mut sub.writer, frame);
            }
            sub.close();
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.writer.get_ref().shutdown(Shutdown::Both);
        }
        info!(target: "profiler::net", "host closed");
    }
}

fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))
}

/// Reads messages from one observer until it says goodbye or disconnects.
fn client_reader_thread(
    client_id: ClientId,
    stream: TcpStream,
    msg_tx: Sender<(ClientId, ClientMessage)>,
) {
    let mut reader = BufReader::new(stream);

    loop {
        match read_message::<_, ClientMessage>(&mut reader) {
            Ok(msg) => {
                let is_goodbye = matches!(msg, ClientMessage::Goodbye);
                if msg_tx.send((client_id, msg)).is_err() {
                    break;
                }
                if is_goodbye {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(target: "profiler::net", "{} read error: {}", client_id, e);
                }
                // Disconnect counts as goodbye
                let _ = msg_tx.send((client_id, ClientMessage::Goodbye));
                break;
            }
        }
    }
}
