//! Observer side: bind the profiler over TCP and read batches.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use log::info;

use cycleprof_types::{parse_batch, ProfileRecord, ServiceInfo, SubscriberHandle};

use crate::framing::{read_message, write_message};
use crate::protocol::{ClientMessage, ServerMessage};

/// A connection whose Hello was sent but not answered yet.
pub struct PendingClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl PendingClient {
    /// Wait for the host's answer to the Hello.
    pub fn welcome(mut self) -> io::Result<ProfilerClient> {
        match read_message::<_, ServerMessage>(&mut self.reader)? {
            ServerMessage::Welcome {
                subscriber,
                service,
            } => {
                info!(
                    target: "profiler::net",
                    "bound {} v{} as {}",
                    service.name, service.version, subscriber
                );
                Ok(ProfilerClient {
                    reader: self.reader,
                    writer: self.writer,
                    subscriber,
                    service,
                    shut_down: false,
                })
            }
            ServerMessage::Rejected { reason } => {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, reason))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected Welcome, got {:?}", other),
            )),
        }
    }
}

/// A bound observer.
pub struct ProfilerClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    subscriber: SubscriberHandle,
    service: ServiceInfo,
    shut_down: bool,
}

impl ProfilerClient {
    /// Connect and bind, waiting for the host to accept.
    pub fn connect(addr: &str, client_name: &str) -> io::Result<Self> {
        Self::hello(addr, client_name)?.welcome()
    }

    /// Connect and send Hello without waiting for the answer.
    pub fn hello(addr: &str, client_name: &str) -> io::Result<PendingClient> {
        info!(target: "profiler::net", "connecting to {}", addr);
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;

        let mut writer = BufWriter::new(stream);
        write_message(
            &mut writer,
            &ClientMessage::Hello {
                client_name: client_name.to_string(),
            },
        )?;
        Ok(PendingClient {
            reader: BufReader::new(read_stream),
            writer,
        })
    }

    pub fn subscriber(&self) -> SubscriberHandle {
        self.subscriber
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    /// Fail reads that wait longer than `timeout`.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }

    /// Next raw batch. `None` once the host shut down.
    pub fn recv_batch(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.shut_down {
            return Ok(None);
        }
        loop {
            match read_message::<_, ServerMessage>(&mut self.reader)? {
                ServerMessage::Profile { batch } => return Ok(Some(batch)),
                ServerMessage::Shutdown => {
                    self.shut_down = true;
                    return Ok(None);
                }
                other => {
                    log::debug!(target: "profiler::net", "ignoring {:?}", other);
                }
            }
        }
    }

    /// Next batch, decoded.
    pub fn recv_records(&mut self) -> io::Result<Option<Vec<ProfileRecord>>> {
        match self.recv_batch()? {
            Some(batch) => parse_batch(&batch)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }

    /// Unbind and close the connection.
    pub fn goodbye(mut self) -> io::Result<()> {
        write_message(&mut self.writer, &ClientMessage::Goodbye)?;
        self.writer.get_ref().shutdown(Shutdown::Write)
    }
}
