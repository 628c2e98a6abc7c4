// Copyright 2021 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implementation of the Tokio I/O provider.

// NOTE: In this provider, I/O error handling is generally to exit the
// task. The run_with_respawning function acts as a supervisor that will
// respawn the TCP acceptor, the UDP receivers, the upstream receivers
// and the sweeper, possibly after a delay, if they exit with an error
// or a panic.

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::forward::Transport;
use crate::listener::{Listener, Reply};
use crate::message::MAX_MESSAGE_SIZE;

/// The size of the buffer client queries are received into over UDP.
const UDP_RECEIVE_BUFFER_SIZE: usize = 4096;

/// The default interval between sweeps of the forwarder's pending
/// queries.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// A Tokio I/O provider.
///
/// This provider uses asynchronous I/O and runs the listener by
/// spawning tasks on a Tokio runtime: one per client UDP socket, one
/// per client TCP listener (plus one per connection and one per UDP
/// query), one per upstream socket of the listener's forwarder, and a
/// periodic sweeper that times out unanswered queries.
///
/// The `TokioIoProvider` supports graceful shutdown. To initiate a
/// graceful shutdown, use the [`TokioShutdownController`] returned by
/// [`TokioIoProvider::start`].
pub struct TokioIoProvider {
    tcp_listeners: Vec<TcpListener>,
    udp_sockets: Vec<Arc<UdpSocket>>,
    sweep_interval: Duration,
}

impl TokioIoProvider {
    /// Creates a new `TokioIoProvider`. This call binds TCP and UDP
    /// sockets in preparation, but does not start serving. This
    /// function requires that the Tokio runtime be active.
    pub async fn bind<T, U>(tcp_addrs: T, udp_addrs: U) -> io::Result<Self>
    where
        T: IntoIterator<Item = SocketAddr>,
        U: IntoIterator<Item = SocketAddr>,
    {
        let mut tcp_listeners = Vec::new();
        for addr in tcp_addrs {
            let listener = TcpListener::bind(addr).await?;
            tcp_listeners.push(listener);
        }

        let mut udp_sockets = Vec::new();
        for addr in udp_addrs {
            let socket = UdpSocket::bind(addr).await?;
            udp_sockets.push(Arc::new(socket));
        }

        Ok(Self {
            tcp_listeners,
            udp_sockets,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        })
    }

    /// Sets how often the forwarder's pending queries are swept.
    pub fn set_sweep_interval(&mut self, interval: Duration) {
        self.sweep_interval = interval;
    }

    /// Returns the local addresses of the bound TCP listeners.
    pub fn tcp_local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.tcp_listeners.iter().map(TcpListener::local_addr).collect()
    }

    /// Returns the local addresses of the bound UDP sockets.
    pub fn udp_local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.udp_sockets.iter().map(|s| s.local_addr()).collect()
    }

    /// Starts serving on the active Tokio runtime.
    ///
    /// This spawns tasks on the active Tokio runtime and then returns
    /// a [`TokioShutdownController`] that can be used to shut down the
    /// tasks at a later time. (The [`TokioShutdownController`] must be
    /// held as long as the listener should be running, since dropping
    /// it will trigger shutdown.)
    pub fn start(self, listener: &Arc<Listener>) -> TokioShutdownController {
        let (shutdown_controller, shutdown_handle, service_shutdown_handle) =
            make_shutdown_channels();

        for tcp_listener in self.tcp_listeners {
            tokio::spawn(run_with_respawning(
                run_tcp_listener,
                shutdown_handle.clone(),
                listener.clone(),
                Arc::new(tcp_listener),
            ));
        }

        for udp_socket in self.udp_sockets {
            tokio::spawn(run_with_respawning(
                run_udp_receiver,
                shutdown_handle.clone(),
                listener.clone(),
                udp_socket,
            ));
        }

        // The upstream receivers and the sweeper are stopped only after
        // the client-facing tasks finish, since queries still in flight
        // depend on them.
        drop(shutdown_handle);
        for upstream_socket in listener.forwarder().upstream_sockets() {
            tokio::spawn(run_with_respawning(
                run_upstream_receiver,
                service_shutdown_handle.clone(),
                listener.clone(),
                upstream_socket.clone(),
            ));
        }

        tokio::spawn(run_with_respawning(
            run_sweeper,
            service_shutdown_handle,
            listener.clone(),
            self.sweep_interval,
        ));

        shutdown_controller
    }
}

/// How long to wait between respawns of a task. This is to prevent
/// tasks that crash immediately from using up significant CPU time.
const TASK_RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Runs a Tokio task, respawning it if it returns an I/O error, is
/// cancelled, or panics.
async fn run_with_respawning<F, G, S>(
    f: F,
    mut shutdown: ShutdownHandle,
    listener: Arc<Listener>,
    resource: S,
) where
    F: Fn(ShutdownHandle, Arc<Listener>, S) -> G,
    G: Future<Output = io::Result<()>> + Send + 'static,
    S: Clone,
{
    loop {
        let last_spawn_time = Instant::now();
        match tokio::spawn(f(shutdown.clone(), listener.clone(), resource.clone())).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => log_io_error(e),
            Err(_) => (), // The task panicked or was cancelled.
        }

        // If necessary, wait before respawning, but receive shutdown
        // requests immediately.
        let since_last_spawn = Instant::now().duration_since(last_spawn_time);
        if let Some(duration_to_wait) = TASK_RESPAWN_DELAY.checked_sub(since_last_spawn) {
            tokio::select! {
                _ = shutdown.request_receiver.recv() => return,
                _ = tokio::time::sleep(duration_to_wait) => (),
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CLIENT TCP                                                         //
////////////////////////////////////////////////////////////////////////

/// The TCP listener/accept loop.
async fn run_tcp_listener(
    mut shutdown: ShutdownHandle,
    listener: Arc<Listener>,
    tcp_listener: Arc<TcpListener>,
) -> io::Result<()> {
    loop {
        let (client, client_addr) = tokio::select! {
            _ = shutdown.request_receiver.recv() => return Ok(()),
            res = tcp_listener.accept() => res?,
        };
        let shutdown = shutdown.clone();
        let listener = listener.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(shutdown, &listener, client, client_addr).await {
                log_io_error(e);
            }
        });
    }
}

/// Handles a TCP connection. Queries are answered one at a time. A
/// client that shuts down its sending side still gets the reply to its
/// last query; if the connection is reset while a query is in flight,
/// the query is abandoned.
async fn handle_tcp_connection(
    mut shutdown: ShutdownHandle,
    listener: &Listener,
    mut socket: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()> {
    let mut received_buf = vec![0; 2 + MAX_MESSAGE_SIZE];
    let mut n_read = 0;

    loop {
        let received_len = match timeout(
            super::READ_MESSAGE_TIMEOUT,
            read_message_over_tcp(&mut socket, &mut received_buf, &mut n_read),
        )
        .await
        {
            Ok(Ok(Some(len))) => len,
            Ok(Ok(None)) => return Ok(()), // The connection was closed.
            Ok(Err(e)) => return Err(e),   // There was an I/O error.
            Err(_) => return Ok(()),       // The operation timed out.
        };

        // Dropping the handle_query future cancels the upstream query.
        let reply = tokio::select! {
            reply = listener.handle_query(
                &received_buf[2..received_len + 2],
                client_addr,
                Transport::Tcp,
            ) => reply,
            e = connection_reset(&socket) => {
                debug!("TCP connection from {client_addr} failed mid-query: {e}");
                return Ok(());
            }
        };

        match reply {
            Reply::Message(message) => {
                let len = u16::try_from(message.len())
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
                let mut framed = Vec::with_capacity(2 + message.len());
                framed.extend_from_slice(&len.to_be_bytes());
                framed.extend_from_slice(&message);
                socket.write_all(&framed).await?;
            }

            // Reply::None occurs when something was really malformed
            // (or a timeout is to go unanswered), so close the
            // connection.
            Reply::None => return Ok(()),
        }

        // We won't continue to service this connection if we are
        // shutting down.
        if matches!(
            shutdown.request_receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ) {
            return Ok(());
        }

        // Any leftover data is the start of the next message.
        if n_read > received_len + 2 {
            received_buf.copy_within(received_len + 2..n_read, 0);
            n_read -= received_len + 2;
        } else {
            n_read = 0;
        }
    }
}

/// Completes with the error once the connection on `socket` fails
/// (e.g., it is reset by the peer). End of stream and further data both
/// leave the connection usable for the reply, so then this never
/// completes.
async fn connection_reset(socket: &TcpStream) -> io::Error {
    let mut octet = [0; 1];
    match socket.peek(&mut octet).await {
        Err(e) => e,
        Ok(_) => future::pending().await,
    }
}

/// Reads a single DNS message (including the initial two-octet length
/// field) from a [`TcpStream`].
///
/// This function assumes that `*n_read` octets have already been read
/// into the buffer. It updates `*n_read` as it reads more data. It may
/// read data past the end of the message. When this function returns,
/// `*n_read` reflects the number of octets read into the buffer
/// (including the initial two-octet length field and any data read
/// after the end of the message), while the returned `usize` (if any)
/// is the size of the message itself (not including the initial length
/// field).
///
/// If this function returns `Ok(None)`, then the connection was closed
/// before a whole message could be read.
async fn read_message_over_tcp(
    socket: &mut TcpStream,
    buf: &mut [u8],
    n_read: &mut usize,
) -> io::Result<Option<usize>> {
    let mut received_len_opt = None;
    loop {
        // A previous call may have left the start of this message (or
        // all of it) in the buffer.
        if let Some(received_len) = received_len_opt {
            if *n_read >= received_len + 2 {
                return Ok(Some(received_len));
            }
        } else if *n_read >= 2 {
            let received_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if *n_read >= received_len + 2 {
                return Ok(Some(received_len));
            } else {
                received_len_opt = Some(received_len);
            }
        }

        let n_read_this_time = socket.read(&mut buf[*n_read..]).await?;

        // If we read nothing, then the client closed their side of
        // the connection.
        if n_read_this_time == 0 {
            return Ok(None);
        }
        *n_read += n_read_this_time;
    }
}

////////////////////////////////////////////////////////////////////////
// CLIENT UDP                                                         //
////////////////////////////////////////////////////////////////////////

/// The UDP receiver loop.
async fn run_udp_receiver(
    mut shutdown: ShutdownHandle,
    listener: Arc<Listener>,
    socket: Arc<UdpSocket>,
) -> io::Result<()> {
    loop {
        let mut received_buf = vec![0; UDP_RECEIVE_BUFFER_SIZE];

        // Receive a DNS message (or a shutdown request).
        let (received_len, src) = tokio::select! {
            _ = shutdown.request_receiver.recv() => return Ok(()),
            res = socket.recv_from(&mut received_buf) => res?,
        };

        // In a new Tokio task, forward the query and send the reply
        // (if any).
        let shutdown = shutdown.wait_sender.clone();
        let listener = listener.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let reply = listener
                .handle_query(&received_buf[..received_len], src, Transport::Udp)
                .await;
            if let Reply::Message(message) = reply {
                if let Err(e) = socket.send_to(&message, src).await {
                    log_io_error(e);
                }
            }

            // This ensures that the shutdown handle is moved into the
            // new task.
            drop(shutdown);
        });
    }
}

////////////////////////////////////////////////////////////////////////
// UPSTREAM RESPONSES AND SWEEPING                                    //
////////////////////////////////////////////////////////////////////////

/// Receives responses on one of the forwarder's upstream sockets.
async fn run_upstream_receiver(
    mut shutdown: ShutdownHandle,
    listener: Arc<Listener>,
    socket: Arc<UdpSocket>,
) -> io::Result<()> {
    let forwarder = listener.forwarder();
    let mut buf = vec![0; MAX_MESSAGE_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.request_receiver.recv() => return Ok(()),
            res = forwarder.receive(&socket, &mut buf) => {
                res?;
            }
        }
    }
}

/// Periodically purges pending queries that have timed out.
async fn run_sweeper(
    mut shutdown: ShutdownHandle,
    listener: Arc<Listener>,
    interval: Duration,
) -> io::Result<()> {
    let forwarder = listener.forwarder();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.request_receiver.recv() => return Ok(()),
            _ = ticker.tick() => {
                forwarder.sweep(Instant::now());
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// GRACEFUL SHUTDOWN                                                  //
////////////////////////////////////////////////////////////////////////

/// Controls the shutdown of a listener's Tokio tasks.
///
/// This type is used to shut down the Tokio tasks spawned by
/// [`TokioIoProvider::start`]. Use
/// [`TokioShutdownController::shut_down`] or its blocking variant,
/// [`TokioShutdownController::blocking_shut_down`], to initiate
/// shutdown and wait for its completion. Dropping the controller will
/// also trigger shutdown (but will not wait for it to complete).
///
/// Shutdown happens in two stages. First the client-facing tasks stop
/// accepting queries and finish the ones they have. Then the tasks
/// that serve the forwarder (the upstream receivers and the sweeper)
/// are stopped.
#[must_use]
pub struct TokioShutdownController {
    client_stage: ShutdownStage,
    service_stage: ShutdownStage,
}

/// The controller's end of one stage of shutdown.
struct ShutdownStage {
    request_sender: broadcast::Sender<()>,
    wait_receiver: mpsc::Receiver<()>,
}

impl TokioShutdownController {
    /// Requests that running tasks shut down, and then waits for them
    /// to terminate. Queries already being forwarded are finished
    /// first.
    pub async fn shut_down(self) {
        let Self {
            client_stage,
            service_stage,
        } = self;
        client_stage.finish().await;
        service_stage.finish().await;
    }

    /// The blocking variant of [`TokioShutdownController::shut_down`].
    pub fn blocking_shut_down(self) {
        let Self {
            client_stage,
            service_stage,
        } = self;
        client_stage.blocking_finish();
        service_stage.blocking_finish();
    }
}

impl ShutdownStage {
    async fn finish(mut self) {
        drop(self.request_sender);
        let _ = self.wait_receiver.recv().await;
    }

    fn blocking_finish(mut self) {
        drop(self.request_sender);
        let _ = self.wait_receiver.blocking_recv();
    }
}

/// A handle held by tasks to interact with the graceful shutdown
/// mechanism.
///
/// Tasks listen for the shutdown signal on `request_receiver`, which
/// is closed when the controller drops its sender. Shutdown completes
/// once every clone of `wait_sender` has been dropped, so every task
/// owns a `ShutdownHandle` (or at least its `wait_sender`).
struct ShutdownHandle {
    request_receiver: broadcast::Receiver<()>,
    wait_sender: mpsc::Sender<()>,
}

impl Clone for ShutdownHandle {
    fn clone(&self) -> Self {
        // A resubscribed receiver misses values already queued, but no
        // values are ever sent: only the closing of the channel
        // matters.
        ShutdownHandle {
            request_receiver: self.request_receiver.resubscribe(),
            wait_sender: self.wait_sender.clone(),
        }
    }
}

/// Produces a [`TokioShutdownController`] and the initial
/// [`ShutdownHandle`]s of its two stages: one for client-facing tasks
/// and one for the tasks serving the forwarder.
fn make_shutdown_channels() -> (TokioShutdownController, ShutdownHandle, ShutdownHandle) {
    let (client_stage, client_handle) = make_shutdown_stage();
    let (service_stage, service_handle) = make_shutdown_stage();
    let controller = TokioShutdownController {
        client_stage,
        service_stage,
    };
    (controller, client_handle, service_handle)
}

fn make_shutdown_stage() -> (ShutdownStage, ShutdownHandle) {
    let (request_sender, request_receiver) = broadcast::channel(1);
    let (wait_sender, wait_receiver) = mpsc::channel(1);
    let stage = ShutdownStage {
        request_sender,
        wait_receiver,
    };
    let handle = ShutdownHandle {
        request_receiver,
        wait_sender,
    };
    (stage, handle)
}

/// Logs an I/O error.
fn log_io_error(e: io::Error) {
    error!("I/O error: {e}");
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::forward::{Config, Forwarder, Upstream, Validator};
    use crate::listener::Upstreams;
    use crate::message::{Question, Rcode, Reader, Writer};
    use crate::rr::Type;

    fn query() -> Vec<u8> {
        let question = Question {
            qname: "io.example.test.".parse().unwrap(),
            qtype: Type::A,
            qclass: Class::IN,
        };
        let mut buf = vec![0; 512];
        let mut writer = Writer::try_from(buf.as_mut_slice()).unwrap();
        writer.set_id(0x0102);
        writer.set_rd(true);
        writer.add_question(&question).unwrap();
        let len = writer.finish();
        buf.truncate(len);
        buf
    }

    /// Starts a provider on loopback that forwards to an upstream which
    /// echoes queries back with the QR bit set after `delay`.
    async fn start_with_delay(
        delay: Duration,
    ) -> (TokioShutdownController, Arc<Listener>, SocketAddr, SocketAddr) {
        let upstream_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let upstream = Upstream::udp(upstream_socket.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = vec![0; 512];
            loop {
                let (len, source) = upstream_socket.recv_from(&mut buf).await.unwrap();
                let mut response = buf[..len].to_vec();
                response[2] |= 0x80;
                let socket = upstream_socket.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    socket.send_to(&response, source).await.unwrap();
                });
            }
        });

        let config = Config {
            timeout: Duration::from_secs(1),
            ..Config::default()
        };
        let forwarder = Forwarder::bind(config, Validator::default()).await.unwrap();
        let upstreams = Upstreams {
            primary: upstream,
            secondary: None,
        };
        let listener = Arc::new(Listener::new(forwarder, upstreams));
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let provider = TokioIoProvider::bind([loopback], [loopback]).await.unwrap();
        let tcp_addr = provider.tcp_local_addrs().unwrap()[0];
        let udp_addr = provider.udp_local_addrs().unwrap()[0];
        (provider.start(&listener), listener, tcp_addr, udp_addr)
    }

    async fn start() -> (TokioShutdownController, SocketAddr, SocketAddr) {
        let (controller, _, tcp_addr, udp_addr) = start_with_delay(Duration::ZERO).await;
        (controller, tcp_addr, udp_addr)
    }

    async fn write_framed(client: &mut TcpStream, message: &[u8]) {
        client.write_all(&(message.len() as u16).to_be_bytes()).await.unwrap();
        client.write_all(message).await.unwrap();
    }

    async fn read_framed(client: &mut TcpStream) -> Vec<u8> {
        let mut len_buf = [0; 2];
        timeout(Duration::from_secs(5), client.read_exact(&mut len_buf))
            .await
            .unwrap()
            .unwrap();
        let mut reply = vec![0; u16::from_be_bytes(len_buf) as usize];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn udp_queries_are_answered() {
        let (controller, _, udp_addr) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(), udp_addr).await.unwrap();
        let mut buf = vec![0; 512];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reader = Reader::try_from(&buf[..len]).unwrap();
        assert_eq!(reader.id(), 0x0102);
        assert!(reader.qr());
        controller.shut_down().await;
    }

    #[tokio::test]
    async fn tcp_queries_are_answered() {
        let (controller, tcp_addr, _) = start().await;
        let mut client = TcpStream::connect(tcp_addr).await.unwrap();
        write_framed(&mut client, &query()).await;
        let reply = read_framed(&mut client).await;
        assert_eq!(Reader::try_from(reply.as_slice()).unwrap().id(), 0x0102);

        drop(client);
        controller.shut_down().await;
    }

    #[tokio::test]
    async fn half_closed_tcp_client_still_gets_its_reply() {
        let (controller, _, tcp_addr, _) = start_with_delay(Duration::from_millis(100)).await;
        let mut client = TcpStream::connect(tcp_addr).await.unwrap();
        write_framed(&mut client, &query()).await;
        client.shutdown().await.unwrap();

        let reply = read_framed(&mut client).await;
        let reader = Reader::try_from(reply.as_slice()).unwrap();
        assert_eq!(reader.id(), 0x0102);
        assert_eq!(reader.rcode(), Rcode::NoError);

        // The server closes the connection after the reply.
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        controller.shut_down().await;
    }

    #[tokio::test]
    async fn reset_tcp_connection_cancels_its_query() {
        let (controller, listener, tcp_addr, _) =
            start_with_delay(Duration::from_millis(500)).await;
        let mut client = TcpStream::connect(tcp_addr).await.unwrap();
        write_framed(&mut client, &query()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.forwarder().pending(), 1);

        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.forwarder().pending(), 0);
        controller.shut_down().await;
    }

    #[tokio::test]
    async fn queries_in_flight_are_answered_during_shutdown() {
        let (controller, _, _, udp_addr) = start_with_delay(Duration::from_millis(300)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(), udp_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        controller.shut_down().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut buf = vec![0; 512];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reader = Reader::try_from(&buf[..len]).unwrap();
        assert_eq!(reader.id(), 0x0102);
        assert_eq!(reader.rcode(), Rcode::NoError);
    }
}
