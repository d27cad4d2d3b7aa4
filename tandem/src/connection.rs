// Copyright © 2024 Tandem Project Developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # CONNECTION SERVICES
//!
//! Defines the paired connection object visible to users on both sides of
//! the [TMS] protocol.
//!
//! A [Connection] owns a tandem of two TCP sockets bound together by the
//! pairing handshake: the heartbeat channel, private to a background worker
//! which continuously measures the round-trip latency of the link, and the
//! main channel, over which user threads exchange framed messages.
//!
//! ---------------------------------------------------------------------------
//!
//! To use the [Connection Services]:
//!
//! - Initiate the pairing handshake against a remote [Listener] with the
//!   [Connect Procedure], or obtain an already-paired [Connection] from the
//!   [Accept Procedure].
//! - Exchange messages with the [Send Procedure] and [Receive Procedure].
//! - Observe liveness with the [Availability Check], [Connection Check],
//!   and [Ping Observation].
//! - Break the connection with the [Stop Procedure].
//!
//! ---------------------------------------------------------------------------
//!
//! [TMS]:                 crate
//! [Connection Services]: crate::connection
//! [Connection]:          Connection
//! [Listener]:            crate::listener::Listener
//! [Connect Procedure]:   Connection::connect
//! [Accept Procedure]:    crate::listener::Listener::accept
//! [Send Procedure]:      Connection::send
//! [Receive Procedure]:   Connection::receive
//! [Availability Check]:  Connection::is_available
//! [Connection Check]:    Connection::is_connected
//! [Ping Observation]:    Connection::ping
//! [Stop Procedure]:      Connection::stop

use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use socket2::{SockRef, TcpKeepalive};

use crate::{Error, ErrorKind, LogContext, LogPriority, LoggingHook, ParameterSettings};
use crate::primitive;
use crate::primitive::{BLOCK_SIZE, FIELD_WIDTH};

/// ## CONNECTION ROLE
///
/// Determines which half of the heartbeat protocol the background worker of
/// a [Connection] runs.
///
/// [Connection]: Connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
  /// ### INITIATOR
  ///
  /// The side which performed the [Connect Procedure]. Its worker waits for
  /// ping observations from the other side and reflects its own read delay
  /// back.
  ///
  /// [Connect Procedure]: Connection::connect
  Initiator,

  /// ### ACCEPTOR
  ///
  /// The side which accepted the pairing. Its worker paces the heartbeat,
  /// emitting the current ping observation every loop period and computing
  /// the next one from the reflected delay.
  Acceptor,
}

/// ## SHARED HEARTBEAT STATE
///
/// The two cells contended between user threads and the heartbeat worker.
/// Both sides hold a handle to the same reference-counted cell, so moving
/// the [Connection] never invalidates the worker's view.
///
/// [Connection]: Connection
struct Shared {
  /// ### MILLISECOND PING
  ///
  /// The last published one-way latency observation. The sentinel `-1`
  /// means the connection is dead.
  ms_ping: i64,

  /// ### ACTIVE FLAG
  ///
  /// Cleared exactly once, by the [Stop Procedure]. The worker exits on
  /// its next wakeup after observing the cleared flag.
  ///
  /// [Stop Procedure]: Connection::stop
  is_active: bool,
}

type SharedCell = Arc<Mutex<Shared>>;

/// ## CONNECTION
///
/// A live pairing with one remote peer: the main channel carrying framed
/// messages, the heartbeat channel carrying the liveness protocol, and the
/// background worker driving whichever heartbeat half the [Connection Role]
/// demands.
///
/// A [Connection] which has been stopped, whether by the [Stop Procedure]
/// or by the heartbeat declaring death, never becomes usable again; a new
/// pairing must be performed.
///
/// [Connection]:      Connection
/// [Connection Role]: ConnectionRole
/// [Stop Procedure]:  Connection::stop
pub struct Connection {
  /// ### MAIN CHANNEL
  ///
  /// Carries framed application messages and nothing else.
  main: TcpStream,

  /// ### HEARTBEAT CHANNEL
  ///
  /// Carries the liveness protocol and nothing else. Read and written only
  /// by the worker; the owning side touches it only to shut it down.
  heartbeat: TcpStream,

  /// ### SHARED STATE
  ///
  /// One handle of the cell contended with the worker.
  shared: SharedCell,

  /// ### HEARTBEAT WORKER
  ///
  /// Joined exactly once, during the [Stop Procedure].
  ///
  /// [Stop Procedure]: Connection::stop
  worker: Option<JoinHandle<()>>,

  settings: ParameterSettings,
  logger: LoggingHook,
  role: ConnectionRole,
  peer: SocketAddr,
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("main", &self.main)
      .field("heartbeat", &self.heartbeat)
      .field("settings", &self.settings)
      .field("role", &self.role)
      .field("peer", &self.peer)
      .finish()
  }
}

/// ## PAIRING PROCEDURES
///
/// Encapsulates the parts of the [Connection]'s functionality dealing with
/// establishing the paired channels.
///
/// - [Connect Procedure]
///
/// [Connection]:        Connection
/// [Connect Procedure]: Connection::connect
impl Connection {
  /// ### CONNECT PROCEDURE
  ///
  /// Performs the initiating side of the pairing handshake against a remote
  /// [Listener]:
  ///
  /// - Connect the heartbeat socket and announce an init arrival.
  /// - Receive the pairing token; a token of zero means the listener
  ///   refused the arrival.
  /// - Connect the main socket, present the token, and await the one-byte
  ///   run signal.
  ///
  /// -------------------------------------------------------------------------
  ///
  /// Upon completion, the heartbeat worker is started with the [Initiator]
  /// role and the [Connection] is live. Every intermediate failure closes
  /// all sockets already opened in the attempt.
  ///
  /// [Listener]:   crate::listener::Listener
  /// [Initiator]:  ConnectionRole::Initiator
  /// [Connection]: Connection
  pub fn connect(
    address: &str,
    port: u16,
    settings: ParameterSettings,
    logger: LoggingHook,
  ) -> Result<Connection, Error> {
    let log: LogContext = LogContext::new("TANDEM CONNECTION".to_string(), "CONSTRUCTOR", &logger);
    log.log(&format!("Trying to pair with {}:{}", address, port), LogPriority::Info);

    // RESOLVE
    //
    // The textual address must be converted into a socket address before
    // either channel can be opened.
    let socket: SocketAddr = (address, port)
      .to_socket_addrs()
      .map_err(|error| Error::from_io(ErrorKind::Connection, &error).reported(&logger))?
      .next()
      .ok_or_else(|| Error::new(ErrorKind::Connection).reported(&logger))?;

    // HEARTBEAT CHANNEL
    //
    // The first socket of the tandem. Announcing the init mode tells the
    // listener to issue a fresh pairing token.
    let heartbeat: TcpStream = TcpStream::connect_timeout(&socket, settings.ping_threshold)
      .map_err(|error| Error::from_io(ErrorKind::Connection, &error).reported(&logger))?;
    log.log("Heartbeat channel connected", LogPriority::Debug);
    write_exactly(&heartbeat, &primitive::encode_field(0), FIELD_WIDTH)
      .map_err(|error| error.reported(&logger))?;

    // TOKEN
    //
    // The listener answers an init arrival with the token under which it
    // filed the heartbeat socket. Zero is the refusal sentinel.
    if primitive::wait_for_data(&heartbeat, settings.ping_threshold)
      .map_err(|error| error.reported(&logger))?
      .is_none()
    {
      return Err(Error::new(ErrorKind::Acceptance).reported(&logger));
    }
    let token: i64 = match primitive::blocking_recv(&heartbeat, FIELD_WIDTH) {
      Err(error) => return Err(error.reported(&logger)),
      Ok(bytes) if bytes.is_empty() => return Err(Error::new(ErrorKind::ConnectionBreak).reported(&logger)),
      Ok(bytes) if bytes.len() < FIELD_WIDTH => return Err(Error::leak(ErrorKind::Receiving).reported(&logger)),
      Ok(bytes) => primitive::parse_field(&bytes).ok_or_else(|| Error::new(ErrorKind::Receiving).reported(&logger))?,
    };
    if token == 0 {
      return Err(Error::new(ErrorKind::Acceptance).reported(&logger));
    }
    log.log(&format!("Pairing token {} received", token), LogPriority::Debug);

    // MAIN CHANNEL
    //
    // The second socket of the tandem. Large messages may keep this channel
    // busy for long stretches, so the keep-alive idle option guards it at
    // the transport level while the heartbeat channel guards the pairing.
    let main: TcpStream = TcpStream::connect_timeout(&socket, settings.ping_threshold)
      .map_err(|error| Error::from_io(ErrorKind::Connection, &error).reported(&logger))?;
    SockRef::from(&main)
      .set_tcp_keepalive(&TcpKeepalive::new().with_time(settings.ping_threshold))
      .map_err(|error| Error::from_io(ErrorKind::SocketCreation, &error).reported(&logger))?;
    log.log("Main channel connected", LogPriority::Debug);

    // PRESENT TOKEN
    //
    // Presenting the token on the main socket lets the listener bind the
    // two arrivals into one pairing.
    write_exactly(&main, &primitive::encode_field(token), FIELD_WIDTH)
      .map_err(|error| error.reported(&logger))?;

    // RUN SIGNAL
    //
    // The listener confirms the completed pairing with a single byte. Any
    // other answer, or none at all, means the pairing was refused.
    if primitive::wait_for_data(&main, settings.ping_threshold)
      .map_err(|error| error.reported(&logger))?
      .is_none()
    {
      return Err(Error::new(ErrorKind::Acceptance).reported(&logger));
    }
    let confirmation: Vec<u8> = primitive::blocking_recv(&main, 1)
      .map_err(|error| error.reported(&logger))?;
    if confirmation != b"1" {
      return Err(Error::new(ErrorKind::Acceptance).reported(&logger));
    }

    log.log("Pairing complete", LogPriority::Info);
    Connection::from_pair(heartbeat, main, ConnectionRole::Initiator, settings, logger)
  }

  /// ### PAIRED CONSTRUCTION
  ///
  /// Binds an already-handshaken pair of sockets into a live [Connection]
  /// and starts the heartbeat worker for the given role.
  ///
  /// [Connection]: Connection
  pub(crate) fn from_pair(
    heartbeat: TcpStream,
    main: TcpStream,
    role: ConnectionRole,
    settings: ParameterSettings,
    logger: LoggingHook,
  ) -> Result<Connection, Error> {
    let peer: SocketAddr = main
      .peer_addr()
      .map_err(|error| Error::from_io(ErrorKind::Connection, &error).reported(&logger))?;

    // SHARED CELL
    //
    // One handle stays with the connection, one moves into the worker. The
    // ping starts at zero: live, but not yet measured.
    let shared: SharedCell = Arc::new(Mutex::new(Shared {
      ms_ping: 0,
      is_active: true,
    }));

    // WORKER HANDLE OF THE HEARTBEAT CHANNEL
    //
    // The worker reads and writes through its own handle; the owning side
    // keeps the original purely so the stop procedure can shut it down and
    // wake the worker out of any bounded wait.
    let worker_stream: TcpStream = heartbeat
      .try_clone()
      .map_err(|error| Error::from_io(ErrorKind::SocketCreation, &error).reported(&logger))?;
    let worker_shared: SharedCell = shared.clone();
    let worker_log: LogContext = LogContext::new(
      format!("TANDEM CONNECTION ( {} )", peer),
      "HEARTBEAT LOOP",
      &logger,
    );
    let worker: JoinHandle<()> = thread::Builder::new()
      .name("tandem-heartbeat".to_string())
      .spawn(move || match role {
        ConnectionRole::Initiator => initiator_loop(worker_stream, worker_shared, settings, worker_log),
        ConnectionRole::Acceptor => responder_loop(worker_stream, worker_shared, settings, worker_log),
      })
      .map_err(|error| Error::from_io(ErrorKind::Multithreading, &error).reported(&logger))?;

    Ok(Connection {
      main,
      heartbeat,
      shared,
      worker: Some(worker),
      settings,
      logger,
      role,
      peer,
    })
  }
}

/// ## MESSAGE EXCHANGE PROCEDURES
///
/// Encapsulates the parts of the [Connection]'s functionality dealing with
/// exchanging framed messages on the main channel.
///
/// - [Send Procedure]
/// - [Receive Procedure]
/// - [Availability Check]
///
/// [Connection]:         Connection
/// [Send Procedure]:     Connection::send
/// [Receive Procedure]:  Connection::receive
/// [Availability Check]: Connection::is_available
impl Connection {
  /// ### SEND PROCEDURE
  ///
  /// Frames the given bytes onto the main channel: a control block
  /// announcing the block counts, the full blocks, and the trailer with its
  /// reserved padding byte.
  ///
  /// -------------------------------------------------------------------------
  ///
  /// The [Connection] must pass the [Connection Check] to use this
  /// procedure; otherwise, and whenever the platform reports the peer gone,
  /// the connection is stopped and [Connection Break] is returned. A
  /// transfer cut short by the platform is [Sending] with the message-leak
  /// flag.
  ///
  /// [Connection]:       Connection
  /// [Connection Check]: Connection::is_connected
  /// [Connection Break]: ErrorKind::ConnectionBreak
  /// [Sending]:          ErrorKind::Sending
  pub fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
    let log: LogContext = self.context("SENDER");
    log.log("Trying to send message", LogPriority::Info);

    // CONNECTION CHECK
    //
    // A connection the heartbeat has declared dead must not advance the
    // byte stream. The terminal state is made clean before reporting.
    if !self.is_connected() {
      self.stop();
      return Err(Error::new(ErrorKind::ConnectionBreak).reported(&self.logger));
    }

    let full_blocks: usize = bytes.len() / BLOCK_SIZE;
    let remainder: usize = bytes.len() % BLOCK_SIZE;
    log.log(
      &format!(
        "Framing {} bytes as {} full blocks and a {} byte trailer",
        bytes.len(),
        full_blocks,
        remainder + 1
      ),
      LogPriority::Debug,
    );
    match send_frame(&self.main, bytes, full_blocks, remainder) {
      Ok(()) => {
        log.log("Message sent", LogPriority::Info);
        Ok(())
      }
      Err(error) => Err(self.classified(error)),
    }
  }

  /// ### RECEIVE PROCEDURE
  ///
  /// Awaits one framed message on the main channel for up to the given
  /// timeout. A zero timeout is a non-blocking poll.
  ///
  /// -------------------------------------------------------------------------
  ///
  /// A timeout on a live connection returns [None] and does not disturb the
  /// connection. A timeout on a dead connection, and any transfer the
  /// platform reports as broken, stops the connection and returns
  /// [Connection Break]. A transfer cut short is [Receiving] with the
  /// message-leak flag.
  ///
  /// [Connection Break]: ErrorKind::ConnectionBreak
  /// [Receiving]:        ErrorKind::Receiving
  pub fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
    let log: LogContext = self.context("RECEIVER");
    log.log("Trying to receive message", LogPriority::Info);
    match primitive::wait_for_data(&self.main, timeout) {
      Err(error) => Err(self.classified(error)),
      Ok(None) => {
        // TIMEOUT
        //
        // Nothing arrived. Whether that is benign depends on whether the
        // heartbeat still vouches for the peer.
        if !self.is_connected() {
          self.stop();
          return Err(Error::new(ErrorKind::ConnectionBreak).reported(&self.logger));
        }
        log.log("No message arrived before the timeout", LogPriority::Debug);
        Ok(None)
      }
      Ok(Some(_)) => match receive_frame(&self.main) {
        Ok(message) => {
          log.log(&format!("Received {} bytes", message.len()), LogPriority::Info);
          Ok(Some(message))
        }
        Err(error) => Err(self.classified(error)),
      }
    }
  }

  /// ### AVAILABILITY CHECK
  ///
  /// Polls the main channel for a waiting message without blocking.
  ///
  /// A dead [Connection] fails the check with [Connection Break] and is
  /// left stopped.
  ///
  /// [Connection]:       Connection
  /// [Connection Break]: ErrorKind::ConnectionBreak
  pub fn is_available(&mut self) -> Result<bool, Error> {
    let log: LogContext = self.context("AVAILABILITY CHECKER");
    log.log("Trying to check if data is available", LogPriority::Info);
    if !self.is_connected() {
      self.stop();
      return Err(Error::new(ErrorKind::ConnectionBreak).reported(&self.logger));
    }
    match primitive::wait_for_data(&self.main, Duration::ZERO) {
      Ok(answer) => Ok(answer.is_some()),
      Err(error) => Err(self.classified(error)),
    }
  }

  /// ### BREAK CLASSIFICATION
  ///
  /// Routes an exchange failure: a [Connection Break] stops the connection
  /// before the error propagates, so the caller always observes a clean
  /// terminal state. Every failure is reported through the hook.
  ///
  /// [Connection Break]: ErrorKind::ConnectionBreak
  fn classified(&mut self, error: Error) -> Error {
    if error.kind() == ErrorKind::ConnectionBreak {
      self.stop();
    }
    error.reported(&self.logger)
  }
}

/// ## STATE OBSERVATION AND TERMINATION PROCEDURES
///
/// - [Connection Check]
/// - [Ping Observation]
/// - [Stop Procedure]
///
/// [Connection Check]: Connection::is_connected
/// [Ping Observation]: Connection::ping
/// [Stop Procedure]:   Connection::stop
impl Connection {
  /// ### CONNECTION CHECK
  ///
  /// Whether the [Connection] is usable: still active and with a
  /// non-negative ping observation.
  ///
  /// [Connection]: Connection
  pub fn is_connected(&self) -> bool {
    let shared = self.shared.lock().unwrap();
    shared.is_active && shared.ms_ping >= 0
  }

  /// ### PING OBSERVATION
  ///
  /// The last published one-way latency in milliseconds, or `-1` once the
  /// heartbeat has declared the connection dead.
  pub fn ping(&self) -> i64 {
    self.shared.lock().unwrap().ms_ping
  }

  /// ### CONNECTION ROLE
  ///
  /// Which side of the pairing this [Connection] is.
  ///
  /// [Connection]: Connection
  pub fn role(&self) -> ConnectionRole {
    self.role
  }

  /// ### PEER ADDRESS
  ///
  /// The remote address of the main channel.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer
  }

  /// ### PARAMETER SETTINGS
  ///
  /// The settings this [Connection] and its heartbeat worker abide by.
  ///
  /// [Connection]: Connection
  pub fn settings(&self) -> ParameterSettings {
    self.settings
  }

  /// ### STOP PROCEDURE
  ///
  /// Makes the [Connection] terminal: clears the active flag, shuts down
  /// both channels so every bounded wait returns immediately, and joins the
  /// heartbeat worker. Calling it again is a no-op.
  ///
  /// [Connection]: Connection
  pub fn stop(&mut self) {
    // CLEAR SHARED STATE
    //
    // Performed under the mutex so the worker observes the flag and the
    // sentinel together.
    let was_active: bool = {
      let mut shared = self.shared.lock().unwrap();
      let was_active: bool = shared.is_active;
      shared.is_active = false;
      shared.ms_ping = -1;
      was_active
    };
    if !was_active && self.worker.is_none() {
      return;
    }

    let log: LogContext = self.context("CONNECTION CLOSER");
    log.log("Trying to close connection", LogPriority::Info);

    // SHUT DOWN BOTH CHANNELS
    //
    // Both sockets of the tandem close together. The heartbeat shutdown
    // doubles as the wakeup for a worker suspended in a bounded wait.
    let _ = self.main.shutdown(Shutdown::Both);
    let _ = self.heartbeat.shutdown(Shutdown::Both);

    // JOIN THE WORKER
    //
    // Exactly once. The worker exits on its next wakeup after the flag was
    // cleared, bounded by its own wait timeouts.
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }

    log.log("Disconnected", LogPriority::Info);
  }

  fn context(&self, action: &'static str) -> LogContext {
    LogContext::new(format!("TANDEM CONNECTION ( {} )", self.peer), action, &self.logger)
  }
}
impl Drop for Connection {
  fn drop(&mut self) {
    self.stop();
  }
}

/// ## FRAME TRANSFER
///
/// Writes one framed message: the control block, the full blocks, and the
/// trailer of `remainder + 1` bytes whose final byte is reserved padding.
fn send_frame(stream: &TcpStream, bytes: &[u8], full_blocks: usize, remainder: usize) -> Result<(), Error> {
  write_exactly(stream, &primitive::encode_control(full_blocks, remainder), 2 * FIELD_WIDTH)?;
  for block in bytes[..full_blocks * BLOCK_SIZE].chunks(BLOCK_SIZE) {
    write_exactly(stream, block, BLOCK_SIZE)?;
  }
  write_exactly(stream, &bytes[full_blocks * BLOCK_SIZE..], remainder + 1)
}

/// ## FRAME RECEPTION
///
/// Reads one framed message, dropping the reserved padding byte of the
/// trailer.
fn receive_frame(stream: &TcpStream) -> Result<Vec<u8>, Error> {
  let control: Vec<u8> = read_exactly(stream, 2 * FIELD_WIDTH)?;
  let (full_blocks, remainder) = primitive::parse_control(&control).ok_or(Error::new(ErrorKind::Receiving))?;
  let mut message: Vec<u8> = Vec::new();
  for _ in 0..full_blocks {
    message.extend_from_slice(&read_exactly(stream, BLOCK_SIZE)?);
  }
  let trailer: Vec<u8> = read_exactly(stream, remainder + 1)?;
  message.extend_from_slice(&trailer[..remainder]);
  Ok(message)
}

/// ## EXACT WRITE
///
/// Classifies the result of a [Blocking Send]: a raw count short of the
/// frame's requirement is a message leak.
///
/// [Blocking Send]: primitive::blocking_send
fn write_exactly(stream: &TcpStream, bytes: &[u8], length: usize) -> Result<(), Error> {
  if primitive::blocking_send(stream, bytes, length)? < length {
    return Err(Error::leak(ErrorKind::Sending));
  }
  Ok(())
}

/// ## EXACT READ
///
/// Classifies the result of a [Blocking Receive]: an empty result is the
/// peer gone, a short one is a message leak.
///
/// [Blocking Receive]: primitive::blocking_recv
fn read_exactly(stream: &TcpStream, length: usize) -> Result<Vec<u8>, Error> {
  let bytes: Vec<u8> = primitive::blocking_recv(stream, length)?;
  if bytes.is_empty() && length > 0 {
    return Err(Error::new(ErrorKind::ConnectionBreak));
  }
  if bytes.len() < length {
    return Err(Error::leak(ErrorKind::Receiving));
  }
  Ok(bytes)
}

/// ## FIELD READ
///
/// One full-width field, or [None] on any shortfall. The heartbeat loops
/// treat every shortfall alike.
fn read_field(stream: &TcpStream) -> Option<i64> {
  match primitive::blocking_recv(stream, FIELD_WIDTH) {
    Ok(bytes) if bytes.len() == FIELD_WIDTH => primitive::parse_field(&bytes),
    _ => None,
  }
}

/// ## DEATH DECLARATION
///
/// Publishes the dead sentinel. The next user call observes it through the
/// [Connection Check] and surfaces a single [Connection Break].
///
/// [Connection Check]: Connection::is_connected
/// [Connection Break]: ErrorKind::ConnectionBreak
fn declare_dead(shared: &SharedCell, log: &LogContext) {
  shared.lock().unwrap().ms_ping = -1;
  log.log("Heartbeat lost, connection declared dead", LogPriority::Warning);
}

/// ## HEARTBEAT RESPONDER LOOP
///
/// The pacing half, run by the [Acceptor] side. Every loop period it emits
/// the current ping observation, awaits the reflected delay, and publishes
/// the next observation as half the round trip net of the reflected delay.
///
/// Errors never leave this thread: every failure publishes the dead
/// sentinel and ends the loop.
///
/// [Acceptor]: ConnectionRole::Acceptor
fn responder_loop(stream: TcpStream, shared: SharedCell, settings: ParameterSettings, log: LogContext) {
  log.log("Heartbeat responder started", LogPriority::Debug);
  loop {
    // SNAPSHOT
    //
    // Flag and observation are read together, under the mutex. A cleared
    // flag is the clean exit.
    let current_ping: i64 = {
      let shared = shared.lock().unwrap();
      if !shared.is_active {
        break;
      }
      shared.ms_ping
    };

    // EMIT
    let send_time: Instant = Instant::now();
    if write_exactly(&stream, &primitive::encode_field(current_ping), FIELD_WIDTH).is_err() {
      declare_dead(&shared, &log);
      return;
    }

    // AWAIT THE REFLECTION
    //
    // The other side owes a delay field within the loop period plus the
    // ping threshold. Silence beyond that is death.
    match primitive::wait_for_data(&stream, settings.loop_period + settings.ping_threshold) {
      Ok(Some(_)) => {}
      Ok(None) | Err(_) => {
        declare_dead(&shared, &log);
        return;
      }
    }
    let reported_delay: i64 = match read_field(&stream) {
      Some(delay) => delay,
      None => {
        declare_dead(&shared, &log);
        return;
      }
    };
    let round_trip: i64 = send_time.elapsed().as_millis() as i64;

    // PUBLISH
    //
    // Half the round trip net of the time the other side spent between
    // readability and its answer. Clamped at zero: the dead sentinel must
    // never be produced by arithmetic.
    let observed: i64 = ((round_trip - reported_delay) / 2).max(0);
    {
      let mut shared = shared.lock().unwrap();
      if !shared.is_active {
        break;
      }
      shared.ms_ping = observed;
    }

    thread::sleep(settings.loop_period);
  }
  log.log("Heartbeat responder stopped", LogPriority::Debug);
}

/// ## HEARTBEAT INITIATOR LOOP
///
/// The reflecting half, run by the [Initiator] side. It waits for the
/// responder's ping observation, publishes it, and reflects its own read
/// delay back. Silence longer than the ping threshold is death.
///
/// Errors never leave this thread: every failure publishes the dead
/// sentinel and ends the loop.
///
/// [Initiator]: ConnectionRole::Initiator
fn initiator_loop(stream: TcpStream, shared: SharedCell, settings: ParameterSettings, log: LogContext) {
  log.log("Heartbeat initiator started", LogPriority::Debug);
  let mut last_contact: Instant = Instant::now();
  loop {
    // AWAIT THE NEXT OBSERVATION
    //
    // The wait is bounded by twice the loop period so the active flag is
    // rechecked well inside the ping threshold.
    let wait_entry: Instant = Instant::now();
    let waited: Option<Duration> = match primitive::wait_for_data(&stream, settings.loop_period * 2) {
      Ok(waited) => waited,
      Err(_) => {
        declare_dead(&shared, &log);
        return;
      }
    };

    // ACTIVE CHECK
    if !shared.lock().unwrap().is_active {
      break;
    }

    let elapsed: Duration = match waited {
      None => {
        // SILENCE
        //
        // Tolerable until the ping threshold has passed since the last
        // completed exchange.
        if last_contact.elapsed() > settings.ping_threshold {
          declare_dead(&shared, &log);
          return;
        }
        continue;
      }
      Some(elapsed) => elapsed,
    };

    // READ AND PUBLISH THE OBSERVATION
    let observed_ping: i64 = match read_field(&stream) {
      Some(ping) => ping,
      None => {
        declare_dead(&shared, &log);
        return;
      }
    };
    {
      let mut shared = shared.lock().unwrap();
      if !shared.is_active {
        break;
      }
      shared.ms_ping = observed_ping;
    }

    // REFLECT THE DELAY
    //
    // The time spent between readability and this answer, which the
    // responder subtracts from its round-trip measurement.
    let delay: i64 = wait_entry.elapsed().saturating_sub(elapsed).as_millis() as i64;
    if write_exactly(&stream, &primitive::encode_field(delay), FIELD_WIDTH).is_err() {
      declare_dead(&shared, &log);
      return;
    }
    last_contact = Instant::now();
  }
  log.log("Heartbeat initiator stopped", LogPriority::Debug);
}
