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

//! # LISTENER SERVICES
//!
//! Defines the passive side of the [TMS] pairing handshake.
//!
//! A [Listener] accepts raw TCP arrivals on a background loop and classifies
//! each by its first full-width field: an init arrival is filed in the
//! pending table under a freshly issued one-shot token, and a pairing
//! arrival presenting a filed token is bound to its partner into a live
//! [Connection], queued for the [Accept Procedure] to hand out.
//!
//! ---------------------------------------------------------------------------
//!
//! To use the [Listener Services]:
//!
//! - Create a [Listener] with the [New Listener] function.
//! - Obtain paired [Connection]s with the [Accept Procedure].
//! - Shut down with the [Close Listener Procedure].
//!
//! ---------------------------------------------------------------------------
//!
//! [TMS]:                      crate
//! [Listener Services]:        crate::listener
//! [Listener]:                 Listener
//! [New Listener]:             Listener::new
//! [Accept Procedure]:         Listener::accept
//! [Close Listener Procedure]: Listener::close_listener
//! [Connection]:               crate::connection::Connection

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::Ordering::Relaxed;
use std::thread;
use std::thread::JoinHandle;
use atomic::Atomic;
use bytemuck::NoUninit;
use socket2::{Domain, Protocol, Socket, Type};

use crate::{Error, ErrorKind, LogContext, LogPriority, LoggingHook, ParameterSettings};
use crate::connection::{Connection, ConnectionRole};
use crate::primitive;
use crate::primitive::FIELD_WIDTH;

/// ## CLIENT BOUND
///
/// The listen backlog and the bound of the accepted-connection semaphore.
const CLIENT_BOUND: usize = 1024;

/// ## LISTENER STATE
///
/// Whether the [Listener] is still accepting arrivals.
///
/// [Listener]: Listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum ListenerState {
  /// ### OPEN
  ///
  /// The accept loop is running and arrivals are being paired.
  Open,

  /// ### CLOSED
  ///
  /// The [Close Listener Procedure] has run. A closed [Listener] never
  /// reopens.
  ///
  /// [Listener]:                 Listener
  /// [Close Listener Procedure]: Listener::close_listener
  Closed,
}
impl Default for ListenerState {
  /// ### DEFAULT LISTENER STATE
  ///
  /// Provides the [OPEN] state by default.
  ///
  /// [OPEN]: ListenerState::Open
  fn default() -> Self {
    ListenerState::Open
  }
}

/// ## COUNTING SEMAPHORE
///
/// Tracks readiness of the accepted queue: one permit per queued
/// [Connection], plus the single shutdown permit released by the
/// [Close Listener Procedure].
///
/// [Connection]:               crate::connection::Connection
/// [Close Listener Procedure]: Listener::close_listener
struct Semaphore {
  permits: Mutex<usize>,
  available: Condvar,
}
impl Semaphore {
  fn new() -> Self {
    Semaphore {
      permits: Mutex::new(0),
      available: Condvar::new(),
    }
  }

  fn release(&self) {
    let mut permits = self.permits.lock().unwrap();
    if *permits < CLIENT_BOUND {
      *permits += 1;
    }
    self.available.notify_one();
  }

  fn acquire(&self) {
    let mut permits = self.permits.lock().unwrap();
    while *permits == 0 {
      permits = self.available.wait(permits).unwrap();
    }
    *permits -= 1;
  }
}

/// ## SHARED LISTENER STATE
///
/// Everything the accept loop and the user-facing [Listener] handle
/// contend on.
///
/// [Listener]: Listener
struct ListenerShared {
  /// ### LISTENING SOCKET
  ///
  /// Taken and dropped by the [Close Listener Procedure]; the accept loop
  /// observes the empty slot and exits.
  ///
  /// [Close Listener Procedure]: Listener::close_listener
  listener: Mutex<Option<TcpListener>>,

  /// ### LISTENER STATE
  state: Atomic<ListenerState>,

  /// ### ACCEPTED QUEUE
  ///
  /// Completed pairings, in arrival order, drained by the
  /// [Accept Procedure].
  ///
  /// [Accept Procedure]: Listener::accept
  queue: Mutex<VecDeque<Connection>>,

  /// ### READINESS SEMAPHORE
  ///
  /// Counts the queue: one released permit per queued pairing.
  ready: Semaphore,

  settings: ParameterSettings,
  logger: LoggingHook,
}

/// ## LISTENER
///
/// The passive side of the pairing handshake: accepts raw arrivals on a
/// background loop, matches heartbeat and main sockets through the pending
/// table, and emits completed [Connection]s through a bounded queue.
///
/// [Connection]: crate::connection::Connection
pub struct Listener {
  shared: Arc<ListenerShared>,

  /// ### ACCEPT LOOP THREAD
  ///
  /// Joined exactly once, during the [Close Listener Procedure]. Behind a
  /// mutex so closure may run while another thread is blocked in the
  /// [Accept Procedure].
  ///
  /// [Close Listener Procedure]: Listener::close_listener
  /// [Accept Procedure]:         Listener::accept
  accept_thread: Mutex<Option<JoinHandle<()>>>,

  logger: LoggingHook,
  port: u16,
}

/// ## LIFECYCLE PROCEDURES
///
/// - [New Listener]
/// - [Close Listener Procedure]
///
/// [New Listener]:             Listener::new
/// [Close Listener Procedure]: Listener::close_listener
impl Listener {
  /// ### NEW LISTENER
  ///
  /// Creates the listening socket on the wildcard address, starts the
  /// accept loop thread, and initializes the accepted queue. A port of
  /// zero requests an ephemeral port, observable through [Port].
  ///
  /// [Port]: Listener::port
  pub fn new(
    port: u16,
    settings: ParameterSettings,
    logger: LoggingHook,
  ) -> Result<Listener, Error> {
    let log: LogContext = LogContext::new(format!("TANDEM LISTENER ( :{} )", port), "CONSTRUCTOR", &logger);

    // CREATE, BIND, LISTEN
    //
    // Each step classifies its own failure, so a caller can tell an
    // exhausted descriptor table from an occupied port.
    log.log("Trying to create listening socket", LogPriority::Debug);
    let socket: Socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
      .map_err(|error| Error::from_io(ErrorKind::SocketCreation, &error).reported(&logger))?;
    let address: SocketAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    log.log(&format!("Trying to bind to {}", address), LogPriority::Info);
    socket
      .bind(&address.into())
      .map_err(|error| Error::from_io(ErrorKind::Binding, &error).reported(&logger))?;
    socket
      .listen(CLIENT_BOUND as i32)
      .map_err(|error| Error::from_io(ErrorKind::Listening, &error).reported(&logger))?;
    let listener: TcpListener = socket.into();
    let bound_port: u16 = listener
      .local_addr()
      .map_err(|error| Error::from_io(ErrorKind::Binding, &error).reported(&logger))?
      .port();

    // NON-BLOCKING ACCEPTANCE
    //
    // The accept loop polls at the loop period rather than suspending
    // indefinitely, so closure is always observed within one period.
    listener
      .set_nonblocking(true)
      .map_err(|error| Error::from_io(ErrorKind::Setting, &error).reported(&logger))?;

    let shared: Arc<ListenerShared> = Arc::new(ListenerShared {
      listener: Mutex::new(Some(listener)),
      state: Atomic::new(ListenerState::default()),
      queue: Mutex::new(VecDeque::new()),
      ready: Semaphore::new(),
      settings,
      logger: logger.clone(),
    });

    // START THE ACCEPT LOOP
    let loop_shared: Arc<ListenerShared> = shared.clone();
    let accept_thread: JoinHandle<()> = thread::Builder::new()
      .name("tandem-accept".to_string())
      .spawn(move || accept_loop(loop_shared, bound_port))
      .map_err(|error| Error::from_io(ErrorKind::Multithreading, &error).reported(&logger))?;

    log.log(&format!("Listening on port {}", bound_port), LogPriority::Info);
    Ok(Listener {
      shared,
      accept_thread: Mutex::new(Some(accept_thread)),
      logger,
      port: bound_port,
    })
  }

  /// ### CLOSE LISTENER PROCEDURE
  ///
  /// Stops accepting: marks the [Listener] closed, drops the listening
  /// socket, releases the shutdown permit so every blocked
  /// [Accept Procedure] drains, and joins the accept loop. Calling it
  /// again is a no-op.
  ///
  /// [Listener]:         Listener
  /// [Accept Procedure]: Listener::accept
  pub fn close_listener(&self) {
    if self.shared.state.swap(ListenerState::Closed, Relaxed) == ListenerState::Closed {
      return;
    }
    let log: LogContext = self.context("LISTENER CLOSER");
    log.log("Trying to close listener", LogPriority::Info);

    // CLOSE THE SOCKET
    //
    // The accept loop observes the empty slot on its next pass, within one
    // loop period.
    drop(self.shared.listener.lock().unwrap().take());

    // WAKE BLOCKED ACCEPTERS
    //
    // The shutdown permit is released before the join, so no accepter has
    // to wait out the loop's final pass.
    self.shared.ready.release();

    if let Some(accept_thread) = self.accept_thread.lock().unwrap().take() {
      let _ = accept_thread.join();
    }
    log.log("Listener closed", LogPriority::Info);
  }

  /// ### LISTENER CHECK
  ///
  /// Whether the [Listener] is still accepting arrivals.
  ///
  /// [Listener]: Listener
  pub fn is_listener_open(&self) -> bool {
    self.shared.state.load(Relaxed) == ListenerState::Open
  }

  /// ### PORT
  ///
  /// The port actually bound, which differs from the requested port only
  /// when zero was requested.
  pub fn port(&self) -> u16 {
    self.port
  }

  fn context(&self, action: &'static str) -> LogContext {
    LogContext::new(format!("TANDEM LISTENER ( :{} )", self.port), action, &self.logger)
  }
}

/// ## ACCEPTANCE PROCEDURES
///
/// - [Accept Procedure]
///
/// [Accept Procedure]: Listener::accept
impl Listener {
  /// ### ACCEPT PROCEDURE
  ///
  /// Blocks until the accept loop has completed a pairing, then hands the
  /// [Connection] out in arrival order.
  ///
  /// -------------------------------------------------------------------------
  ///
  /// When the wake is the shutdown permit of the
  /// [Close Listener Procedure], the failure is [No Data] if the queue is
  /// empty and [Connection Break] otherwise, and the permit is released
  /// again so every other blocked accepter drains too.
  ///
  /// [Connection]:               crate::connection::Connection
  /// [Close Listener Procedure]: Listener::close_listener
  /// [No Data]:                  ErrorKind::NoData
  /// [Connection Break]:         ErrorKind::ConnectionBreak
  pub fn accept(&self) -> Result<Connection, Error> {
    let log: LogContext = self.context("ACCEPTER");
    log.log("Trying to accept connection", LogPriority::Info);
    self.shared.ready.acquire();

    // SHUTDOWN WAKE
    //
    // A permit acquired after closure is the shutdown permit, or a queued
    // pairing that will never be consumed. Either way the permit cascades
    // so every blocked accepter wakes.
    if self.shared.state.load(Relaxed) != ListenerState::Open {
      self.shared.ready.release();
      let kind: ErrorKind = if self.shared.queue.lock().unwrap().is_empty() {
        ErrorKind::NoData
      } else {
        ErrorKind::ConnectionBreak
      };
      return Err(Error::new(kind).reported(&self.logger));
    }

    match self.shared.queue.lock().unwrap().pop_front() {
      Some(connection) => {
        log.log(&format!("Connection with {} accepted", connection.peer_addr()), LogPriority::Info);
        Ok(connection)
      }
      // The permit was the shutdown permit, raced ahead of the state
      // change observed above.
      None => Err(Error::new(ErrorKind::NoData).reported(&self.logger)),
    }
  }
}
impl Drop for Listener {
  fn drop(&mut self) {
    self.close_listener();
  }
}

/// ## ACCEPT LOOP
///
/// Runs until closure: accepts raw arrivals, classifies each by its first
/// full-width field, and matches heartbeat and main sockets through the
/// pending table. Per-arrival failures are logged and never stop the loop.
fn accept_loop(shared: Arc<ListenerShared>, port: u16) {
  let log: LogContext = LogContext::new(format!("TANDEM LISTENER ( :{} )", port), "ACCEPTER LOOP", &shared.logger);
  log.log("Accepter loop started", LogPriority::Debug);

  // PENDING TABLE
  //
  // Init arrivals filed by token, awaiting their partner socket. Owned by
  // this thread alone; dropped wholesale when the loop ends, closing every
  // unpaired socket.
  let mut pending: HashMap<i64, TcpStream> = HashMap::new();
  let mut next_token: i64 = 1;

  loop {
    if shared.state.load(Relaxed) != ListenerState::Open {
      break;
    }

    // POLL FOR AN ARRIVAL
    let accepted = {
      let guard = shared.listener.lock().unwrap();
      match guard.as_ref() {
        None => break,
        Some(listener) => listener.accept(),
      }
    };
    let (socket, peer) = match accepted {
      Ok(arrival) => arrival,
      Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
        thread::sleep(shared.settings.loop_period);
        continue;
      }
      Err(error) => {
        log.log(
          &Error::from_io(ErrorKind::Acceptance, &error).to_string(),
          LogPriority::Warning,
        );
        thread::sleep(shared.settings.loop_period);
        continue;
      }
    };

    // LATE CLOSURE CHECK
    //
    // Closure may have happened between the poll and the accept. The raw
    // socket is dropped unanswered.
    if shared.state.load(Relaxed) != ListenerState::Open {
      break;
    }

    log.log(&format!("Arrival from {}", peer), LogPriority::Debug);
    if let Err(error) = pair_arrival(socket, &mut pending, &mut next_token, &shared, &log) {
      let _ = error.reported(&shared.logger);
    }
  }
  log.log("Accepter loop stopped", LogPriority::Debug);
}

/// ## ARRIVAL PAIRING
///
/// Classifies one raw arrival:
///
/// - A silent arrival is refused with the zero-token sentinel.
/// - Mode zero is an init arrival: a fresh token is issued, answered, and
///   the socket filed under it as a future heartbeat channel.
/// - A mode matching a filed token is the partner main channel: the entry
///   is consumed, the run signal `'1'` sent, and the pairing queued.
/// - Anything else is answered with the one-byte refusal `'0'`.
///
/// An error return drops the arrival's socket; the pending table is
/// disturbed only by a consumed or reissued token.
fn pair_arrival(
  socket: TcpStream,
  pending: &mut HashMap<i64, TcpStream>,
  next_token: &mut i64,
  shared: &Arc<ListenerShared>,
  log: &LogContext,
) -> Result<(), Error> {
  // The arrival inherits no flags from the listening socket; the pairing
  // exchange below is blocking with explicit waits.
  socket
    .set_nonblocking(false)
    .map_err(|error| Error::from_io(ErrorKind::Setting, &error))?;

  // FIRST FIELD
  //
  // The arrival owes its mode field within the ping threshold.
  if primitive::wait_for_data(&socket, shared.settings.ping_threshold)?.is_none() {
    let _ = primitive::blocking_send(&socket, &primitive::encode_field(0), FIELD_WIDTH);
    log.log("Silent arrival refused", LogPriority::Warning);
    return Ok(());
  }
  let field: Vec<u8> = primitive::blocking_recv(&socket, FIELD_WIDTH)?;
  if field.len() < FIELD_WIDTH {
    return Err(Error::leak(ErrorKind::Receiving));
  }
  let mode: i64 = primitive::parse_field(&field).ok_or(Error::new(ErrorKind::Receiving))?;

  if mode == 0 {
    // INIT ARRIVAL
    //
    // The socket is the peer's heartbeat channel. It is answered with a
    // fresh one-shot token and filed under it until the partner arrives.
    let token: i64 = *next_token;
    *next_token = if *next_token == i64::MAX {1} else {*next_token + 1};
    if primitive::blocking_send(&socket, &primitive::encode_field(token), FIELD_WIDTH)? < FIELD_WIDTH {
      return Err(Error::leak(ErrorKind::Sending));
    }
    if pending.insert(token, socket).is_some() {
      // Counter rotation in a very long run has come all the way around to
      // a token whose pairing never completed.
      log.log(&format!("Stale pending entry under token {} dropped", token), LogPriority::Warning);
    }
    log.log(&format!("Init arrival filed under token {}", token), LogPriority::Debug);
  } else if let Some(heartbeat) = pending.remove(&mode) {
    // PAIRING ARRIVAL
    //
    // The socket is the peer's main channel; the filed socket is its
    // heartbeat partner. The run signal completes the handshake before the
    // heartbeat worker starts.
    if primitive::blocking_send(&socket, b"1", 1)? < 1 {
      return Err(Error::leak(ErrorKind::Sending));
    }
    let connection: Connection = Connection::from_pair(
      heartbeat,
      socket,
      ConnectionRole::Acceptor,
      shared.settings,
      shared.logger.clone(),
    )?;
    shared.queue.lock().unwrap().push_back(connection);
    shared.ready.release();
    log.log(&format!("Pairing under token {} complete, connection queued", mode), LogPriority::Info);
  } else {
    // UNRECOGNIZED
    let _ = primitive::blocking_send(&socket, b"0", 1);
    log.log(&format!("Unrecognized pairing token {}", mode), LogPriority::Warning);
  }
  Ok(())
}
