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

//! # TANDEM MESSAGE SERVICES (TMS)
//!
//! Copyright © 2024 Tandem Project Developers, Licensed under the MIT License
//!
//! ---------------------------------------------------------------------------
//!
//! TMS is a protocol designed to facilitate the reliable exchange of
//! variable-length messages between peers over TCP/IP, while continuously
//! measuring the round-trip latency of the link and detecting half-open
//! connections which TCP by itself may leave undiagnosed indefinitely.
//!
//! Each logical connection is carried by a *tandem* of two TCP sockets bound
//! together by a pairing handshake: a heartbeat channel, which carries only
//! the liveness protocol, and a main channel, which carries application
//! messages. Keeping the channels apart means a large message in flight never
//! delays the liveness traffic behind it.
//!
//! For ease of programming and extension, the functionality of the protocol
//! has been divided into a few subsets: the [Primitive Services], which manage
//! the framing of fixed-width fields and payload blocks over a single socket;
//! the [Connection Services], which manage a paired connection, its heartbeat
//! worker, and the sending and receiving of whole messages; and the
//! [Listener Services], which manage the acceptance and pairing of incoming
//! peers.
//!
//! ---------------------------------------------------------------------------
//!
//! ## Primitive Services
//!
//! Defines the most agnostic form in which data is moved over a single
//! socket persuant to the protocol.
//!
//! To use the Primitive Services:
//! - Exchange fixed-width decimal fields with [Encode Field], [Parse Field],
//!   [Blocking Send], and [Blocking Receive].
//! - Wait for socket readability with a bounded timeout using
//!   [Wait For Data].
//!
//! ---------------------------------------------------------------------------
//!
//! ## Connection Services
//!
//! Defines the paired connection object visible to users on both sides of
//! the protocol.
//!
//! To use the Connection Services:
//! - Initiate the pairing handshake against a remote [Listener] with the
//!   [Connect Procedure].
//! - Exchange messages with the [Send Procedure] and [Receive Procedure].
//! - Observe liveness with the [Availability Check], [Connection Check],
//!   and [Ping Observation].
//! - Break the connection with the [Stop Procedure].
//!
//! ---------------------------------------------------------------------------
//!
//! ## Listener Services
//!
//! Defines the passive side of the pairing handshake.
//!
//! To use the Listener Services:
//! - Create a [Listener] with the [New Listener] function.
//! - Obtain paired [Connection]s with the [Accept Procedure].
//! - Shut down with the [Close Listener Procedure].
//!
//! ---------------------------------------------------------------------------
//!
//! [Primitive Services]:      primitive
//! [Connection Services]:     connection
//! [Listener Services]:       listener
//! [Encode Field]:            primitive::encode_field
//! [Parse Field]:             primitive::parse_field
//! [Blocking Send]:           primitive::blocking_send
//! [Blocking Receive]:        primitive::blocking_recv
//! [Wait For Data]:           primitive::wait_for_data
//! [Connection]:              Connection
//! [Connect Procedure]:       Connection::connect
//! [Send Procedure]:          Connection::send
//! [Receive Procedure]:       Connection::receive
//! [Availability Check]:      Connection::is_available
//! [Connection Check]:        Connection::is_connected
//! [Ping Observation]:        Connection::ping
//! [Stop Procedure]:          Connection::stop
//! [Listener]:                Listener
//! [New Listener]:            Listener::new
//! [Accept Procedure]:        Listener::accept
//! [Close Listener Procedure]: Listener::close_listener

pub mod primitive;
pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionRole};
pub use listener::Listener;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ## LOG PRIORITY
///
/// The severity attached to a single logged event, ordered from most to
/// least urgent.
///
/// The numeric representation is part of the logging contract: hooks written
/// against other bindings of the protocol discriminate on the integer value.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
pub enum LogPriority {
  /// ### ERROR
  ///
  /// The emitting object can no longer perform its duty.
  Error = 0,

  /// ### WARNING
  ///
  /// A failure was observed and classified, but the emitting object
  /// continues operating.
  Warning = 1,

  /// ### INFO
  ///
  /// A user-visible procedure has started or completed.
  Info = 2,

  /// ### DEBUG
  ///
  /// An intermediate step of a procedure, useful when tracing the protocol.
  Debug = 3,
}

/// ## LOGGING HOOK
///
/// The pluggable callback through which every component reports its
/// activity, invoked as `(module, action, event, priority)`.
///
/// The module string identifies the emitting object instance, the action
/// string the procedure being performed, and the event string the specific
/// observation. The library never writes to any sink itself.
pub type LoggingHook = Arc<dyn Fn(&str, &str, &str, LogPriority) + Sync + Send>;

/// ## CAPPED HOOK
///
/// Provides the default [Logging Hook], which discards every event.
///
/// [Logging Hook]: LoggingHook
pub fn capped_hook() -> LoggingHook {
  Arc::new(|_module, _action, _event, _priority| {})
}

/// ## LOG CONTEXT
///
/// Couples the module and action strings of one emitting call site to the
/// [Logging Hook], so the call site only provides `(event, priority)` pairs.
///
/// [Logging Hook]: LoggingHook
pub(crate) struct LogContext {
  module: String,
  action: &'static str,
  hook: LoggingHook,
}
impl LogContext {
  pub(crate) fn new(module: String, action: &'static str, hook: &LoggingHook) -> Self {
    LogContext {
      module,
      action,
      hook: hook.clone(),
    }
  }

  pub(crate) fn log(&self, event: &str, priority: LogPriority) {
    (self.hook)(&self.module, self.action, event, priority)
  }
}

/// ## PARAMETER SETTINGS
///
/// The required set of parameters which both sides of the protocol must
/// provide, and which every [Connection] and [Listener] will abide by.
///
/// [Connection]: Connection
/// [Listener]:   Listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterSettings {
  /// ### PING THRESHOLD
  ///
  /// The maximum amount of time the heartbeat channel may go silent before
  /// the [Connection] is declared dead, and the maximum amount of time
  /// either side of the pairing handshake will wait for the other to
  /// produce its next handshake field.
  ///
  /// [Connection]: Connection
  pub ping_threshold: Duration,

  /// ### LOOP PERIOD
  ///
  /// The baseline cadence of the heartbeat: the interval at which the
  /// accepting side emits its ping observation, and the polling interval of
  /// the accept loop.
  pub loop_period: Duration,
}
impl Default for ParameterSettings {
  /// ### DEFAULT PARAMETER SETTINGS
  ///
  /// Provides [Parameter Settings] with these values:
  ///
  /// - [Ping Threshold] of 1000 milliseconds
  /// - [Loop Period] of 100 milliseconds
  ///
  /// [Parameter Settings]: ParameterSettings
  /// [Ping Threshold]:     ParameterSettings::ping_threshold
  /// [Loop Period]:        ParameterSettings::loop_period
  fn default() -> Self {
    Self {
      ping_threshold: Duration::from_millis(1000),
      loop_period: Duration::from_millis(100),
    }
  }
}

/// ## ERROR KIND
///
/// The closed set of failure classifications surfaced by the library. User
/// code is expected to discriminate on the kind rather than on rendered
/// text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  /// ### SOCKET CREATION
  ///
  /// A socket could not be created, or a required socket option could not
  /// be applied while creating it.
  SocketCreation,

  /// ### BINDING
  ///
  /// The listening socket could not be bound to the requested port.
  Binding,

  /// ### LISTENING
  ///
  /// The bound socket could not be placed into the listening state.
  Listening,

  /// ### ACCEPTANCE
  ///
  /// The pairing handshake was refused or abandoned by the other side.
  Acceptance,

  /// ### CONNECTION
  ///
  /// An outgoing TCP connection could not be established.
  Connection,

  /// ### RECEIVING
  ///
  /// A framed transfer could not be read. Carries the [Message Leak] flag
  /// when the transfer was cut short rather than refused by the platform.
  ///
  /// [Message Leak]: Error::is_message_leak
  Receiving,

  /// ### SENDING
  ///
  /// A framed transfer could not be written. Carries the [Message Leak]
  /// flag when the transfer was cut short rather than refused by the
  /// platform.
  ///
  /// [Message Leak]: Error::is_message_leak
  Sending,

  /// ### CONNECTION BREAK
  ///
  /// The peer is gone. Raised when the platform reports a reset, when a
  /// read observes a clean close, or when a user call finds the heartbeat
  /// already declared the connection dead.
  ConnectionBreak,

  /// ### SETTING
  ///
  /// A socket flag or timeout could not be changed.
  Setting,

  /// ### INCOME CHECKING
  ///
  /// The readiness wait itself failed, as opposed to timing out.
  IncomeChecking,

  /// ### NO DATA
  ///
  /// An [Accept Procedure] was woken by listener shutdown with nothing left
  /// in the accepted queue.
  ///
  /// [Accept Procedure]: Listener::accept
  NoData,

  /// ### MULTITHREADING
  ///
  /// A background worker thread could not be started.
  Multithreading,
}
impl ErrorKind {
  /// ### KIND PHRASE
  ///
  /// The rendered fragment used by [Display] when the [Message Leak] flag
  /// is not set.
  ///
  /// [Display]:      Error
  /// [Message Leak]: Error::is_message_leak
  fn phrase(&self) -> &'static str {
    match self {
      ErrorKind::SocketCreation  => "socket creation",
      ErrorKind::Binding         => "binding",
      ErrorKind::Listening       => "listening",
      ErrorKind::Acceptance      => "acceptance",
      ErrorKind::Connection      => "connection",
      ErrorKind::Receiving       => "receiving",
      ErrorKind::Sending         => "sending",
      ErrorKind::ConnectionBreak => "connection break",
      ErrorKind::Setting         => "setting",
      ErrorKind::IncomeChecking  => "income checking",
      ErrorKind::NoData          => "no data",
      ErrorKind::Multithreading  => "multithreading",
    }
  }
}

/// ## ERROR
///
/// A classified failure: an [Error Kind], an optional platform error code,
/// and the [Message Leak] flag marking a framed transfer which moved fewer
/// bytes than the frame required.
///
/// [Error Kind]:   ErrorKind
/// [Message Leak]: Error::is_message_leak
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error {
  kind: ErrorKind,
  code: Option<i32>,
  message_leak: bool,
}
impl Error {
  /// ### NEW ERROR
  ///
  /// Creates an [Error] of the given kind with no platform code and no
  /// [Message Leak] flag.
  ///
  /// [Error]:        Error
  /// [Message Leak]: Error::is_message_leak
  pub(crate) fn new(kind: ErrorKind) -> Self {
    Error {
      kind,
      code: None,
      message_leak: false,
    }
  }

  /// ### LEAK ERROR
  ///
  /// Creates a [Receiving] or [Sending] error with the [Message Leak] flag
  /// set, marking a transfer which was cut short.
  ///
  /// [Receiving]:    ErrorKind::Receiving
  /// [Sending]:      ErrorKind::Sending
  /// [Message Leak]: Error::is_message_leak
  pub(crate) fn leak(kind: ErrorKind) -> Self {
    Error {
      kind,
      code: None,
      message_leak: true,
    }
  }

  /// ### ERROR FROM PLATFORM ERROR
  ///
  /// Classifies an [I/O Error] under the given kind, carrying over the
  /// platform error code when one exists. A connection reset is always
  /// remapped to [Connection Break], regardless of which socket saw it.
  ///
  /// [I/O Error]:        std::io::Error
  /// [Connection Break]: ErrorKind::ConnectionBreak
  pub(crate) fn from_io(kind: ErrorKind, error: &io::Error) -> Self {
    if error.kind() == io::ErrorKind::ConnectionReset {
      return Error::new(ErrorKind::ConnectionBreak);
    }
    Error {
      kind,
      code: error.raw_os_error(),
      message_leak: false,
    }
  }

  /// ### ERROR KIND
  ///
  /// The classification of this failure.
  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  /// ### PLATFORM CODE
  ///
  /// The operating system error code which produced this failure, when the
  /// platform reported one.
  pub fn code(&self) -> Option<i32> {
    self.code
  }

  /// ### MESSAGE LEAK
  ///
  /// Whether the failure was a framed transfer moving fewer bytes than the
  /// frame required, rather than an error reported by the platform.
  pub fn is_message_leak(&self) -> bool {
    self.message_leak
  }

  /// ### REPORTED ERROR
  ///
  /// Emits the rendered error through the given [Logging Hook] at
  /// [Warning] priority, then hands the error back for propagation.
  ///
  /// [Logging Hook]: LoggingHook
  /// [Warning]:      LogPriority::Warning
  pub(crate) fn reported(self, hook: &LoggingHook) -> Self {
    hook("TANDEM EXCEPTION", "EXCEPTION", &self.to_string(), LogPriority::Warning);
    self
  }
}
impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.message_leak {
      let mode: &str = if self.kind == ErrorKind::Receiving {"received"} else {"sent"};
      write!(formatter, "the message could not be {} in full", mode)?;
    } else {
      write!(formatter, "{}", self.kind.phrase())?;
    }
    if let Some(code) = self.code {
      write!(formatter, " {}", code)?;
    }
    Ok(())
  }
}
impl std::error::Error for Error {}
