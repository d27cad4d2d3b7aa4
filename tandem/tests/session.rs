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

//! End-to-end exercises of the pairing handshake, the framed exchange, the
//! heartbeat, and listener shutdown, all over loopback with shortened
//! parameter settings and ephemeral ports.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use tandem::{capped_hook, Connection, ErrorKind, Listener, ParameterSettings};
use tandem::primitive::{encode_field, parse_field, BLOCK_SIZE, FIELD_WIDTH};

fn fast_settings() -> ParameterSettings {
  ParameterSettings {
    ping_threshold: Duration::from_millis(400),
    loop_period: Duration::from_millis(25),
  }
}

/// One full pairing over loopback: the acceptor-side connection and the
/// initiator-side connection, in that order.
fn paired(settings: ParameterSettings) -> (Listener, Connection, Connection) {
  let listener = Listener::new(0, settings, capped_hook()).unwrap();
  let initiator = Connection::connect("127.0.0.1", listener.port(), settings, capped_hook()).unwrap();
  let acceptor = listener.accept().unwrap();
  (listener, acceptor, initiator)
}

fn wait_until(bound: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let entry = Instant::now();
  while entry.elapsed() < bound {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  condition()
}

#[test]
fn pairing_yields_live_connections_on_both_sides() {
  let settings = fast_settings();
  let (listener, acceptor, initiator) = paired(settings);

  assert!(initiator.is_connected());
  assert!(acceptor.is_connected());
  assert!(initiator.ping() >= 0);
  assert!(acceptor.ping() >= 0);

  // Several heartbeat rounds later the link must still vouch for itself.
  thread::sleep(settings.loop_period * 8);
  assert!(initiator.is_connected());
  assert!(acceptor.is_connected());
  assert!(initiator.ping() >= 0);
  assert!(acceptor.ping() >= 0);
  assert!(listener.is_listener_open());
}

#[test]
fn round_trip_preserves_bytes_and_order() {
  let (_listener, mut acceptor, mut initiator) = paired(fast_settings());

  initiator.send(b"first").unwrap();
  initiator.send(b"second").unwrap();
  initiator.send(b"third").unwrap();
  assert_eq!(acceptor.receive(Duration::from_secs(2)).unwrap().unwrap(), b"first");
  assert_eq!(acceptor.receive(Duration::from_secs(2)).unwrap().unwrap(), b"second");
  assert_eq!(acceptor.receive(Duration::from_secs(2)).unwrap().unwrap(), b"third");

  // The exchange is symmetric.
  acceptor.send(b"reply").unwrap();
  assert_eq!(initiator.receive(Duration::from_secs(2)).unwrap().unwrap(), b"reply");
}

#[test]
fn empty_message_round_trips() {
  let (_listener, mut acceptor, mut initiator) = paired(fast_settings());
  initiator.send(b"").unwrap();
  assert_eq!(acceptor.receive(Duration::from_secs(2)).unwrap().unwrap(), b"");
}

#[test]
fn block_boundary_lengths_round_trip() {
  let (_listener, mut acceptor, mut initiator) = paired(fast_settings());
  for length in [1, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1, 3 * BLOCK_SIZE] {
    let message: Vec<u8> = (0..length).map(|index| (index % 251) as u8).collect();
    initiator.send(&message).unwrap();
    assert_eq!(acceptor.receive(Duration::from_secs(2)).unwrap().unwrap(), message);
  }
}

#[test]
fn large_payload_round_trips() {
  let (_listener, mut acceptor, initiator) = paired(fast_settings());
  let payload: Vec<u8> = (0..1_048_577usize).map(|index| (index % 256) as u8).collect();
  let expected: Vec<u8> = payload.clone();

  // The payload outgrows the socket buffers, so the sender must run beside
  // the receiver.
  let sender = thread::spawn(move || {
    let mut initiator = initiator;
    initiator.send(&payload).unwrap();
    initiator
  });
  let received = acceptor.receive(Duration::from_secs(5)).unwrap().unwrap();
  assert_eq!(received.len(), expected.len());
  assert_eq!(received, expected);
  sender.join().unwrap();
}

#[test]
fn zero_timeout_receive_on_idle_connection_is_benign() {
  let (_listener, mut acceptor, initiator) = paired(fast_settings());
  assert_eq!(acceptor.receive(Duration::ZERO).unwrap(), None);
  assert!(acceptor.is_connected());
  assert!(initiator.is_connected());
}

#[test]
fn availability_follows_queued_data() {
  let (_listener, mut acceptor, mut initiator) = paired(fast_settings());
  assert!(!acceptor.is_available().unwrap());
  initiator.send(b"knock").unwrap();
  assert!(wait_until(Duration::from_secs(1), || acceptor.is_available().unwrap()));
  assert_eq!(acceptor.receive(Duration::from_secs(1)).unwrap().unwrap(), b"knock");
}

#[test]
fn hang_up_is_observed_within_the_threshold() {
  let settings = fast_settings();
  let (_listener, mut acceptor, mut initiator) = paired(settings);

  acceptor.stop();
  let bound = settings.ping_threshold + settings.loop_period * 4;
  assert!(wait_until(bound, || !initiator.is_connected()));
  assert_eq!(initiator.ping(), -1);

  let failure = initiator.send(b"x").unwrap_err();
  assert_eq!(failure.kind(), ErrorKind::ConnectionBreak);
}

#[test]
fn dead_connection_fails_availability_and_stays_stopped() {
  let settings = fast_settings();
  let (_listener, mut acceptor, mut initiator) = paired(settings);

  acceptor.stop();
  assert!(wait_until(
    settings.ping_threshold + settings.loop_period * 4,
    || !initiator.is_connected()
  ));

  let failure = initiator.is_available().unwrap_err();
  assert_eq!(failure.kind(), ErrorKind::ConnectionBreak);
  assert!(!initiator.is_connected());
  assert_eq!(initiator.ping(), -1);

  // The terminal state is stable under repetition.
  initiator.stop();
  initiator.stop();
  assert_eq!(initiator.is_available().unwrap_err().kind(), ErrorKind::ConnectionBreak);
}

#[test]
fn stop_is_idempotent_and_terminal() {
  let (_listener, mut acceptor, mut initiator) = paired(fast_settings());
  initiator.stop();
  initiator.stop();
  assert!(!initiator.is_connected());
  assert_eq!(initiator.ping(), -1);
  assert_eq!(initiator.send(b"x").unwrap_err().kind(), ErrorKind::ConnectionBreak);

  // The acceptor side observes the hang-up through its own heartbeat.
  assert!(wait_until(Duration::from_secs(2), || !acceptor.is_connected()));
}

#[test]
fn abandoned_token_never_produces_a_connection() {
  let settings = fast_settings();
  let listener = Listener::new(0, settings, capped_hook()).unwrap();

  // An init arrival which takes its token and never presents it.
  let mut raw = TcpStream::connect(("127.0.0.1", listener.port())).unwrap();
  raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
  raw.write_all(&encode_field(0)).unwrap();
  let mut field = [0u8; FIELD_WIDTH];
  raw.read_exact(&mut field).unwrap();
  assert!(parse_field(&field).unwrap() > 0);
  drop(raw);

  // The accepted queue must not have grown.
  thread::sleep(settings.loop_period * 4);
  listener.close_listener();
  assert_eq!(listener.accept().unwrap_err().kind(), ErrorKind::NoData);
}

#[test]
fn unrecognized_token_is_refused() {
  let settings = fast_settings();
  let listener = Listener::new(0, settings, capped_hook()).unwrap();

  let mut raw = TcpStream::connect(("127.0.0.1", listener.port())).unwrap();
  raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
  raw.write_all(&encode_field(424242)).unwrap();
  let mut answer = [0u8; 1];
  raw.read_exact(&mut answer).unwrap();
  assert_eq!(&answer, b"0");
  drop(listener);
}

#[test]
fn silent_arrival_is_refused_with_the_zero_sentinel() {
  let settings = fast_settings();
  let listener = Listener::new(0, settings, capped_hook()).unwrap();

  let mut raw = TcpStream::connect(("127.0.0.1", listener.port())).unwrap();
  raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
  let mut field = [0u8; FIELD_WIDTH];
  raw.read_exact(&mut field).unwrap();
  assert_eq!(parse_field(&field), Some(0));
  drop(listener);
}

#[test]
fn connect_against_a_closed_port_fails() {
  let settings = fast_settings();
  let listener = Listener::new(0, settings, capped_hook()).unwrap();
  let port = listener.port();
  drop(listener);

  let failure = Connection::connect("127.0.0.1", port, settings, capped_hook()).unwrap_err();
  assert!(matches!(failure.kind(), ErrorKind::Connection | ErrorKind::Acceptance));
}

#[test]
fn listener_shutdown_unblocks_accepters() {
  let settings = fast_settings();
  let listener = Listener::new(0, settings, capped_hook()).unwrap();

  thread::scope(|scope| {
    let blocked = scope.spawn(|| {
      let entry = Instant::now();
      let outcome = listener.accept();
      (entry.elapsed(), outcome)
    });

    thread::sleep(Duration::from_millis(100));
    let closed_at = Instant::now();
    listener.close_listener();

    let (_, outcome) = blocked.join().unwrap();
    let kind = outcome.unwrap_err().kind();
    assert!(matches!(kind, ErrorKind::NoData | ErrorKind::ConnectionBreak));
    assert!(closed_at.elapsed() < Duration::from_millis(500));
  });
  assert!(!listener.is_listener_open());

  // Closure is idempotent, and later accepters fail immediately.
  listener.close_listener();
  assert!(matches!(
    listener.accept().unwrap_err().kind(),
    ErrorKind::NoData | ErrorKind::ConnectionBreak
  ));
}

#[test]
fn pairings_queue_in_arrival_order() {
  let settings = fast_settings();
  let listener = Listener::new(0, settings, capped_hook()).unwrap();

  let mut first = Connection::connect("127.0.0.1", listener.port(), settings, capped_hook()).unwrap();
  let second = Connection::connect("127.0.0.1", listener.port(), settings, capped_hook()).unwrap();

  let mut first_accepted = listener.accept().unwrap();
  let second_accepted = listener.accept().unwrap();

  // The first accepted connection is the first initiator's partner.
  first.send(b"from first").unwrap();
  assert_eq!(
    first_accepted.receive(Duration::from_secs(2)).unwrap().unwrap(),
    b"from first"
  );
  assert!(second.is_connected());
  assert!(second_accepted.is_connected());
}
