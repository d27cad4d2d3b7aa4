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

//! # PRIMITIVE SERVICES
//!
//! Defines the most agnostic form in which data is moved over a single
//! socket persuant to the [TMS] protocol: fixed-width decimal fields,
//! blocked payload transfer, and the bounded readiness wait on which every
//! higher procedure builds its timeouts.
//!
//! ---------------------------------------------------------------------------
//!
//! All numeric control fields on the wire are ASCII decimals, NUL-padded to
//! [Field Width] bytes. Application payloads move as whole [Block Size]
//! blocks followed by one short trailer carrying the remainder plus a single
//! reserved padding byte, preceded by a [Control Block] announcing both
//! counts.
//!
//! ---------------------------------------------------------------------------
//!
//! [TMS]:           crate
//! [Field Width]:   FIELD_WIDTH
//! [Block Size]:    BLOCK_SIZE
//! [Control Block]: encode_control

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::{Error, ErrorKind};

/// ## FIELD WIDTH
///
/// The exact on-wire size of every numeric control field: 20 digit
/// positions, enough for any 64-bit decimal with sign, plus one terminator
/// slot. Fields are always read and written as exactly this many bytes.
pub const FIELD_WIDTH: usize = 21;

/// ## BLOCK SIZE
///
/// The size of one full payload block. A message of length `n` moves as
/// `n / BLOCK_SIZE` full blocks and a trailer of `n % BLOCK_SIZE + 1` bytes,
/// whose final byte is reserved padding.
pub const BLOCK_SIZE: usize = 1024;

/// ## ENCODE FIELD
///
/// Renders a value as an ASCII decimal, NUL-padded to [Field Width] bytes.
///
/// [Field Width]: FIELD_WIDTH
pub fn encode_field(value: i64) -> [u8; FIELD_WIDTH] {
  let mut field: [u8; FIELD_WIDTH] = [0; FIELD_WIDTH];
  let rendered: String = value.to_string();
  field[..rendered.len()].copy_from_slice(rendered.as_bytes());
  field
}

/// ## PARSE FIELD
///
/// Extracts the decimal value from a NUL-padded field. Returns [None] when
/// the bytes up to the first NUL are not a decimal.
pub fn parse_field(bytes: &[u8]) -> Option<i64> {
  let end: usize = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
  std::str::from_utf8(&bytes[..end]).ok()?.trim().parse::<i64>().ok()
}

/// ## ENCODE CONTROL BLOCK
///
/// Renders the prelude of a framed message: the full-block count and the
/// remainder byte count, separated by a single space and right-NUL-padded
/// to twice [Field Width] bytes.
///
/// [Field Width]: FIELD_WIDTH
pub fn encode_control(full_blocks: usize, remainder: usize) -> [u8; 2 * FIELD_WIDTH] {
  let mut control: [u8; 2 * FIELD_WIDTH] = [0; 2 * FIELD_WIDTH];
  let rendered: String = format!("{} {}", full_blocks, remainder);
  control[..rendered.len()].copy_from_slice(rendered.as_bytes());
  control
}

/// ## PARSE CONTROL BLOCK
///
/// Extracts the full-block count and the remainder byte count from a
/// [Control Block]. Returns [None] when either count is malformed or the
/// remainder is not smaller than [Block Size].
///
/// [Control Block]: encode_control
/// [Block Size]:    BLOCK_SIZE
pub fn parse_control(bytes: &[u8]) -> Option<(usize, usize)> {
  let end: usize = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
  let text: &str = std::str::from_utf8(&bytes[..end]).ok()?;
  let (full_text, remainder_text) = text.split_once(' ')?;
  let full_blocks: usize = full_text.parse::<usize>().ok()?;
  let remainder: usize = remainder_text.trim().parse::<usize>().ok()?;
  if remainder >= BLOCK_SIZE {
    return None;
  }
  Some((full_blocks, remainder))
}

/// ## BLOCKING SEND
///
/// Transfers `length` bytes onto the socket in a single write, NUL-padding
/// the given bytes up to `length` when they fall short of it, and returns
/// the raw byte count the platform accepted. No retry happens at this
/// layer: the caller classifies a count short of `length` as a message
/// leak.
///
/// A connection reset is classified as [Connection Break]; every other
/// platform failure is [Sending] with the platform code attached.
///
/// [Sending]:          ErrorKind::Sending
/// [Connection Break]: ErrorKind::ConnectionBreak
pub fn blocking_send(stream: &TcpStream, bytes: &[u8], length: usize) -> Result<usize, Error> {
  let mut stream: &TcpStream = stream;
  let result: std::io::Result<usize> = if bytes.len() >= length {
    stream.write(&bytes[..length])
  } else {
    let mut padded: Vec<u8> = Vec::with_capacity(length);
    padded.extend_from_slice(bytes);
    padded.resize(length, 0);
    stream.write(&padded)
  };
  result.map_err(|error| Error::from_io(ErrorKind::Sending, &error))
}

/// ## BLOCKING RECEIVE
///
/// Reads up to `length` bytes from the socket, returning the bytes actually
/// received. The result is shorter than `length` only when the peer closed
/// the stream mid-transfer; the caller classifies an empty result as a
/// [Connection Break] and a short one as a message leak.
///
/// A connection reset is classified as [Connection Break]; every other
/// platform failure is [Receiving] with the platform code attached.
///
/// [Connection Break]: ErrorKind::ConnectionBreak
/// [Receiving]:        ErrorKind::Receiving
pub fn blocking_recv(stream: &TcpStream, length: usize) -> Result<Vec<u8>, Error> {
  let mut stream: &TcpStream = stream;
  let mut received: Vec<u8> = vec![0; length];
  let mut filled: usize = 0;
  while filled < length {
    match stream.read(&mut received[filled..]) {
      // The peer performed an orderly close. Whatever arrived before it is
      // handed back for the caller to classify.
      Ok(0) => break,
      Ok(count) => filled += count,
      Err(error) => return Err(Error::from_io(ErrorKind::Receiving, &error)),
    }
  }
  received.truncate(filled);
  Ok(received)
}

/// ## WAIT FOR DATA
///
/// Blocks until the socket is readable, up to the given timeout. On
/// readability, returns the time elapsed since entry; on timeout, returns
/// [None]. A zero timeout is a non-blocking poll.
///
/// A peer which closed the stream counts as readable, so that the read
/// which follows can classify the break. A failure of the wait itself is
/// [Income Checking]; a failure to adjust the socket for the wait is
/// [Setting].
///
/// [Income Checking]: ErrorKind::IncomeChecking
/// [Setting]:         ErrorKind::Setting
pub fn wait_for_data(stream: &TcpStream, timeout: Duration) -> Result<Option<Duration>, Error> {
  let mut probe: [u8; 1] = [0; 1];

  // NON-BLOCKING POLL
  //
  // A zero timeout asks whether data is already present, without ever
  // suspending. The socket is flipped into the non-blocking state for a
  // single peek and restored afterwards.
  if timeout.is_zero() {
    stream.set_nonblocking(true).map_err(|error| Error::from_io(ErrorKind::Setting, &error))?;
    let result: std::io::Result<usize> = stream.peek(&mut probe);
    stream.set_nonblocking(false).map_err(|error| Error::from_io(ErrorKind::Setting, &error))?;
    return match result {
      Ok(_) => Ok(Some(Duration::ZERO)),
      Err(error) => match error.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Ok(None),
        _ => Err(Error::from_io(ErrorKind::IncomeChecking, &error)),
      }
    };
  }

  // BOUNDED WAIT
  //
  // The read timeout carries the bound; the peek itself consumes nothing,
  // so the data observed remains for the read which follows. The previous
  // timeout is restored before returning so the wait leaves no trace on
  // the socket.
  let previous: Option<Duration> = stream.read_timeout().map_err(|error| Error::from_io(ErrorKind::Setting, &error))?;
  stream.set_read_timeout(Some(timeout)).map_err(|error| Error::from_io(ErrorKind::Setting, &error))?;
  let entry: Instant = Instant::now();
  let result: std::io::Result<usize> = stream.peek(&mut probe);
  let elapsed: Duration = entry.elapsed();
  stream.set_read_timeout(previous).map_err(|error| Error::from_io(ErrorKind::Setting, &error))?;
  match result {
    Ok(_) => Ok(Some(elapsed)),
    Err(error) => match error.kind() {
      std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Ok(None),
      _ => Err(Error::from_io(ErrorKind::IncomeChecking, &error)),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::net::{TcpListener, TcpStream};
  use std::time::Duration;

  use super::*;

  fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let near = TcpStream::connect(address).unwrap();
    let (far, _) = listener.accept().unwrap();
    (near, far)
  }

  #[test]
  fn field_round_trip() {
    for value in [0, 1, -1, 42, i64::MAX, i64::MIN] {
      let field = encode_field(value);
      assert_eq!(field.len(), FIELD_WIDTH);
      assert_eq!(parse_field(&field), Some(value));
    }
  }

  #[test]
  fn field_padding_is_nul() {
    let field = encode_field(7);
    assert_eq!(field[0], b'7');
    assert!(field[1..].iter().all(|&byte| byte == 0));
  }

  #[test]
  fn field_rejects_garbage() {
    assert_eq!(parse_field(b"not a number\0\0\0\0\0\0\0\0\0"), None);
    assert_eq!(parse_field(&[0; FIELD_WIDTH]), None);
  }

  #[test]
  fn control_block_layout() {
    let control = encode_control(0, 0);
    assert_eq!(control.len(), 2 * FIELD_WIDTH);
    assert_eq!(&control[..3], b"0 0");
    assert!(control[3..].iter().all(|&byte| byte == 0));
    assert_eq!(parse_control(&control), Some((0, 0)));
  }

  #[test]
  fn control_block_round_trip() {
    for (full, remainder) in [(0, 0), (1, 0), (0, BLOCK_SIZE - 1), (17, 512), (1024, 1023)] {
      assert_eq!(parse_control(&encode_control(full, remainder)), Some((full, remainder)));
    }
  }

  #[test]
  fn control_block_rejects_malformed() {
    assert_eq!(parse_control(b"12\0"), None);
    assert_eq!(parse_control(b"a b\0"), None);
    assert_eq!(parse_control(&encode_control(1, BLOCK_SIZE)), None);
  }

  #[test]
  fn blocking_transfer_pads_to_length() {
    let (near, far) = stream_pair();
    assert_eq!(blocking_send(&near, b"abc", 8).unwrap(), 8);
    let received = blocking_recv(&far, 8).unwrap();
    assert_eq!(received, b"abc\0\0\0\0\0");
  }

  #[test]
  fn blocking_recv_reports_short_transfer() {
    let (near, far) = stream_pair();
    blocking_send(&near, b"abc", 3).unwrap();
    drop(near);
    let received = blocking_recv(&far, 8).unwrap();
    assert_eq!(received, b"abc");
  }

  #[test]
  fn wait_times_out_without_data() {
    let (_near, far) = stream_pair();
    let outcome = wait_for_data(&far, Duration::from_millis(50)).unwrap();
    assert_eq!(outcome, None);
  }

  #[test]
  fn wait_observes_data_and_preserves_it() {
    let (near, far) = stream_pair();
    blocking_send(&near, b"x", 1).unwrap();
    let outcome = wait_for_data(&far, Duration::from_millis(500)).unwrap();
    assert!(outcome.is_some());
    // The peek must not have consumed the byte.
    assert_eq!(blocking_recv(&far, 1).unwrap(), b"x");
  }

  #[test]
  fn zero_timeout_polls_without_blocking() {
    let (near, far) = stream_pair();
    assert_eq!(wait_for_data(&far, Duration::ZERO).unwrap(), None);
    blocking_send(&near, b"x", 1).unwrap();
    // Delivery over loopback is fast but not instantaneous.
    std::thread::sleep(Duration::from_millis(50));
    assert!(wait_for_data(&far, Duration::ZERO).unwrap().is_some());
  }

  #[test]
  fn closed_peer_counts_as_readable() {
    let (near, far) = stream_pair();
    drop(near);
    let outcome = wait_for_data(&far, Duration::from_millis(500)).unwrap();
    assert!(outcome.is_some());
  }
}
