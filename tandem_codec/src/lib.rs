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

//! # TANDEM TYPED VALUE CODEC
//!
//! Copyright © 2024 Tandem Project Developers, Licensed under the MIT License
//!
//! ---------------------------------------------------------------------------
//!
//! The [TMS] transport moves opaque bytes. This crate provides the codec
//! collaborator layered on top of it: groups of typed values are rendered as
//! whitespace-separated ASCII tokens, one token per value, and extracted
//! back in order on the receiving side.
//!
//! To use the codec:
//! - Implement or reuse [Token] for each element type.
//! - Encode and decode whole groups through [Wire Encode] and [Wire Decode],
//!   implemented for tuples of [Token] values.
//! - Exchange groups directly over a [Connection] with the
//!   [Typed Connection] extension.
//!
//! ---------------------------------------------------------------------------
//!
//! Because values are separated by whitespace, a [String] value containing
//! whitespace will not survive a round trip as a single value; it is
//! extracted as one token per word, exactly as the wire format defines.
//!
//! ---------------------------------------------------------------------------
//!
//! [TMS]:              tandem
//! [Token]:            Token
//! [Wire Encode]:      WireEncode
//! [Wire Decode]:      WireDecode
//! [Typed Connection]: TypedConnection
//! [Connection]:       tandem::Connection

use std::time::Duration;

use tandem::Connection;

/// ## CODEC ERROR
///
/// Represents an error in moving a group of typed values over the
/// transport, or in rendering it to and from its token form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Error {
  /// ### TRANSPORT ERROR
  ///
  /// The underlying exchange failed before the codec was involved.
  Transport(tandem::Error),

  /// ### NOT TEXT
  ///
  /// The received bytes are not valid UTF-8 and cannot carry tokens.
  NotText,

  /// ### MISSING TOKEN
  ///
  /// The received group ended before every expected value was extracted.
  MissingToken,

  /// ### INVALID TOKEN
  ///
  /// A token could not be parsed as the expected value type.
  InvalidToken,

  /// ### TRAILING TOKENS
  ///
  /// The received group carried more tokens than values were expected.
  TrailingTokens,
}

/// ## TOKEN
///
/// A single value renderable as one whitespace-free ASCII token.
pub trait Token: Sized {
  /// ### WRITE TOKEN
  ///
  /// Appends the rendered value to the output.
  fn write_token(&self, output: &mut String);

  /// ### PARSE TOKEN
  ///
  /// Extracts a value from one token.
  fn parse_token(token: &str) -> Result<Self, Error>;
}

macro_rules! parsed_token {
  ($($name:ty),+) => {$(
    impl Token for $name {
      fn write_token(&self, output: &mut String) {
        output.push_str(&self.to_string());
      }

      fn parse_token(token: &str) -> Result<Self, Error> {
        token.parse::<$name>().map_err(|_| Error::InvalidToken)
      }
    }
  )+};
}
parsed_token! {u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, bool, char, String}

/// ## WIRE ENCODE
///
/// A group of values renderable as one token-form message. Implemented for
/// tuples of [Token] values and for the empty group.
///
/// [Token]: Token
pub trait WireEncode {
  /// ### ENCODE
  ///
  /// Renders the group as bytes ready for the transport.
  fn encode(&self) -> Vec<u8>;
}

/// ## WIRE DECODE
///
/// A group of values extractable from one token-form message. Implemented
/// for tuples of [Token] values and for the empty group.
///
/// [Token]: Token
pub trait WireDecode: Sized {
  /// ### DECODE
  ///
  /// Extracts the group from received bytes. Every token must be consumed:
  /// a short group is [Missing Token], a long one [Trailing Tokens].
  ///
  /// [Missing Token]:   Error::MissingToken
  /// [Trailing Tokens]: Error::TrailingTokens
  fn decode(bytes: &[u8]) -> Result<Self, Error>;
}

impl WireEncode for () {
  fn encode(&self) -> Vec<u8> {
    Vec::new()
  }
}
impl WireDecode for () {
  fn decode(bytes: &[u8]) -> Result<Self, Error> {
    let text: &str = std::str::from_utf8(bytes).map_err(|_| Error::NotText)?;
    match text.split_whitespace().next() {
      None => Ok(()),
      Some(_) => Err(Error::TrailingTokens),
    }
  }
}

macro_rules! tuple_wire {
  ($($name:ident . $index:tt),+) => {
    impl<$($name: Token),+> WireEncode for ($($name,)+) {
      fn encode(&self) -> Vec<u8> {
        let mut output: String = String::new();
        $(
          if !output.is_empty() {
            output.push(' ');
          }
          self.$index.write_token(&mut output);
        )+
        output.into_bytes()
      }
    }
    impl<$($name: Token),+> WireDecode for ($($name,)+) {
      fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let text: &str = std::str::from_utf8(bytes).map_err(|_| Error::NotText)?;
        let mut tokens = text.split_whitespace();
        let group = ($(
          $name::parse_token(tokens.next().ok_or(Error::MissingToken)?)?,
        )+);
        match tokens.next() {
          None => Ok(group),
          Some(_) => Err(Error::TrailingTokens),
        }
      }
    }
  };
}
tuple_wire! {A.0}
tuple_wire! {A.0, B.1}
tuple_wire! {A.0, B.1, C.2}
tuple_wire! {A.0, B.1, C.2, D.3}
tuple_wire! {A.0, B.1, C.2, D.3, E.4}
tuple_wire! {A.0, B.1, C.2, D.3, E.4, F.5}
tuple_wire! {A.0, B.1, C.2, D.3, E.4, F.5, G.6}
tuple_wire! {A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7}

/// ## TYPED CONNECTION
///
/// Extends a [Connection] with the exchange of typed value groups in token
/// form.
///
/// [Connection]: tandem::Connection
pub trait TypedConnection {
  /// ### SEND VALUES
  ///
  /// Renders the group and sends it as one framed message.
  fn send_values<T: WireEncode>(&mut self, values: &T) -> Result<(), Error>;

  /// ### RECEIVE VALUES
  ///
  /// Awaits one framed message up to the timeout and extracts the group
  /// from it. A timeout on a live connection is [None], as in the
  /// underlying [Receive Procedure].
  ///
  /// [Receive Procedure]: tandem::Connection::receive
  fn receive_values<T: WireDecode>(&mut self, timeout: Duration) -> Result<Option<T>, Error>;
}
impl TypedConnection for Connection {
  fn send_values<T: WireEncode>(&mut self, values: &T) -> Result<(), Error> {
    self.send(&values.encode()).map_err(Error::Transport)
  }

  fn receive_values<T: WireDecode>(&mut self, timeout: Duration) -> Result<Option<T>, Error> {
    match self.receive(timeout).map_err(Error::Transport)? {
      None => Ok(None),
      Some(bytes) => T::decode(&bytes).map(Some),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_value_round_trips() {
    let encoded = (42u32,).encode();
    assert_eq!(encoded, b"42");
    assert_eq!(<(u32,)>::decode(&encoded).unwrap(), (42,));
  }

  #[test]
  fn mixed_group_round_trips() {
    let group = (17i64, 2.5f64, true, 'x', "word".to_string());
    let encoded = group.encode();
    assert_eq!(encoded, b"17 2.5 true x word");
    let decoded = <(i64, f64, bool, char, String)>::decode(&encoded).unwrap();
    assert_eq!(decoded, group);
  }

  #[test]
  fn empty_group_round_trips() {
    assert_eq!(().encode(), b"");
    <()>::decode(b"").unwrap();
  }

  #[test]
  fn whitespace_splits_into_tokens() {
    // A string with spaces leaves as one value and arrives as two tokens.
    let encoded = ("two words".to_string(),).encode();
    assert_eq!(<(String, String)>::decode(&encoded).unwrap(), ("two".to_string(), "words".to_string()));
  }

  #[test]
  fn short_group_is_missing_token() {
    assert_eq!(<(u32, u32)>::decode(b"1"), Err(Error::MissingToken));
  }

  #[test]
  fn long_group_is_trailing_tokens() {
    assert_eq!(<(u32,)>::decode(b"1 2"), Err(Error::TrailingTokens));
    assert_eq!(<()>::decode(b"1"), Err(Error::TrailingTokens));
  }

  #[test]
  fn malformed_token_is_invalid() {
    assert_eq!(<(u32,)>::decode(b"forty-two"), Err(Error::InvalidToken));
    assert_eq!(<(bool,)>::decode(b"2"), Err(Error::InvalidToken));
  }

  #[test]
  fn negative_and_extreme_values_round_trip() {
    let group = (i64::MIN, i64::MAX, -1i8);
    let encoded = group.encode();
    assert_eq!(<(i64, i64, i8)>::decode(&encoded).unwrap(), group);
  }

  #[test]
  fn non_utf8_bytes_are_not_text() {
    assert_eq!(<(u32,)>::decode(&[0xFF, 0xFE]), Err(Error::NotText));
  }
}
