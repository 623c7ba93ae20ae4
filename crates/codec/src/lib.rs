//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//! [RFC6062]: https://tools.ietf.org/html/rfc6062
//!
//! STUN is intended to be used in the context of one or more NAT
//! traversal solutions.  These solutions are known as "STUN Usages".
//! Each usage describes how STUN is utilized to achieve the NAT
//! traversal solution.  Typically, a usage indicates when STUN messages
//! get sent, which optional attributes to include, what server is used,
//! and what authentication mechanism is to be used.  TURN [RFC5766] is
//! one usage of STUN: the message formats defined here cover the base
//! STUN grammar, the TURN relay extensions, the TCP relay extensions
//! of [RFC6062] and the NAT behaviour discovery attributes of RFC 5780.

pub mod channel_data;
pub mod crypto;
pub mod message;

use self::{
    channel_data::ChannelData,
    message::{Message, attributes::AttributeType},
};

use std::{array::TryFromSliceError, ops::Range, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    SummaryFailed,
    NotFoundIntegrity,
    IntegrityFailed,
    NotFoundMagicNumber,
    UnknownMethod,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

pub enum DecodeResult<'a> {
    Message(Message<'a>),
    ChannelData(ChannelData<'a>),
}

impl<'a> DecodeResult<'a> {
    pub fn into_message(self) -> Option<Message<'a>> {
        match self {
            Self::Message(it) => Some(it),
            Self::ChannelData(_) => None,
        }
    }
}

/// A cache of the list of attributes, this is for internal use only.
///
/// Besides the recognised attributes it also records the types of
/// comprehension-required attributes the decoder did not understand, so
/// the request layer can answer 420 with UNKNOWN-ATTRIBUTES.
#[derive(Debug, Clone)]
pub struct Attributes {
    values: Vec<(AttributeType, Range<usize>)>,
    unknowns: Vec<u16>,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            values: Vec::with_capacity(20),
            unknowns: Vec::new(),
        }
    }
}

impl Attributes {
    /// Adds an attribute to the list.
    pub fn append(&mut self, kind: AttributeType, range: Range<usize>) {
        self.values.push((kind, range));
    }

    /// Records a comprehension-required attribute type that is not
    /// understood.
    pub fn append_unknown(&mut self, kind: u16) {
        self.unknowns.push(kind);
    }

    /// Gets an attribute from the list.
    ///
    /// Note: This function will only look for the first matching property in
    /// the list and return it.
    pub fn get(&self, kind: &AttributeType) -> Option<Range<usize>> {
        self.values
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| v.clone())
    }

    /// Gets all the values of an attribute from a list.
    ///
    /// Normally a stun message can have multiple attributes with the same name,
    /// and this function will all the values of the current attribute.
    pub fn get_all<'a>(
        &'a self,
        kind: &'a AttributeType,
    ) -> impl Iterator<Item = &'a Range<usize>> {
        self.values.iter().filter(move |(k, _)| k == kind).map(|(_, v)| v)
    }

    pub fn unknowns(&self) -> &[u16] {
        &self.unknowns
    }

    pub fn clear(&mut self) {
        if !self.values.is_empty() {
            self.values.clear();
        }

        if !self.unknowns.is_empty() {
            self.unknowns.clear();
        }
    }
}

#[derive(Default)]
pub struct Decoder(Attributes);

impl Decoder {
    /// Decodes a datagram as either a stun message or a channel data
    /// frame, resolved by the first two bits: `00` is stun, `01` is
    /// channel data.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::{DecodeResult, Decoder};
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// assert!(matches!(
    ///     decoder.decode(&buffer).unwrap(),
    ///     DecodeResult::Message(_)
    /// ));
    ///
    /// let frame = [0x40u8, 0x00, 0x00, 0x01, 0xff];
    /// assert!(matches!(
    ///     decoder.decode(&frame).unwrap(),
    ///     DecodeResult::ChannelData(_)
    /// ));
    /// ```
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<DecodeResult<'a>, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let flag = bytes[0] >> 6;
        if flag > 1 {
            return Err(Error::InvalidInput);
        }

        Ok(if flag == 0 {
            self.0.clear();

            DecodeResult::Message(Message::decode(bytes, &mut self.0)?)
        } else {
            DecodeResult::ChannelData(ChannelData::decode(bytes)?)
        })
    }

    /// Returns the on-wire size of the first message in the buffer.
    ///
    /// Used by stream transports to find message boundaries: a stun
    /// message length comes from the header, a channel data frame is
    /// padded to a multiple of 4 over tcp.
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let flag = bytes[0] >> 6;
        if flag > 1 {
            return Err(Error::InvalidInput);
        }

        Ok(if flag == 0 {
            Message::message_size(bytes)?
        } else {
            ChannelData::message_size(bytes, is_tcp)?
        })
    }
}
