use bytes::{BufMut, BytesMut};

use super::Error;

/// The ChannelData Message
///
/// The ChannelData message is used to carry application data between the
/// client and the server.
///
/// The Channel Number field specifies the number of the channel on which
/// the data is traveling, and thus, the address of the peer that is
/// sending or is to receive the data.
///
/// The Length field specifies the length in bytes of the application
/// data field (i.e., it does not include the size of the ChannelData
/// header).  Note that 0 is a valid length.
///
/// Over stream transports the ChannelData message is padded to a
/// multiple of four bytes; over UDP the padding is not sent.
pub struct ChannelData<'a> {
    pub bytes: &'a [u8],
    pub number: u16,
}

impl<'a> ChannelData<'a> {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// The whole frame size on the wire, padding included when the
    /// transport is tcp.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::channel_data::ChannelData;
    ///
    /// let frame = [0x40u8, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
    ///
    /// assert_eq!(ChannelData::message_size(&frame, false).unwrap(), 9);
    /// assert_eq!(ChannelData::message_size(&frame, true).unwrap(), 12);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if bytes[0] >> 6 != 1 {
            return Err(Error::InvalidInput);
        }

        let mut size = (u16::from_be_bytes(bytes[2..4].try_into()?) + 4) as usize;
        if is_tcp && (size % 4) > 0 {
            size += 4 - (size % 4);
        }

        Ok(size)
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 4] = [0x40, 0x00, 0x00, 0x40];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4000,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes, false);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.number, 0x4000);
    /// assert_eq!(ret.bytes, &data[..]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut, is_tcp: bool) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);

        // The padding bytes carry no length of their own, the receiver
        // recovers the frame boundary from the Length field.
        if is_tcp && (bytes.len() % 4) > 0 {
            bytes.put_bytes(0, 4 - (bytes.len() % 4));
        }
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 5] = [0x40, 0x00, 0x00, 0x40, 0x01];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x7FFF,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes, true);
    ///
    /// assert_eq!(bytes.len(), 12);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.number, 0x7FFF);
    /// assert_eq!(ret.bytes, &data[..]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !(0x4000..=0x7FFF).contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            bytes: &bytes[4..4 + size],
            number,
        })
    }
}
