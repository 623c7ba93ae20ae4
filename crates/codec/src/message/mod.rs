pub mod attributes;
pub mod methods;

use crate::{
    Attributes, Error,
    crypto::{Password, fingerprint, hmac_sha1, hmac_sha256},
    message::{
        attributes::{Attribute, AttributeType, MessageIntegrity, MessageIntegritySha256},
        methods::Method,
    },
};

use bytes::{BufMut, BytesMut};

static MAGIC_NUMBER: u32 = 0x2112A442;

pub struct MessageEncoder<'a> {
    token: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    /// Starts a message with a caller-chosen transaction id. Used for
    /// server-originated messages: indications and responses deferred
    /// past the lifetime of the request buffer.
    pub fn new(method: Method, token: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token.as_slice());

        Self { bytes, token }
    }

    /// rely on old message to create new message.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::new();
    /// let old = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageEncoder::extend(BINDING_REQUEST, &old, &mut buf);
    ///
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(method: Method, reader: &Message<'a>, bytes: &'a mut BytesMut) -> Self {
        let token = reader.token();

        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token);

        Self { bytes, token }
    }

    /// append attribute.
    ///
    /// append attribute to message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::message::attributes::*;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let token = [0u8; 12];
    /// let mut buf = BytesMut::new();
    /// let mut message = MessageEncoder::new(BINDING_REQUEST, &token, &mut buf);
    /// message.append::<UserName>("panda");
    /// message.flush(None).unwrap();
    ///
    /// let mut attributes = Attributes::default();
    /// let decoded = Message::decode(&buf[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(decoded.get::<UserName>(), Some("panda"));
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        // record the current position,
        // and then advance the internal cursor 2 bytes,
        // here is to reserve the position.
        let os = self.bytes.len();
        unsafe { self.bytes.advance_mut(2) }
        T::serialize(value, self.bytes, self.token);

        // compute write index,
        // back to source index write size.
        let size = self.bytes.len() - os - 2;
        let size_buf = (size as u16).to_be_bytes();
        self.bytes[os] = size_buf[0];
        self.bytes[os + 1] = size_buf[1];

        // if you need to padding,
        // padding in the zero bytes.
        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put_bytes(0, psize);
        }
    }

    /// Finalises the message: writes the attribute list size into the
    /// header and, when a password is given, appends MESSAGE-INTEGRITY
    /// (or MESSAGE-INTEGRITY-SHA256) followed by FINGERPRINT.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::crypto::*;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let password = generate_password("panda", "raspberry", "panda", PasswordAlgorithm::Md5);
    ///
    /// let token = [0u8; 12];
    /// let mut buf = BytesMut::new();
    /// let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &token, &mut buf);
    /// message.append::<attributes::UserName>("panda");
    /// message.flush(Some(&password)).unwrap();
    ///
    /// let mut attributes = Attributes::default();
    /// let decoded = Message::decode(&buf[..], &mut attributes).unwrap();
    ///
    /// assert!(decoded.checksum(&password).is_ok());
    /// ```
    pub fn flush(&mut self, password: Option<&Password>) -> Result<(), Error> {
        // write attribute list size.
        self.set_len(self.bytes.len() - 20);

        // if need message integrity?
        if let Some(it) = password {
            self.checksum(it)?;
        }

        Ok(())
    }

    /// append MessageIntegrity attribute.
    ///
    /// The hmac covers the message with the header Length field already
    /// adjusted to include the integrity attribute itself; the
    /// fingerprint then covers everything before it with the Length
    /// adjusted once more.
    fn checksum(&mut self, password: &Password) -> Result<(), Error> {
        if self.bytes.len() < 20 {
            return Err(Error::InvalidInput);
        }

        let len = self.bytes.len();

        // compute new size,
        // new size include the MessageIntegrity attribute size.
        match password {
            Password::Sha256(_) => {
                self.set_len(len - 20 + 4 + 32);

                let hmac = hmac_sha256(password.as_bytes(), &[self.bytes])?;
                self.bytes.put_u16(AttributeType::MessageIntegritySha256 as u16);
                self.bytes.put_u16(32);
                self.bytes.put(hmac.as_slice());
            }
            Password::Md5(_) | Password::Raw(_) => {
                self.set_len(len - 20 + 4 + 20);

                let hmac = hmac_sha1(password.as_bytes(), &[self.bytes])?;
                self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
                self.bytes.put_u16(20);
                self.bytes.put(hmac.as_slice());
            }
        }

        // compute new size,
        // new size include the Fingerprint attribute size.
        self.set_len(self.bytes.len() - 20 + 8);

        // CRC Fingerprint
        let fingerprint = fingerprint(self.bytes);
        self.bytes.put_u16(AttributeType::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(fingerprint);

        Ok(())
    }

    // set stun message header size.
    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

pub struct Message<'a> {
    /// message method.
    method: Method,
    /// message source bytes.
    bytes: &'a [u8],
    /// offset of the integrity attribute, for checksum verification.
    size: u16,
    // message attribute list.
    attributes: &'a Attributes,
}

impl<'a> Message<'a> {
    /// message method.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn token(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// The transaction id as an owned array, for deferred responses.
    pub fn token_owned(&self) -> [u8; 12] {
        let mut token = [0u8; 12];
        token.copy_from_slice(self.token());

        token
    }

    /// Comprehension-required attribute types the decoder did not
    /// understand; a non-empty list on a request warrants a 420.
    pub fn unknown_attributes(&self) -> &[u16] {
        self.attributes.unknowns()
    }

    /// get attribute.
    ///
    /// get attribute from message attribute list.
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(&T::TYPE)?;
        T::deserialize(&self.bytes[range], self.token()).ok()
    }

    /// Gets all the values of an attribute from a list.
    ///
    /// Normally a stun message can have multiple attributes with the same name,
    /// and this function will all the values of the current attribute.
    pub fn get_all<T: Attribute<'a>>(&self) -> impl Iterator<Item = T::Item> {
        self.attributes
            .get_all(&T::TYPE)
            .map(|it| T::deserialize(&self.bytes[it.clone()], self.token()))
            .filter(|it| it.is_ok())
            .flatten()
    }

    /// check MessageIntegrity attribute.
    ///
    /// return whether the integrity attribute contained in the message
    /// can pass the check with the given key. The Length field in the
    /// header is recomputed to point to the end of the integrity
    /// attribute before digesting, as attributes such as FINGERPRINT
    /// may follow it.
    pub fn checksum(&self, password: &Password) -> Result<(), Error> {
        if self.bytes.is_empty() || self.size < 20 {
            return Err(Error::InvalidInput);
        }

        match password {
            Password::Sha256(_) => {
                let integrity = self
                    .get::<MessageIntegritySha256>()
                    .ok_or(Error::NotFoundIntegrity)?;

                let size_buf = (self.size + 16).to_be_bytes();
                let body = [
                    &self.bytes[0..2],
                    &size_buf,
                    &self.bytes[4..self.size as usize],
                ];

                if integrity != hmac_sha256(password.as_bytes(), &body)? {
                    return Err(Error::IntegrityFailed);
                }
            }
            Password::Md5(_) | Password::Raw(_) => {
                let integrity = self
                    .get::<MessageIntegrity>()
                    .ok_or(Error::NotFoundIntegrity)?;

                let size_buf = (self.size + 4).to_be_bytes();
                let body = [
                    &self.bytes[0..2],
                    &size_buf,
                    &self.bytes[4..self.size as usize],
                ];

                if integrity != hmac_sha1(password.as_bytes(), &body)? {
                    return Err(Error::IntegrityFailed);
                }
            }
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::*;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), BINDING_REQUEST);
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        let len = bytes.len();

        // There must be at least a complete header.
        if len < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        // First check whether the message length is valid. Here, the length needs
        // to add the 20 bytes of the header, because the length field here does
        // not include the header length.
        {
            let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 20;
            if len < size {
                return Err(Error::InvalidInput);
            }
        }

        // Check whether the magic number is the same.
        if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        let mut find_integrity = false;
        let mut content_len = 0;
        let mut offset = 20;

        loop {
            // if the buf length is not long enough to continue,
            // jump out of the loop.
            if len - offset < 4 {
                break;
            }

            // get attribute type
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);

            // whether the integrity attribute has been found,
            // if found, record the current offset position.
            if !find_integrity {
                content_len = offset as u16;
            }

            // get attribute size
            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            // check if the attribute length has overflowed.
            offset += 4;
            if len - offset < size {
                return Err(Error::InvalidInput);
            }

            // body range.
            let range = offset..(offset + size);

            // if there are padding bytes,
            // skip padding size.
            if size > 0 {
                offset += size + alignment_32(size);
            }

            // An attribute the registry does not know: remember the
            // comprehension-required ones for the 420 answer, skip the
            // rest.
            let attrkind = match AttributeType::try_from(key) {
                Ok(kind) => {
                    if kind == AttributeType::MessageIntegrity
                        || kind == AttributeType::MessageIntegritySha256
                    {
                        find_integrity = true;
                    }

                    kind
                }
                Err(_) => {
                    if AttributeType::is_comprehension_required(key) {
                        attributes.append_unknown(key);
                    }

                    continue;
                }
            };

            // get attribute body
            // insert attribute to attributes list.
            attributes.append(attrkind, range);
        }

        Ok(Self {
            size: content_len,
            attributes,
            method,
            bytes,
        })
    }

    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let size = Message::message_size(&buffer[..]).unwrap();
    ///
    /// assert_eq!(size, 20);
    /// ```
    pub fn message_size(buffer: &[u8]) -> Result<usize, Error> {
        // Only the type and length fields are needed, so stream
        // transports can learn the frame size from a partial header.
        if buffer.len() < 4 || buffer[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok((u16::from_be_bytes(buffer[2..4].try_into()?) + 20) as usize)
    }
}

/// compute padding size.
///
/// RFC5766 stipulates that the attribute content is a multiple of 4.
///
/// # Test
///
/// ```
/// use turn_relay_codec::message::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}
