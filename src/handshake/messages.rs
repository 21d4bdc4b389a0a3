/// Handshake wire messages.
///
/// Two encodings: JSON with base64 byte fields (HTTP bodies), and a compact
/// binary form where every field is a big-endian u16 length followed by the
/// bytes, prefixed with a one-byte message tag.
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::{agree, sign};
use crate::error::{CoreError, Result};

pub const CHALLENGE_LEN: usize = 32;
const MAX_COMPONENT_LEN: usize = 128;

const TAG_CHALLENGE: u8 = 0x01;
const TAG_CLIENT_HELLO: u8 = 0x02;
const TAG_SERVER_HELLO: u8 = 0x03;

pub type Challenge = [u8; CHALLENGE_LEN];

/// Step 1, responder → initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMessage {
    pub component: String,
    #[serde(with = "b64")]
    pub challenge: Challenge,
}

/// Step 2, initiator → responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub component: String,
    #[serde(with = "b64")]
    pub identity_key: [u8; sign::PUBLIC_KEY_LEN],
    #[serde(with = "b64")]
    pub ephemeral_key: [u8; agree::PUBLIC_KEY_LEN],
    #[serde(with = "b64")]
    pub challenge: Challenge,
    #[serde(with = "b64")]
    pub signature: [u8; sign::SIGNATURE_LEN],
}

/// Step 5, responder → initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub component: String,
    #[serde(with = "b64")]
    pub identity_key: [u8; sign::PUBLIC_KEY_LEN],
    #[serde(with = "b64")]
    pub ephemeral_key: [u8; agree::PUBLIC_KEY_LEN],
    #[serde(with = "b64")]
    pub challenge: Challenge,
    #[serde(with = "b64")]
    pub signature: [u8; sign::SIGNATURE_LEN],
}

impl ChallengeMessage {
    /// `Malformed` if `component` is not a valid component id.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new(TAG_CHALLENGE, &self.component)?;
        w.field(&self.challenge);
        Ok(w.finish())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, TAG_CHALLENGE)?;
        let msg = Self {
            component: r.component()?,
            challenge: r.fixed()?,
        };
        r.end()?;
        Ok(msg)
    }
}

impl ClientHello {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new(TAG_CLIENT_HELLO, &self.component)?;
        w.field(&self.identity_key)
            .field(&self.ephemeral_key)
            .field(&self.challenge)
            .field(&self.signature);
        Ok(w.finish())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, TAG_CLIENT_HELLO)?;
        let msg = Self {
            component: r.component()?,
            identity_key: r.fixed()?,
            ephemeral_key: r.fixed()?,
            challenge: r.fixed()?,
            signature: r.fixed()?,
        };
        r.end()?;
        Ok(msg)
    }
}

impl ServerHello {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new(TAG_SERVER_HELLO, &self.component)?;
        w.field(&self.identity_key)
            .field(&self.ephemeral_key)
            .field(&self.challenge)
            .field(&self.signature);
        Ok(w.finish())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, TAG_SERVER_HELLO)?;
        let msg = Self {
            component: r.component()?,
            identity_key: r.fixed()?,
            ephemeral_key: r.fixed()?,
            challenge: r.fixed()?,
            signature: r.fixed()?,
        };
        r.end()?;
        Ok(msg)
    }
}

/// Component identifiers are short printable names.
pub fn validate_component(component: &str) -> Result<()> {
    let valid = !component.is_empty()
        && component.len() <= MAX_COMPONENT_LEN
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::Malformed(format!("invalid component id {component:?}")))
    }
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    /// Every message leads with the component id, validated here so no
    /// field can outgrow its u16 length.
    fn new(tag: u8, component: &str) -> Result<Self> {
        validate_component(component)?;
        let mut w = Self { out: vec![tag] };
        w.field(component.as_bytes());
        Ok(w)
    }

    fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.out.extend_from_slice(bytes);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], tag: u8) -> Result<Self> {
        match data.first() {
            Some(&t) if t == tag => Ok(Self { data, offset: 1 }),
            Some(&t) => Err(CoreError::Malformed(format!("unexpected message tag {t:#04x}"))),
            None => Err(CoreError::Malformed("empty message".into())),
        }
    }

    fn field(&mut self) -> Result<&'a [u8]> {
        let header = self
            .data
            .get(self.offset..self.offset + 2)
            .ok_or_else(|| CoreError::Malformed("truncated field length".into()))?;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let start = self.offset + 2;
        let body = self
            .data
            .get(start..start + len)
            .ok_or_else(|| CoreError::Malformed("truncated field".into()))?;
        self.offset = start + len;
        Ok(body)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let body = self.field()?;
        body.try_into().map_err(|_| {
            CoreError::Malformed(format!("expected {N}-byte field, got {}", body.len()))
        })
    }

    fn component(&mut self) -> Result<String> {
        let body = self.field()?;
        let component = std::str::from_utf8(body)
            .map_err(|_| CoreError::Malformed("component id is not UTF-8".into()))?
            .to_string();
        validate_component(&component)?;
        Ok(component)
    }

    fn end(&self) -> Result<()> {
        if self.offset == self.data.len() {
            Ok(())
        } else {
            Err(CoreError::Malformed("trailing bytes after message".into()))
        }
    }
}

/// Serde adapter: fixed-size byte arrays as standard base64 strings.
mod b64 {
    use super::BASE64;
    use base64::Engine;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = BASE64.decode(encoded).map_err(<D::Error as DeError>::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| <D::Error as DeError>::custom(format!("expected {N} bytes, got {len}")))
    }
}
