//! Messages of the `SSH-USERAUTH` service, as described in RFC 4252 and RFC 4256,
//! framed with the [`ssh_packet`] definitions.

use std::io::{Cursor, Read, Write};

use ssh_packet::{
    arch::{Bool, Bytes, NameList, StringAscii, StringUtf8},
    binrw::{BinRead, BinWrite},
    userauth,
};

use crate::{Error, Result};

#[doc(no_inline)]
pub use ssh_packet::trans::DisconnectReason;

/// The message numbers of the `SSH-USERAUTH` service, shared by both sides.
pub mod number {
    /// `SSH_MSG_USERAUTH_REQUEST`.
    pub const USERAUTH_REQUEST: u8 = 50;

    /// `SSH_MSG_USERAUTH_FAILURE`.
    pub const USERAUTH_FAILURE: u8 = 51;

    /// `SSH_MSG_USERAUTH_SUCCESS`.
    pub const USERAUTH_SUCCESS: u8 = 52;

    /// `SSH_MSG_USERAUTH_BANNER`.
    pub const USERAUTH_BANNER: u8 = 53;

    /// `SSH_MSG_USERAUTH_PK_OK`, in the context of the `publickey` method.
    pub const USERAUTH_PK_OK: u8 = 60;

    /// `SSH_MSG_USERAUTH_PASSWD_CHANGEREQ`, in the context of the `password` method.
    pub const USERAUTH_PASSWD_CHANGEREQ: u8 = 60;

    /// `SSH_MSG_USERAUTH_INFO_REQUEST`, in the context of the `keyboard-interactive` method.
    pub const USERAUTH_INFO_REQUEST: u8 = 60;

    /// `SSH_MSG_USERAUTH_INFO_RESPONSE`.
    pub const USERAUTH_INFO_RESPONSE: u8 = 61;
}

/// A message that can be framed in a [`Packet`].
pub trait Message: Sized {
    /// The message number for this message.
    const NUMBER: u8;

    /// Write the message, its number included, to the `writer`.
    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()>;

    /// Read the message, its number included, from the `reader`.
    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self>;
}

/// A single encoded message, its number byte followed by the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("number", &self.number())
            .field("len", &self.0.len())
            .finish()
    }
}

impl Packet {
    /// Encode a message into a [`Packet`].
    pub fn new<T: Message>(message: &T) -> Result<Self> {
        let mut writer = Cursor::new(Vec::new());
        message.encode(&mut writer)?;

        Ok(Self(writer.into_inner()))
    }

    /// Wrap raw bytes received from the transport.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The message number, `None` for an empty packet.
    pub fn number(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// The payload following the message number.
    pub fn payload(&self) -> &[u8] {
        self.0.get(1..).unwrap_or_default()
    }

    /// Whether the packet carries a message of type `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.number() == Some(T::NUMBER)
    }

    /// Decode the packet as a message of type `T`.
    pub fn to<T: Message>(&self) -> Result<T> {
        match self.number() {
            Some(number) if number == T::NUMBER => {
                let mut reader = Cursor::new(self.0.as_slice());
                let message = T::decode(&mut reader)?;

                if usize::try_from(reader.position()).ok() != Some(self.0.len()) {
                    return Err(Error::Malformed("trailing bytes"));
                }

                Ok(message)
            }
            Some(number) => Err(Error::UnexpectedMessage(number)),
            None => Err(Error::Malformed("empty packet")),
        }
    }

    /// The raw bytes of the packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Malformed("invalid utf-8 string"))
}

fn count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Malformed("too many fields to be framed"))
}

/// Method-specific data of an authentication [`Request`].
#[derive(Clone, PartialEq, Eq)]
pub enum MethodData {
    /// The `none` method.
    None,

    /// The `publickey` method.
    Publickey {
        /// Public key algorithm name.
        algorithm: String,

        /// Public key blob.
        blob: Vec<u8>,

        /// Signature of the request, absent when probing for the key.
        signature: Option<Vec<u8>>,
    },

    /// The `password` method.
    Password {
        /// Plaintext password.
        password: String,

        /// New password, when answering a password change request.
        new: Option<String>,
    },

    /// The `keyboard-interactive` method.
    KeyboardInteractive {
        /// Language tag, deprecated.
        language: String,

        /// Submethods hint.
        submethods: String,
    },

    /// Any other method, with its raw data.
    Other {
        /// The method name.
        name: String,

        /// The method-specific raw data.
        data: Vec<u8>,
    },
}

impl std::fmt::Debug for MethodData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Publickey {
                algorithm,
                blob,
                signature,
            } => f
                .debug_struct("Publickey")
                .field("algorithm", algorithm)
                .field("blob", &blob.len())
                .field("signed", &signature.is_some())
                .finish(),
            Self::Password { new, .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .field("new", &new.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::KeyboardInteractive {
                language,
                submethods,
            } => f
                .debug_struct("KeyboardInteractive")
                .field("language", language)
                .field("submethods", submethods)
                .finish(),
            Self::Other { name, data } => f
                .debug_struct("Other")
                .field("name", name)
                .field("data", &data.len())
                .finish(),
        }
    }
}

impl MethodData {
    /// The method name on the wire.
    pub fn name(&self) -> &str {
        match self {
            Self::None => userauth::Method::NONE,
            Self::Publickey { .. } => userauth::Method::PUBLICKEY,
            Self::Password { .. } => userauth::Method::PASSWORD,
            Self::KeyboardInteractive { .. } => userauth::Method::KEYBOARD_INTERACTIVE,
            Self::Other { name, .. } => name,
        }
    }
}

/// The `SSH_MSG_USERAUTH_REQUEST` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The user to authenticate as.
    pub username: String,

    /// The service to start once authenticated.
    pub service_name: String,

    /// The method and its data.
    pub method: MethodData,
}

impl Request {
    /// Write the fields shared by every method, up to the method name.
    fn header(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        Self::NUMBER.write_be(writer)?;
        StringUtf8::from(self.username.as_str()).write_be(writer)?;
        StringAscii::from(self.service_name.as_str()).write_be(writer)?;
        StringAscii::from(self.method.name()).write_be(writer)?;

        Ok(())
    }
}

impl Message for Request {
    const NUMBER: u8 = number::USERAUTH_REQUEST;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        let method = match &self.method {
            MethodData::None => userauth::Method::None,
            MethodData::Publickey {
                algorithm,
                blob,
                signature,
            } => userauth::Method::Publickey {
                algorithm: algorithm.as_str().into(),
                blob: blob.as_slice().into(),
                signature: signature.as_deref().map(Into::into),
            },
            MethodData::Password { password, new } => userauth::Method::Password {
                password: password.as_str().into(),
                new: new.as_deref().map(Into::into),
            },

            // Framed field by field, the method data following the header as-is.
            MethodData::KeyboardInteractive {
                language,
                submethods,
            } => {
                self.header(writer)?;
                StringAscii::from(language.as_str()).write_be(writer)?;
                StringUtf8::from(submethods.as_str()).write_be(writer)?;

                return Ok(());
            }
            MethodData::Other { data, .. } => {
                self.header(writer)?;
                writer.write_all(data)?;

                return Ok(());
            }
        };

        userauth::Request {
            username: self.username.as_str().into(),
            service_name: self.service_name.as_str().into(),
            method,
        }
        .write(writer)?;

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let start = reader.position();

        u8::read_be(reader)?;
        let username = StringUtf8::read_be(reader)?;
        let service_name = StringAscii::read_be(reader)?;
        let name = StringAscii::read_be(reader)?;

        let method = match &*name {
            userauth::Method::NONE | userauth::Method::PUBLICKEY | userauth::Method::PASSWORD => {
                reader.set_position(start);

                match userauth::Request::read(reader)?.method {
                    userauth::Method::None => MethodData::None,
                    userauth::Method::Publickey {
                        algorithm,
                        blob,
                        signature,
                    } => MethodData::Publickey {
                        algorithm: utf8(&algorithm)?,
                        blob: blob.to_vec(),
                        signature: signature.map(|signature| signature.to_vec()),
                    },
                    userauth::Method::Password { password, new } => MethodData::Password {
                        password: password.into_string(),
                        new: new.map(StringUtf8::into_string),
                    },
                    _ => return Err(Error::Malformed("mismatching method data")),
                }
            }
            userauth::Method::KEYBOARD_INTERACTIVE => MethodData::KeyboardInteractive {
                language: StringAscii::read_be(reader)?.to_string(),
                submethods: StringUtf8::read_be(reader)?.into_string(),
            },
            _ => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;

                MethodData::Other {
                    name: name.to_string(),
                    data,
                }
            }
        };

        Ok(Self {
            username: username.into_string(),
            service_name: service_name.to_string(),
            method,
        })
    }
}

/// Build the blob signed by the client to prove ownership of a key in the `publickey` method.
pub fn signed_data(
    session_id: &[u8],
    username: &str,
    service_name: &str,
    algorithm: &str,
    blob: &[u8],
) -> Result<Vec<u8>> {
    let mut writer = Cursor::new(Vec::new());

    Bytes::from(session_id).write_be(&mut writer)?;
    number::USERAUTH_REQUEST.write_be(&mut writer)?;
    StringUtf8::from(username).write_be(&mut writer)?;
    StringAscii::from(service_name).write_be(&mut writer)?;
    StringAscii::from(userauth::Method::PUBLICKEY).write_be(&mut writer)?;
    Bool::from(true).write_be(&mut writer)?;
    Bytes::from(algorithm).write_be(&mut writer)?;
    Bytes::from(blob).write_be(&mut writer)?;

    Ok(writer.into_inner())
}

/// The `SSH_MSG_USERAUTH_FAILURE` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Methods that may productively continue the authentication.
    pub continue_with: Vec<String>,

    /// Whether the previous request succeeded, but more authentication is required.
    pub partial_success: bool,
}

impl Message for Failure {
    const NUMBER: u8 = number::USERAUTH_FAILURE;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        userauth::Failure {
            continue_with: NameList::new(&self.continue_with),
            partial_success: self.partial_success.into(),
        }
        .write(writer)?;

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let userauth::Failure {
            continue_with,
            partial_success,
        } = userauth::Failure::read(reader)?;

        Ok(Self {
            continue_with: continue_with
                .into_iter()
                .map(|name| name.to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            partial_success: *partial_success,
        })
    }
}

/// The `SSH_MSG_USERAUTH_SUCCESS` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Success;

impl Message for Success {
    const NUMBER: u8 = number::USERAUTH_SUCCESS;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        userauth::Success.write(writer)?;

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        userauth::Success::read(reader)?;

        Ok(Self)
    }
}

/// The `SSH_MSG_USERAUTH_BANNER` message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Banner {
    /// The message to display to the user.
    pub message: String,
}

impl Message for Banner {
    const NUMBER: u8 = number::USERAUTH_BANNER;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        userauth::Banner {
            message: self.message.as_str().into(),
            ..Default::default()
        }
        .write(writer)?;

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let userauth::Banner { message, .. } = userauth::Banner::read(reader)?;

        Ok(Self {
            message: message.into_string(),
        })
    }
}

/// The `SSH_MSG_USERAUTH_PK_OK` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkOk {
    /// Public key algorithm name from the request.
    pub algorithm: String,

    /// Public key blob from the request.
    pub blob: Vec<u8>,
}

impl Message for PkOk {
    const NUMBER: u8 = number::USERAUTH_PK_OK;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        userauth::PkOk {
            algorithm: self.algorithm.as_str().into(),
            blob: self.blob.as_slice().into(),
        }
        .write(writer)?;

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let userauth::PkOk { algorithm, blob } = userauth::PkOk::read(reader)?;

        Ok(Self {
            algorithm: utf8(&algorithm)?,
            blob: blob.to_vec(),
        })
    }
}

/// The `SSH_MSG_USERAUTH_PASSWD_CHANGEREQ` message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PasswdChangereq {
    /// The prompt to display for the new password.
    pub prompt: String,
}

impl Message for PasswdChangereq {
    const NUMBER: u8 = number::USERAUTH_PASSWD_CHANGEREQ;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        userauth::PasswdChangereq {
            prompt: self.prompt.as_str().into(),
            ..Default::default()
        }
        .write(writer)?;

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let userauth::PasswdChangereq { prompt, .. } = userauth::PasswdChangereq::read(reader)?;

        Ok(Self {
            prompt: prompt.into_string(),
        })
    }
}

/// A single prompt of an [`InfoRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// The text displayed to the user.
    pub prompt: String,

    /// Whether the user input should be echoed.
    pub echo: bool,
}

/// The `SSH_MSG_USERAUTH_INFO_REQUEST` message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoRequest {
    /// Name of the challenge.
    pub name: String,

    /// Instructions for the user.
    pub instruction: String,

    /// The prompts to be answered.
    pub prompts: Vec<Prompt>,
}

impl Message for InfoRequest {
    const NUMBER: u8 = number::USERAUTH_INFO_REQUEST;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        Self::NUMBER.write_be(writer)?;
        StringUtf8::from(self.name.as_str()).write_be(writer)?;
        StringUtf8::from(self.instruction.as_str()).write_be(writer)?;
        StringAscii::from("").write_be(writer)?;

        count(self.prompts.len())?.write_be(writer)?;
        for Prompt { prompt, echo } in &self.prompts {
            StringUtf8::from(prompt.as_str()).write_be(writer)?;
            Bool::from(*echo).write_be(writer)?;
        }

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        u8::read_be(reader)?;
        let name = StringUtf8::read_be(reader)?.into_string();
        let instruction = StringUtf8::read_be(reader)?.into_string();
        StringAscii::read_be(reader)?;

        let mut prompts = Vec::new();
        for _ in 0..u32::read_be(reader)? {
            prompts.push(Prompt {
                prompt: StringUtf8::read_be(reader)?.into_string(),
                echo: *Bool::read_be(reader)?,
            });
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// The `SSH_MSG_USERAUTH_INFO_RESPONSE` message.
#[derive(securefmt::Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoResponse {
    /// The answers, in the order of the prompts.
    #[sensitive]
    pub responses: Vec<String>,
}

impl Message for InfoResponse {
    const NUMBER: u8 = number::USERAUTH_INFO_RESPONSE;

    fn encode(&self, writer: &mut Cursor<Vec<u8>>) -> Result<()> {
        Self::NUMBER.write_be(writer)?;

        count(self.responses.len())?.write_be(writer)?;
        for response in &self.responses {
            StringUtf8::from(response.as_str()).write_be(writer)?;
        }

        Ok(())
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        u8::read_be(reader)?;

        let mut responses = Vec::new();
        for _ in 0..u32::read_be(reader)? {
            responses.push(StringUtf8::read_be(reader)?.into_string());
        }

        Ok(Self { responses })
    }
}
