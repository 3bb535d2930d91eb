#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use enumset::EnumSet;
use flume::{Receiver, Sender};
use signature::Signer;
use ssh_key::{Algorithm, PrivateKey, PublicKey, Signature};

use assh_userauth::{
    broker::{Broker, Challenge, Claim, Kind, Logout, Verdict},
    msg::{signed_data, DisconnectReason, Message, MethodData, Packet, Prompt, Request},
    transport::{Direction, Transport},
    Error, Result, CONNECTION_SERVICE_NAME,
};

pub const SESSION_ID: &[u8] = b"\x13\x37session-identifier";

pub const EXPIRED_PROMPT: &str = "Your password has expired, enter a new one: ";

pub fn key() -> PrivateKey {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
}

/// A transport fed from a queue, recording everything sent to the peer.
#[derive(Debug, Default)]
pub struct Recorder {
    pub incoming: VecDeque<Packet>,
    pub sent: Vec<Packet>,
    pub disconnected: Option<(DisconnectReason, String)>,
    pub service: Option<String>,

    encrypted: bool,
}

impl Recorder {
    pub fn encrypted() -> Self {
        Self {
            encrypted: true,
            ..Default::default()
        }
    }

    pub fn plaintext() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, message: &impl Message) -> &mut Self {
        self.incoming.push_back(Packet::new(message).unwrap());

        self
    }

    pub fn last<T: Message>(&self) -> T {
        self.sent.last().expect("nothing was sent").to().unwrap()
    }
}

impl Transport for Recorder {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        if self.disconnected.is_some() {
            return Err(Error::Disconnected);
        }

        self.sent.push(packet);

        Ok(())
    }

    async fn recv(&mut self) -> Result<Packet> {
        match self.incoming.pop_front() {
            Some(packet) => Ok(packet),
            None => futures::future::pending().await,
        }
    }

    async fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> Result<()> {
        self.disconnected = Some((reason, description.into()));

        Ok(())
    }

    fn is_encrypted(&self, _: Direction) -> bool {
        self.encrypted
    }

    fn session_id(&self) -> &[u8] {
        SESSION_ID
    }

    fn set_service(&mut self, name: &str) {
        self.service = Some(name.into());
    }
}

/// One end of an in-memory loopback transport.
#[derive(Debug)]
pub struct Pipe {
    tx: Option<Sender<Packet>>,
    rx: Receiver<Packet>,

    pub sent: Vec<Packet>,
    pub disconnected: Option<(DisconnectReason, String)>,
    pub service: Option<String>,
}

pub fn pipe() -> (Pipe, Pipe) {
    let (atx, arx) = flume::unbounded();
    let (btx, brx) = flume::unbounded();

    let end = |tx, rx| Pipe {
        tx: Some(tx),
        rx,
        sent: Vec::new(),
        disconnected: None,
        service: None,
    };

    (end(atx, brx), end(btx, arx))
}

impl Transport for Pipe {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::Disconnected)?;
        self.sent.push(packet.clone());

        tx.send_async(packet)
            .await
            .map_err(|_| Error::Disconnected)
    }

    async fn recv(&mut self) -> Result<Packet> {
        self.rx.recv_async().await.map_err(|_| Error::Disconnected)
    }

    async fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> Result<()> {
        self.disconnected = Some((reason, description.into()));
        self.tx = None;

        Ok(())
    }

    fn is_encrypted(&self, _: Direction) -> bool {
        true
    }

    fn session_id(&self) -> &[u8] {
        SESSION_ID
    }

    fn set_service(&mut self, name: &str) {
        self.service = Some(name.into());
    }
}

/// An in-memory credential directory.
#[derive(Debug, Default)]
pub struct Directory {
    pub kinds: EnumSet<Kind>,

    pub password: Option<String>,
    pub expired: bool,
    pub keys: Vec<PublicKey>,
    pub challenge: Option<Challenge>,
    pub answers: Vec<String>,

    pub partial: EnumSet<Kind>,
    pub unreachable: bool,

    pub claims: Vec<String>,
    pub logouts: Arc<AtomicUsize>,
}

impl Directory {
    pub fn new(kinds: impl Into<EnumSet<Kind>>) -> Self {
        Self {
            kinds: kinds.into(),
            ..Default::default()
        }
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.into());

        self
    }

    pub fn key(mut self, key: &PublicKey) -> Self {
        self.keys.push(key.clone());

        self
    }

    pub fn challenge(mut self, prompts: &[&str], answers: &[&str]) -> Self {
        self.challenge = Some(Challenge {
            name: "Two-factor".into(),
            instruction: "Answer the questions".into(),
            prompts: prompts
                .iter()
                .map(|&prompt| Prompt {
                    prompt: prompt.into(),
                    echo: false,
                })
                .collect(),
        });
        self.answers = answers.iter().map(|&answer| answer.into()).collect();

        self
    }
}

impl Broker for Directory {
    type Identity = String;
    type Err = std::io::Error;

    fn kinds(&self) -> EnumSet<Kind> {
        self.kinds
    }

    async fn verify(&mut self, user: &str, claim: Claim) -> Result<Verdict<String>, Self::Err> {
        self.claims.push(format!("{claim:?}"));

        if self.unreachable {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "directory unreachable",
            ));
        }

        let kind = claim.kind();
        let valid = match claim {
            Claim::Publickey { key, .. } => self.keys.contains(&key),
            Claim::Password { password, new } => {
                if self.password.as_deref() != Some(password.as_str()) {
                    false
                } else if !self.expired {
                    true
                } else if let Some(new) = new {
                    self.password = Some(new);
                    self.expired = false;

                    true
                } else {
                    return Ok(Verdict::PasswordExpired {
                        prompt: EXPIRED_PROMPT.into(),
                    });
                }
            }
            Claim::KeyboardInteractive { responses } => responses == self.answers,
        };

        Ok(if !valid {
            Verdict::Reject
        } else if self.partial.contains(kind) {
            Verdict::Partial
        } else {
            let logouts = Arc::clone(&self.logouts);

            Verdict::Accept {
                identity: user.to_owned(),
                logout: Some(Logout::new(move || {
                    logouts.fetch_add(1, Ordering::SeqCst);
                })),
            }
        })
    }

    async fn challenge(&mut self, _: &str) -> Option<Challenge> {
        self.challenge.clone()
    }
}

pub fn request(user: &str, method: MethodData) -> Request {
    Request {
        username: user.into(),
        service_name: CONNECTION_SERVICE_NAME.into(),
        method,
    }
}

pub fn password(password: &str) -> MethodData {
    MethodData::Password {
        password: password.into(),
        new: None,
    }
}

pub fn keyboard_interactive() -> MethodData {
    MethodData::KeyboardInteractive {
        language: String::new(),
        submethods: String::new(),
    }
}

/// Sign a `publickey` request for the `user`, as a client would.
pub fn signed(key: &PrivateKey, user: &str) -> MethodData {
    let algorithm = key.algorithm().as_str().to_owned();
    let blob = key.public_key().to_bytes().unwrap();

    let message =
        signed_data(SESSION_ID, user, CONNECTION_SERVICE_NAME, &algorithm, &blob).unwrap();
    let signature = <PrivateKey as Signer<Signature>>::try_sign(key, &message).unwrap();

    MethodData::Publickey {
        algorithm,
        blob,
        signature: Some(Vec::try_from(signature).unwrap()),
    }
}
