//! Client-side authentication mechanics.

use enumset::EnumSet;
use signature::Signer;
use ssh_key::{PrivateKey, PublicKey, Signature};

use crate::{
    method::Method,
    msg::{
        number, signed_data, Banner, DisconnectReason, Failure, InfoRequest, InfoResponse,
        MethodData, Packet, PasswdChangereq, PkOk, Request, Success,
    },
    transport::Transport,
    Error, Result,
};

mod config;
pub use config::Config;

pub mod secrets;
pub use secrets::{Keyring, Secrets};

/// The state of the client-side authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The authenticator has not been started yet.
    Idle,

    /// A request has been sent, waiting for the server to answer.
    Offering,

    /// The server asked for more data for the method in flight.
    Challenged,

    /// The server accepted the authentication, the next service is started.
    Authenticated,

    /// The session has been disconnected.
    Disconnected,
}

/// The authenticator for client-side sessions.
#[derive(Debug)]
pub struct Client<S> {
    config: Config,
    secrets: S,

    state: State,
    last_auth: Option<Method>,
    authenticated_with: EnumSet<Method>,
    exhausted: EnumSet<Method>,
    challenged: bool,

    tried_keys: Vec<PublicKey>,
    last_key: Option<PublicKey>,

    banner: Option<String>,
}

impl<S: Secrets> Client<S> {
    /// Create a [`Client`] authenticator from the `config`, drawing credentials from the `secrets`.
    pub fn new(config: Config, secrets: S) -> Self {
        Self {
            config,
            secrets,

            state: State::Idle,
            last_auth: None,
            authenticated_with: EnumSet::empty(),
            exhausted: EnumSet::empty(),
            challenged: false,

            tried_keys: Vec::new(),
            last_key: None,

            banner: None,
        }
    }

    /// The current state of the authenticator.
    pub fn state(&self) -> State {
        self.state
    }

    /// The methods that partially succeeded.
    pub fn authenticated_with(&self) -> EnumSet<Method> {
        self.authenticated_with
    }

    /// The method of the last request sent, `None` for the `none` method.
    pub fn last_auth(&self) -> Option<Method> {
        self.last_auth
    }

    /// The keys already offered to the server.
    pub fn tried_keys(&self) -> &[PublicKey] {
        &self.tried_keys
    }

    /// The last banner received from the server.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Start the authentication on the `transport`, asking for the `none` method
    /// to discover the methods available on the server.
    pub async fn start(&mut self, transport: &mut impl Transport) -> Result<()> {
        tracing::debug!(
            "Starting authentication as `{}` for service `{}`",
            self.config.user,
            self.config.service
        );

        self.ask(transport, MethodData::None).await
    }

    /// Authenticate to the server, receiving packets from the `transport`
    /// until authenticated or out of methods to try.
    pub async fn serve(&mut self, transport: &mut impl Transport) -> Result<()> {
        if self.state == State::Idle {
            self.start(transport).await?;
        }

        loop {
            let packet = transport.recv().await?;

            if self.dispatch(transport, packet).await? {
                break Ok(());
            }
        }
    }

    /// Process a single `packet` received from the server.
    ///
    /// Yields `true` once authenticated, `false` while the authentication continues.
    pub async fn dispatch(&mut self, transport: &mut impl Transport, packet: Packet) -> Result<bool> {
        match self.state {
            State::Authenticated | State::Disconnected => return Err(Error::Disconnected),
            State::Idle => self.start(transport).await?,
            _ => (),
        }

        let result = match packet.number() {
            Some(number::USERAUTH_SUCCESS) => match packet.to::<Success>() {
                Ok(Success) => {
                    tracing::info!(
                        "Authenticated as `{}` with method `{}`",
                        self.config.user,
                        self.last_auth.unwrap_or(Method::None)
                    );

                    self.state = State::Authenticated;
                    transport.set_service(&self.config.service);

                    return Ok(true);
                }
                Err(err) => Err(err),
            },
            Some(number::USERAUTH_FAILURE) => match packet.to::<Failure>() {
                Ok(failure) => return self.failure(transport, failure).await.map(|()| false),
                Err(err) => Err(err),
            },
            Some(number::USERAUTH_BANNER) => match packet.to::<Banner>() {
                Ok(Banner { message, .. }) => {
                    tracing::info!("Server banner: {message}");
                    self.banner = Some(message);

                    return Ok(false);
                }
                Err(err) => Err(err),
            },
            Some(number::USERAUTH_PK_OK) => self.method_specific(transport, &packet).await,
            Some(other) => Err(Error::UnexpectedMessage(other)),
            None => Err(Error::Malformed("empty packet")),
        };

        match result {
            Ok(()) => Ok(false),
            Err(err @ (Error::Binary(_) | Error::Malformed(_) | Error::UnexpectedMessage(_))) => {
                tracing::warn!("Disconnecting from server on protocol error: {err}");

                self.state = State::Disconnected;
                transport
                    .disconnect(
                        DisconnectReason::ProtocolError,
                        "Unexpected or malformed message in the `ssh-userauth` service",
                    )
                    .await?;

                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn ask(&mut self, transport: &mut impl Transport, method: MethodData) -> Result<()> {
        self.last_auth = match &method {
            MethodData::None => None,
            method => Method::from_name(method.name()),
        };
        self.state = State::Offering;

        tracing::debug!("Trying method `{}`", method.name());

        transport
            .send(Packet::new(&Request {
                username: self.config.user.clone(),
                service_name: self.config.service.clone(),
                method,
            })?)
            .await
    }

    async fn failure(&mut self, transport: &mut impl Transport, failure: Failure) -> Result<()> {
        let Failure {
            continue_with,
            partial_success,
        } = failure;

        if partial_success {
            if let Some(method) = self.last_auth {
                tracing::debug!("Partial success with method `{method}`");

                self.authenticated_with.insert(method);
            }
        } else if self.last_auth == Some(Method::KeyboardInteractive) && !self.challenged {
            // The server refused to challenge us, asking again is pointless.
            self.exhausted.insert(Method::KeyboardInteractive);
        }

        let candidates = rank(&self.config.preferred, self.authenticated_with, continue_with);
        tracing::debug!("Server can continue with {candidates:?}");

        for name in candidates {
            if self.offer(transport, &name).await? {
                return Ok(());
            }
        }

        tracing::warn!("Exhausted available authentication methods");

        self.state = State::Disconnected;
        transport
            .disconnect(
                DisconnectReason::NoMoreAuthMethodsAvailable,
                "no more authentication methods available",
            )
            .await?;

        Err(Error::MethodsExhausted)
    }

    /// Offer the method named `name`, yielding whether there was material to offer.
    async fn offer(&mut self, transport: &mut impl Transport, name: &str) -> Result<bool> {
        let method = match Method::from_name(name) {
            Some(method) if !self.exhausted.contains(method) => method,
            _ => return Ok(false),
        };

        let offered = match method {
            Method::Publickey => {
                // A source restarting from its first key gets to skip the tried ones once.
                let mut skips = self.tried_keys.len();
                let key = loop {
                    match self.secrets.next_publickey().await {
                        Some(key) if self.tried_keys.contains(&key) => {
                            if skips == 0 {
                                tracing::debug!("The key source keeps yielding offered keys");

                                break None;
                            }

                            skips -= 1;
                        }
                        key => break key,
                    }
                };

                match key {
                    Some(key) => {
                        tracing::debug!("Offering key of type `{}`", key.algorithm());

                        let algorithm = key.algorithm().as_str().to_owned();
                        let blob = key.to_bytes()?;

                        self.last_key = Some(key.clone());
                        self.tried_keys.push(key);

                        self.ask(
                            transport,
                            MethodData::Publickey {
                                algorithm,
                                blob,
                                signature: None,
                            },
                        )
                        .await?;

                        true
                    }
                    None => false,
                }
            }
            Method::Password => match self.secrets.password(None).await {
                Some(password) => {
                    self.ask(transport, MethodData::Password { password, new: None })
                        .await?;

                    true
                }
                None => false,
            },
            Method::KeyboardInteractive => {
                self.challenged = false;
                self.ask(
                    transport,
                    MethodData::KeyboardInteractive {
                        language: String::new(),
                        submethods: String::new(),
                    },
                )
                .await?;

                true
            }
            Method::None | Method::Hostbased => false,
        };

        if !offered {
            tracing::debug!("No more material to offer for method `{method}`");

            self.exhausted.insert(method);
        }

        Ok(offered)
    }

    /// Handle the overloaded message number 60, depending on the method in flight.
    async fn method_specific(&mut self, transport: &mut impl Transport, packet: &Packet) -> Result<()> {
        self.state = State::Challenged;

        match self.last_auth {
            Some(Method::Publickey) => {
                packet.to::<PkOk>()?;

                self.sign(transport).await
            }
            Some(Method::Password) => {
                let PasswdChangereq { prompt, .. } = packet.to::<PasswdChangereq>()?;

                self.change_password(transport, prompt).await
            }
            Some(Method::KeyboardInteractive) => {
                let request = packet.to::<InfoRequest>()?;

                self.answer(transport, request).await
            }
            _ => self.ask(transport, MethodData::None).await,
        }
    }

    async fn sign(&mut self, transport: &mut impl Transport) -> Result<()> {
        let Some(key) = self.last_key.clone() else {
            return self.ask(transport, MethodData::None).await;
        };

        let Some(private) = self.secrets.private_key(&key).await else {
            tracing::debug!("No private key to sign with, moving on");

            return self.ask(transport, MethodData::None).await;
        };

        let algorithm = key.algorithm().as_str().to_owned();
        let blob = key.to_bytes()?;
        let message = signed_data(
            transport.session_id(),
            &self.config.user,
            &self.config.service,
            &algorithm,
            &blob,
        )?;

        let signature = match <PrivateKey as Signer<Signature>>::try_sign(&private, &message) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::warn!("Unable to sign the authentication request: {err}");

                return self.ask(transport, MethodData::None).await;
            }
        };

        self.ask(
            transport,
            MethodData::Publickey {
                algorithm,
                blob,
                signature: Some(Vec::try_from(signature)?),
            },
        )
        .await
    }

    async fn change_password(&mut self, transport: &mut impl Transport, prompt: String) -> Result<()> {
        tracing::debug!("Server asked for a password change");

        let old = self.secrets.password(Some(secrets::OLD_PASSWORD_PROMPT)).await;
        let new = match old {
            Some(_) => self.secrets.password(Some(&prompt)).await,
            None => None,
        };

        let (Some(old), Some(new)) = (old, new) else {
            tracing::debug!("No password to change to, moving on");

            self.exhausted.insert(Method::Password);
            return self.ask(transport, MethodData::None).await;
        };

        self.ask(
            transport,
            MethodData::Password {
                password: old,
                new: Some(new),
            },
        )
        .await
    }

    async fn answer(&mut self, transport: &mut impl Transport, request: InfoRequest) -> Result<()> {
        let InfoRequest {
            name,
            instruction,
            prompts,
            ..
        } = request;

        self.challenged = true;

        match self.secrets.answers(&name, &instruction, &prompts).await {
            Some(responses) => {
                self.state = State::Offering;

                transport
                    .send(Packet::new(&InfoResponse { responses })?)
                    .await
            }
            None => {
                tracing::debug!("No answers to the keyboard-interactive challenge, moving on");

                self.exhausted.insert(Method::KeyboardInteractive);
                self.ask(transport, MethodData::None).await
            }
        }
    }
}

/// Sort the method `names` by their position in the `preferred` list,
/// unknown methods last in their original order, leaving out the `succeeded` ones.
fn rank(preferred: &[Method], succeeded: EnumSet<Method>, names: Vec<String>) -> Vec<String> {
    let position = |name: &String| {
        Method::from_name(name)
            .and_then(|method| preferred.iter().position(|&p| p == method))
            .unwrap_or(preferred.len())
    };

    let mut names = names
        .into_iter()
        .filter(|name| !Method::from_name(name).is_some_and(|method| succeeded.contains(method)))
        .collect::<Vec<_>>();
    names.sort_by_key(position);

    names
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|&name| name.into()).collect()
    }

    #[rstest]
    #[case(&["password", "keyboard-interactive"], &["password", "keyboard-interactive"])]
    #[case(&["keyboard-interactive", "password"], &["password", "keyboard-interactive"])]
    #[case(
        &["gssapi-with-mic", "keyboard-interactive", "hostbased", "publickey"],
        &["publickey", "keyboard-interactive", "gssapi-with-mic", "hostbased"]
    )]
    fn ranks_by_preference(#[case] available: &[&str], #[case] expected: &[&str]) {
        let ranked = rank(
            &Config::default().preferred,
            EnumSet::empty(),
            names(available),
        );

        assert_eq!(ranked, expected);
    }

    #[test]
    fn ranking_skips_succeeded_methods() {
        let ranked = rank(
            &Config::default().preferred,
            Method::Publickey.into(),
            names(&["publickey", "password"]),
        );

        assert_eq!(ranked, ["password"]);
    }
}
