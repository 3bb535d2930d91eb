//! Server-side authentication mechanics.

use std::time::Instant;

use enumset::EnumSet;
use futures_time::future::FutureExt;
use signature::Verifier;
use ssh_key::{Algorithm, PublicKey, Signature};

use crate::{
    broker::{Broker, Claim, Logout, Verdict},
    method::{self, Method},
    msg::{
        number, signed_data, Banner, DisconnectReason, Failure, InfoRequest, InfoResponse,
        MethodData, Packet, PasswdChangereq, PkOk, Request, Success,
    },
    transport::{Direction, Transport},
    Error, Result,
};

mod config;
pub use config::Config;

/// The state of the server-side authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The authenticator has not been started yet.
    Idle,

    /// Waiting for the peer to send an authentication request.
    AwaitingRequest,

    /// A request is being verified.
    MethodInProgress,

    /// A `keyboard-interactive` challenge has been sent, waiting for the responses.
    AwaitingInfoResponse,

    /// The peer is authenticated, the next service is started.
    Authenticated,

    /// The peer has been disconnected.
    Disconnected,
}

/// A successfully authenticated peer.
#[derive(Debug)]
pub struct Authenticated<I> {
    /// The authenticated user.
    pub user: String,

    /// The service the peer asked to be started.
    pub service: String,

    /// The method which completed the authentication.
    pub method: Method,

    /// The broker-owned handle to the authenticated principal.
    pub identity: I,

    /// A hook to be invoked when the session ends.
    pub logout: Option<Logout>,
}

#[derive(Debug)]
enum Attempt<I> {
    Success { identity: I, logout: Option<Logout> },
    Partial,
    Failure,
    Absorbed,
}

/// The authenticator for server-side sessions.
#[derive(Debug)]
pub struct Server<B> {
    config: Config,
    broker: B,

    state: State,
    supported: EnumSet<Method>,

    user: Option<String>,
    service: Option<String>,
    method: String,
    authenticated_with: EnumSet<Method>,
    login_attempts: u32,
    challenge: Option<usize>,

    started: Option<Instant>,
}

impl<B: Broker> Server<B> {
    /// Create a [`Server`] authenticator from the `config`, verifying claims with the `broker`.
    pub fn new(config: Config, broker: B) -> Self {
        Self {
            config,
            broker,

            state: State::Idle,
            supported: EnumSet::empty(),

            user: None,
            service: None,
            method: String::new(),
            authenticated_with: EnumSet::empty(),
            login_attempts: 0,
            challenge: None,

            started: None,
        }
    }

    /// The current state of the authenticator.
    pub fn state(&self) -> State {
        self.state
    }

    /// The methods supported for this session, determined at start.
    pub fn supported(&self) -> EnumSet<Method> {
        self.supported
    }

    /// The methods that partially succeeded for the current user and service.
    pub fn authenticated_with(&self) -> EnumSet<Method> {
        self.authenticated_with
    }

    /// The number of counted failed attempts.
    pub fn login_attempts(&self) -> u32 {
        self.login_attempts
    }

    /// The last user the peer tried to authenticate as.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Start the service on the `transport`, determining the supported methods and sending the banner.
    ///
    /// This arms the login timer, past which [`Self::dispatch`] disconnects the peer.
    pub async fn start(&mut self, transport: &mut impl Transport) -> Result<()> {
        self.started = Some(Instant::now());
        self.supported = self.broker.kinds().iter().map(Method::from).collect();

        if !transport.is_encrypted(Direction::Incoming) && self.supported.remove(Method::Password)
        {
            tracing::debug!("Refusing the `password` method over an unencrypted transport");
        }

        tracing::debug!(
            "Starting authentication with methods {:?}",
            method::names(self.supported)
        );

        if let Some(message) = self.config.banner.clone() {
            transport.send(Packet::new(&Banner { message })?).await?;
        }

        self.state = State::AwaitingRequest;

        Ok(())
    }

    /// Authenticate the peer, receiving packets from the `transport` until
    /// it is authenticated, disconnected or the login timeout expires.
    pub async fn serve(
        &mut self,
        transport: &mut impl Transport,
    ) -> Result<Authenticated<B::Identity>> {
        let timeout = self.config.login_timeout;

        match self.run(transport).timeout(timeout).await {
            Ok(result) => result,
            Err(_) => self.expire(transport).await,
        }
    }

    async fn expire<T>(&mut self, transport: &mut impl Transport) -> Result<T> {
        tracing::warn!(
            "Peer took too long to authenticate, as user `{}`",
            self.user.as_deref().unwrap_or_default()
        );

        self.state = State::Disconnected;
        transport
            .disconnect(
                DisconnectReason::NoMoreAuthMethodsAvailable,
                "you took too long",
            )
            .await?;

        Err(Error::Timeout)
    }

    async fn run(&mut self, transport: &mut impl Transport) -> Result<Authenticated<B::Identity>> {
        if self.state == State::Idle {
            self.start(transport).await?;
        }

        loop {
            let packet = transport.recv().await?;

            if let Some(authenticated) = self.dispatch(transport, packet).await? {
                break Ok(authenticated);
            }
        }
    }

    /// Process a single `packet` received from the peer.
    ///
    /// Yields the [`Authenticated`] peer upon success, `None` while the authentication continues.
    pub async fn dispatch(
        &mut self,
        transport: &mut impl Transport,
        packet: Packet,
    ) -> Result<Option<Authenticated<B::Identity>>> {
        match self.state {
            State::Authenticated | State::Disconnected => return Err(Error::Disconnected),
            State::Idle => self.start(transport).await?,
            _ => (),
        }

        if self
            .started
            .is_some_and(|started| started.elapsed() >= *self.config.login_timeout)
        {
            return self.expire(transport).await;
        }

        let attempt = match packet.number() {
            Some(number::USERAUTH_REQUEST) => match packet.to::<Request>() {
                Ok(request) => self.request(transport, request).await?,
                Err(err) => return self.protocol_error(transport, err).await,
            },
            Some(number::USERAUTH_INFO_RESPONSE) if self.state == State::AwaitingInfoResponse => {
                match packet.to::<InfoResponse>() {
                    Ok(response) => self.info_response(response).await,
                    Err(err) => return self.protocol_error(transport, err).await,
                }
            }
            Some(other) => {
                return self
                    .protocol_error(transport, Error::UnexpectedMessage(other))
                    .await
            }
            None => {
                return self
                    .protocol_error(transport, Error::Malformed("empty packet"))
                    .await
            }
        };

        self.conclude(transport, attempt).await
    }

    async fn request(
        &mut self,
        transport: &mut impl Transport,
        request: Request,
    ) -> Result<Attempt<B::Identity>> {
        let Request {
            username,
            service_name,
            method,
        } = request;

        if self.user.as_deref() != Some(username.as_str())
            || self.service.as_deref() != Some(service_name.as_str())
        {
            if !self.authenticated_with.is_empty() {
                tracing::debug!("User or service changed, clearing partial successes");
            }

            self.authenticated_with.clear();
        }

        self.user = Some(username.clone());
        self.service = Some(service_name.clone());
        self.method = method.name().into();
        self.challenge = None;
        self.state = State::MethodInProgress;

        tracing::debug!(
            "Attempt using method `{}` for user `{username}` and service `{service_name}`",
            self.method
        );

        if !Method::from_name(&self.method).is_some_and(|method| self.supported.contains(method)) {
            return Ok(Attempt::Failure);
        }

        Ok(match method {
            MethodData::Publickey {
                algorithm,
                blob,
                signature,
            } => {
                let key = match PublicKey::from_bytes(&blob) {
                    Ok(key) if algorithm_matches(&algorithm, key.algorithm()) => key,
                    Ok(_) => {
                        tracing::debug!("Algorithm `{algorithm}` doesn't match the provided key");

                        return Ok(Attempt::Failure);
                    }
                    Err(err) => {
                        tracing::debug!("Unable to parse the provided public key: {err}");

                        return Ok(Attempt::Failure);
                    }
                };

                match signature {
                    None => {
                        let claim = Claim::Publickey {
                            algorithm: algorithm.clone(),
                            key,
                            signed: false,
                        };

                        match self.verify(&username, claim).await {
                            Some(Verdict::Accept { .. } | Verdict::Partial) => {
                                transport
                                    .send(Packet::new(&PkOk { algorithm, blob })?)
                                    .await?;

                                Attempt::Absorbed
                            }
                            _ => Attempt::Failure,
                        }
                    }
                    Some(signature) => {
                        let message = signed_data(
                            transport.session_id(),
                            &username,
                            &service_name,
                            &algorithm,
                            &blob,
                        )?;

                        let verified = Signature::try_from(signature.as_slice())
                            .ok()
                            .filter(|signature| {
                                algorithm_matches(&algorithm, signature.algorithm())
                            })
                            .is_some_and(|signature| {
                                Verifier::verify(&key, &message, &signature).is_ok()
                            });

                        if verified {
                            let claim = Claim::Publickey {
                                algorithm,
                                key,
                                signed: true,
                            };

                            self.verify(&username, claim).await.into()
                        } else {
                            tracing::info!("Invalid signature from user `{username}`");

                            Attempt::Failure
                        }
                    }
                }
            }

            MethodData::Password { password, new } => {
                let claim = Claim::Password { password, new };

                match self.verify(&username, claim).await {
                    Some(Verdict::PasswordExpired { prompt }) => {
                        tracing::debug!("Password of user `{username}` expired, asking for a change");

                        transport
                            .send(Packet::new(&PasswdChangereq { prompt })?)
                            .await?;

                        Attempt::Absorbed
                    }
                    verdict @ Some(Verdict::Accept { .. } | Verdict::Partial) => verdict.into(),
                    _ => {
                        futures_time::task::sleep(self.config.password_delay).await;

                        Attempt::Failure
                    }
                }
            }

            MethodData::KeyboardInteractive { .. } => match self.broker.challenge(&username).await {
                Some(challenge) => {
                    self.challenge = Some(challenge.prompts.len());
                    self.state = State::AwaitingInfoResponse;

                    transport
                        .send(Packet::new(&InfoRequest {
                            name: challenge.name,
                            instruction: challenge.instruction,
                            prompts: challenge.prompts,
                        })?)
                        .await?;

                    Attempt::Absorbed
                }
                None => Attempt::Failure,
            },

            MethodData::None | MethodData::Other { .. } => Attempt::Failure,
        })
    }

    async fn info_response(&mut self, response: InfoResponse) -> Attempt<B::Identity> {
        let expected = self.challenge.take();
        self.state = State::MethodInProgress;

        let user = self.user.clone().unwrap_or_default();
        let InfoResponse { responses } = response;

        if expected != Some(responses.len()) {
            tracing::info!(
                "User `{user}` answered {} prompts, expected {expected:?}",
                responses.len()
            );

            return Attempt::Failure;
        }

        self.verify(&user, Claim::KeyboardInteractive { responses })
            .await
            .into()
    }

    /// Consult the broker, `None` on internal broker errors.
    async fn verify(&mut self, user: &str, claim: Claim) -> Option<Verdict<B::Identity>> {
        let kind = claim.kind();

        match self.broker.verify(user, claim).await {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                tracing::warn!("Broker failed to verify a {kind:?} claim for user `{user}`: {err}");

                None
            }
        }
    }

    async fn conclude(
        &mut self,
        transport: &mut impl Transport,
        attempt: Attempt<B::Identity>,
    ) -> Result<Option<Authenticated<B::Identity>>> {
        match attempt {
            Attempt::Success { identity, logout } => {
                let user = self.user.clone().unwrap_or_default();
                let service = self.service.clone().unwrap_or_default();

                let method = match Method::from_name(&self.method) {
                    Some(method) if self.config.services.contains(&service) => method,
                    _ => {
                        tracing::info!("Unable to start service `{service}` for user `{user}`");

                        if let Some(logout) = logout {
                            logout.call();
                        }

                        return self.failure(transport).await;
                    }
                };

                transport.send(Packet::new(&Success)?).await?;
                transport.set_service(&service);
                self.state = State::Authenticated;

                tracing::info!("User `{user}` authenticated with method `{method}`");

                Ok(Some(Authenticated {
                    user,
                    service,
                    method,
                    identity,
                    logout,
                }))
            }
            Attempt::Partial => {
                if let Some(method) = Method::from_name(&self.method) {
                    self.authenticated_with.insert(method);
                }

                tracing::debug!(
                    "User `{}` partially authenticated with method `{}`",
                    self.user.as_deref().unwrap_or_default(),
                    self.method
                );

                transport
                    .send(Packet::new(&Failure {
                        continue_with: self.advertised(),
                        partial_success: true,
                    })?)
                    .await?;
                self.state = State::AwaitingRequest;

                Ok(None)
            }
            Attempt::Failure => self.failure(transport).await,
            Attempt::Absorbed => {
                if self.state == State::MethodInProgress {
                    self.state = State::AwaitingRequest;
                }

                Ok(None)
            }
        }
    }

    async fn failure(
        &mut self,
        transport: &mut impl Transport,
    ) -> Result<Option<Authenticated<B::Identity>>> {
        if self.method != Method::None.name() {
            self.login_attempts += 1;

            tracing::info!(
                "User `{}` failed authentication with method `{}` ({}/{})",
                self.user.as_deref().unwrap_or_default(),
                self.method,
                self.login_attempts,
                self.config.attempts_before_disconnect
            );

            if self.login_attempts > self.config.attempts_before_disconnect {
                tracing::warn!("Disconnecting peer after too many failed attempts");

                self.state = State::Disconnected;
                transport
                    .disconnect(
                        DisconnectReason::NoMoreAuthMethodsAvailable,
                        "too many bad auths",
                    )
                    .await?;

                return Err(Error::AttemptsExhausted);
            }
        }

        transport
            .send(Packet::new(&Failure {
                continue_with: self.advertised(),
                partial_success: false,
            })?)
            .await?;
        self.state = State::AwaitingRequest;

        Ok(None)
    }

    async fn protocol_error(
        &mut self,
        transport: &mut impl Transport,
        err: Error,
    ) -> Result<Option<Authenticated<B::Identity>>> {
        tracing::warn!("Disconnecting peer on protocol error: {err}");

        self.state = State::Disconnected;
        transport
            .disconnect(
                DisconnectReason::ProtocolError,
                "Unexpected or malformed message in the `ssh-userauth` service",
            )
            .await?;

        Err(err)
    }

    /// The methods advertised to the peer, excluding the ones that already succeeded.
    fn advertised(&self) -> Vec<String> {
        method::names(self.supported - self.authenticated_with)
            .into_iter()
            .map(Into::into)
            .collect()
    }
}

impl<I> From<Option<Verdict<I>>> for Attempt<I> {
    fn from(verdict: Option<Verdict<I>>) -> Self {
        match verdict {
            Some(Verdict::Accept { identity, logout }) => Self::Success { identity, logout },
            Some(Verdict::Partial) => Self::Partial,
            Some(Verdict::PasswordExpired { .. } | Verdict::Reject) | None => Self::Failure,
        }
    }
}

/// Whether the announced `name` designates the `algorithm`, regardless of the RSA hash.
fn algorithm_matches(name: &str, algorithm: Algorithm) -> bool {
    match Algorithm::new(name) {
        Ok(Algorithm::Rsa { .. }) => matches!(algorithm, Algorithm::Rsa { .. }),
        Ok(announced) => announced == algorithm,
        Err(_) => false,
    }
}
