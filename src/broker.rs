//! The credential broker, the authority validating identity claims on the server side.

use std::sync::Arc;

use enumset::{EnumSet, EnumSetType};
use futures::Future;

#[doc(no_inline)]
pub use ssh_key::PublicKey;

use crate::{
    method::Method,
    msg::Prompt,
    pool::{BoxError, Pool, WorkError},
};

/// The kinds of credentials a [`Broker`] is able to verify.
#[derive(Debug, Hash, EnumSetType)]
pub enum Kind {
    /// Public keys, for the `publickey` method.
    Publickey,

    /// Passwords, for the `password` method.
    Password,

    /// Challenge responses, for the `keyboard-interactive` method.
    KeyboardInteractive,
}

impl From<Kind> for Method {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Publickey => Self::Publickey,
            Kind::Password => Self::Password,
            Kind::KeyboardInteractive => Self::KeyboardInteractive,
        }
    }
}

/// A claimed credential, consumed by [`Broker::verify`].
pub enum Claim {
    /// A public key, whose ownership has been proven if `signed`.
    Publickey {
        /// The algorithm name announced by the peer.
        algorithm: String,

        /// The public key.
        key: PublicKey,

        /// Whether the request was signed with the private key, and the signature verified.
        ///
        /// An unsigned claim only asks whether the key would be acceptable.
        signed: bool,
    },

    /// A plaintext password.
    Password {
        /// The password.
        password: String,

        /// The new password, when answering a password change request.
        new: Option<String>,
    },

    /// Responses to a keyboard-interactive [`Challenge`].
    KeyboardInteractive {
        /// The responses, in the order of the prompts.
        responses: Vec<String>,
    },
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publickey {
                algorithm, signed, ..
            } => f
                .debug_struct("Publickey")
                .field("algorithm", algorithm)
                .field("signed", signed)
                .finish_non_exhaustive(),
            Self::Password { new, .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .field("new", &new.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::KeyboardInteractive { responses } => f
                .debug_struct("KeyboardInteractive")
                .field("responses", &responses.len())
                .finish(),
        }
    }
}

impl Claim {
    /// The [`Kind`] of this claim.
    pub fn kind(&self) -> Kind {
        match self {
            Self::Publickey { .. } => Kind::Publickey,
            Self::Password { .. } => Kind::Password,
            Self::KeyboardInteractive { .. } => Kind::KeyboardInteractive,
        }
    }
}

/// A hook invoked when the authenticated session ends.
pub struct Logout(Box<dyn FnOnce() + Send>);

impl Logout {
    /// Wrap the `hook` in a [`Logout`].
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(hook))
    }

    /// Run the hook.
    pub fn call(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Logout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Logout")
    }
}

/// The verdict of a [`Broker`] on a [`Claim`].
#[derive(Debug)]
pub enum Verdict<I> {
    /// _Accept_ the claim, authenticating the user.
    ///
    /// For an unsigned `publickey` claim, this only means the key is acceptable.
    Accept {
        /// The broker-owned handle to the authenticated principal.
        identity: I,

        /// A hook invoked when the session ends.
        logout: Option<Logout>,
    },

    /// The claim is valid, but more authentication is required.
    Partial,

    /// The password is valid but expired, ask the user to change it.
    PasswordExpired {
        /// The prompt displayed to user before the password change.
        prompt: String,
    },

    /// _Reject_ the claim.
    Reject,
}

/// A `keyboard-interactive` challenge, sent to the peer as prompts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Challenge {
    /// Name of the challenge.
    pub name: String,

    /// Instructions for the user.
    pub instruction: String,

    /// The prompts to be answered.
    pub prompts: Vec<Prompt>,
}

/// An interface to the credential authority.
pub trait Broker {
    /// The handle to an authenticated principal, forwarded untouched by the engine.
    type Identity;

    /// The internal error of the broker, distinct from a rejected claim.
    type Err: std::error::Error;

    /// The kinds of credentials this broker is able to verify.
    fn kinds(&self) -> EnumSet<Kind>;

    /// Verify the `claim` made for the `user`.
    fn verify(
        &mut self,
        user: &str,
        claim: Claim,
    ) -> impl Future<Output = Result<Verdict<Self::Identity>, Self::Err>>;

    /// Produce a `keyboard-interactive` challenge for the `user`, `None` to refuse.
    fn challenge(&mut self, user: &str) -> impl Future<Output = Option<Challenge>> {
        let _ = user;

        async { None }
    }
}

/// A default implementation of the broker that knows no credentials.
impl Broker for () {
    type Identity = ();
    type Err = std::convert::Infallible;

    fn kinds(&self) -> EnumSet<Kind> {
        EnumSet::empty()
    }

    async fn verify(&mut self, _: &str, _: Claim) -> Result<Verdict<()>, Self::Err> {
        Ok(Verdict::Reject)
    }
}

/// A synchronous credential check, possibly blocking on some external directory.
pub trait Checker: Send + Sync + 'static {
    /// The handle to an authenticated principal.
    type Identity: Send + 'static;

    /// The kinds of credentials this checker is able to verify.
    fn kinds(&self) -> EnumSet<Kind>;

    /// Verify the `claim` made for the `user`, blocking the current thread.
    fn check(&self, user: &str, claim: Claim) -> Result<Verdict<Self::Identity>, BoxError>;
}

/// A [`Broker`] running a blocking [`Checker`] on a worker [`Pool`].
#[derive(Debug)]
pub struct Blocking<C> {
    checker: Arc<C>,
    pool: Arc<Pool>,
}

impl<C: Checker> Blocking<C> {
    /// Run the `checker` on the provided `pool`.
    pub fn new(checker: C, pool: Arc<Pool>) -> Self {
        Self {
            checker: Arc::new(checker),
            pool,
        }
    }
}

impl<C: Checker> Broker for Blocking<C> {
    type Identity = C::Identity;
    type Err = WorkError;

    fn kinds(&self) -> EnumSet<Kind> {
        self.checker.kinds()
    }

    fn verify(
        &mut self,
        user: &str,
        claim: Claim,
    ) -> impl Future<Output = Result<Verdict<Self::Identity>, Self::Err>> {
        let checker = Arc::clone(&self.checker);
        let user = user.to_owned();

        self.pool.run(move || checker.check(&user, claim))
    }
}
