//! The local secret source, providing credentials on the client side.

use futures::Future;
use securefmt::Debug;
use ssh_key::{PrivateKey, PublicKey};

use crate::msg::Prompt;

/// The prompt used when asking for the current password during a password change.
pub const OLD_PASSWORD_PROMPT: &str = "Old Password: ";

/// An interface to the local secrets, all of them defaulting to none being available.
pub trait Secrets {
    /// Yield the next public key to be tried, `None` when no more keys are available.
    fn next_publickey(&mut self) -> impl Future<Output = Option<PublicKey>> {
        async { None }
    }

    /// Retrieve the private counterpart of the `key`, to sign the authentication request.
    fn private_key(&mut self, key: &PublicKey) -> impl Future<Output = Option<PrivateKey>> {
        let _ = key;

        async { None }
    }

    /// Ask for a password, with a specific `prompt` during a password change.
    fn password(&mut self, prompt: Option<&str>) -> impl Future<Output = Option<String>> {
        let _ = prompt;

        async { None }
    }

    /// Answer the `prompts` of a `keyboard-interactive` challenge.
    fn answers(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> impl Future<Output = Option<Vec<String>>> {
        let _ = (name, instruction, prompts);

        async { None }
    }
}

/// A default implementation of the secrets, with no credentials at all.
impl Secrets for () {}

/// A simple in-memory set of secrets.
///
/// # Note
/// While every provided key is tried in order, the password is only offered once,
/// and the keyboard-interactive responses are only given to the first challenge
/// with prompts, challenges without prompts being answered with no responses.
#[derive(Debug, Default)]
pub struct Keyring {
    #[sensitive]
    keys: Vec<PrivateKey>,
    next: usize,

    #[sensitive]
    password: Option<String>,
    password_offered: bool,

    #[sensitive]
    new_password: Option<String>,

    #[sensitive]
    responses: Option<Vec<String>>,
}

impl Keyring {
    /// Create an empty [`Keyring`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to be tried with the `publickey` method.
    pub fn key(mut self, key: impl Into<PrivateKey>) -> Self {
        self.keys.push(key.into());

        self
    }

    /// Set the password for the `password` method.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());

        self
    }

    /// Set the new password, given if the server asks for a password change.
    pub fn new_password(mut self, password: impl Into<String>) -> Self {
        self.new_password = Some(password.into());

        self
    }

    /// Set the responses to a `keyboard-interactive` challenge.
    pub fn responses(mut self, responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.responses = Some(responses.into_iter().map(Into::into).collect());

        self
    }
}

impl Secrets for Keyring {
    async fn next_publickey(&mut self) -> Option<PublicKey> {
        let key = self.keys.get(self.next)?.public_key().clone();
        self.next += 1;

        Some(key)
    }

    async fn private_key(&mut self, key: &PublicKey) -> Option<PrivateKey> {
        self.keys
            .iter()
            .find(|private| private.public_key() == key)
            .cloned()
    }

    async fn password(&mut self, prompt: Option<&str>) -> Option<String> {
        match prompt {
            None if !self.password_offered => {
                self.password_offered = true;

                self.password.clone()
            }
            None => None,
            Some(OLD_PASSWORD_PROMPT) => self.password.clone(),
            Some(_) => self.new_password.take(),
        }
    }

    async fn answers(&mut self, _: &str, _: &str, prompts: &[Prompt]) -> Option<Vec<String>> {
        if prompts.is_empty() {
            return Some(Vec::new());
        }

        self.responses.take()
    }
}
