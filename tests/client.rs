#![allow(clippy::unwrap_used)]

use enumset::EnumSet;
use rstest::rstest;
use test_log::test;

use assh_userauth::{
    client::{secrets::OLD_PASSWORD_PROMPT, Client, Config, Keyring, Secrets, State},
    msg::{
        Banner, DisconnectReason, Failure, InfoRequest, InfoResponse, MethodData, Packet,
        PasswdChangereq, PkOk, Prompt, Request, Success,
    },
    Error, Method, CONNECTION_SERVICE_NAME,
};

mod common;
use common::Recorder;

fn client<S: Secrets>(secrets: S) -> Client<S> {
    Client::new(
        Config {
            user: "maya".into(),
            ..Default::default()
        },
        secrets,
    )
}

fn failure(methods: &[&str], partial_success: bool) -> Packet {
    Packet::new(&Failure {
        continue_with: methods.iter().map(|&method| method.into()).collect(),
        partial_success,
    })
    .unwrap()
}

#[test(rstest)]
async fn starts_by_asking_none() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(());

    client.start(&mut transport).await?;

    assert_eq!(
        transport.last::<Request>(),
        Request {
            username: "maya".into(),
            service_name: CONNECTION_SERVICE_NAME.into(),
            method: MethodData::None,
        }
    );
    assert_eq!(client.state(), State::Offering);
    assert_eq!(client.last_auth(), None);

    Ok(())
}

#[test(rstest)]
async fn follows_the_preferred_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().password("hunter2").responses(["123"]));

    client.start(&mut transport).await?;
    assert!(
        !client
            .dispatch(
                &mut transport,
                failure(&["keyboard-interactive", "password"], false)
            )
            .await?
    );

    assert_eq!(
        transport.last::<Request>().method,
        common::password("hunter2")
    );
    assert_eq!(client.last_auth(), Some(Method::Password));

    Ok(())
}

#[test(rstest)]
async fn publickey_is_signed_once_acceptable() -> Result<(), Box<dyn std::error::Error>> {
    let key = common::key();
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().key(key.clone()));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["publickey"], false))
        .await?;

    let blob = key.public_key().to_bytes()?;
    assert_eq!(
        transport.last::<Request>().method,
        MethodData::Publickey {
            algorithm: "ssh-ed25519".into(),
            blob: blob.clone(),
            signature: None,
        }
    );
    assert_eq!(client.tried_keys(), [key.public_key().clone()]);

    client
        .dispatch(
            &mut transport,
            Packet::new(&PkOk {
                algorithm: "ssh-ed25519".into(),
                blob,
            })?,
        )
        .await?;

    // Ed25519 signatures are deterministic.
    assert_eq!(
        transport.last::<Request>().method,
        common::signed(&key, "maya")
    );

    Ok(())
}

#[test(rstest)]
async fn every_key_is_tried_once() -> Result<(), Box<dyn std::error::Error>> {
    let (first, second) = (common::key(), common::key());
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().key(first.clone()).key(second.clone()));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["publickey"], false))
        .await?;
    client
        .dispatch(&mut transport, failure(&["publickey"], false))
        .await?;

    assert_eq!(
        client.tried_keys(),
        [first.public_key().clone(), second.public_key().clone()]
    );

    assert!(matches!(
        client
            .dispatch(&mut transport, failure(&["publickey"], false))
            .await,
        Err(Error::MethodsExhausted)
    ));
    assert_eq!(client.state(), State::Disconnected);

    Ok(())
}

/// Secrets yielding the same key over and over.
struct Forgetful(ssh_key::PrivateKey);

impl Secrets for Forgetful {
    async fn next_publickey(&mut self) -> Option<ssh_key::PublicKey> {
        Some(self.0.public_key().clone())
    }
}

#[test(rstest)]
async fn repeated_keys_are_given_up() -> Result<(), Box<dyn std::error::Error>> {
    let key = common::key();
    let mut transport = Recorder::encrypted();
    let mut client = client(Forgetful(key.clone()));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["publickey"], false))
        .await?;
    assert_eq!(client.tried_keys(), [key.public_key().clone()]);

    assert!(matches!(
        client
            .dispatch(&mut transport, failure(&["publickey"], false))
            .await,
        Err(Error::MethodsExhausted)
    ));
    assert_eq!(client.tried_keys().len(), 1);
    assert_eq!(client.state(), State::Disconnected);

    Ok(())
}

#[test(rstest)]
async fn partial_success_moves_on() -> Result<(), Box<dyn std::error::Error>> {
    let key = common::key();
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().key(key).password("hunter2"));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["publickey", "password"], false))
        .await?;
    assert_eq!(client.last_auth(), Some(Method::Publickey));

    client
        .dispatch(&mut transport, failure(&["publickey", "password"], true))
        .await?;

    assert_eq!(client.authenticated_with(), EnumSet::only(Method::Publickey));
    assert_eq!(client.last_auth(), Some(Method::Password));

    Ok(())
}

#[test(rstest)]
async fn password_change_is_answered() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().password("hunter2").new_password("n3w"));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["password"], false))
        .await?;
    client
        .dispatch(
            &mut transport,
            Packet::new(&PasswdChangereq {
                prompt: common::EXPIRED_PROMPT.into(),
            })?,
        )
        .await?;

    assert_eq!(
        transport.last::<Request>().method,
        MethodData::Password {
            password: "hunter2".into(),
            new: Some("n3w".into()),
        }
    );

    Ok(())
}

/// Secrets refusing to give a new password.
struct Stubborn;

impl Secrets for Stubborn {
    async fn password(&mut self, prompt: Option<&str>) -> Option<String> {
        match prompt {
            None | Some(OLD_PASSWORD_PROMPT) => Some("hunter2".into()),
            Some(_) => None,
        }
    }
}

#[test(rstest)]
async fn declined_password_change_asks_none() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(Stubborn);

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["password"], false))
        .await?;
    client
        .dispatch(&mut transport, Packet::new(&PasswdChangereq::default())?)
        .await?;

    assert_eq!(transport.last::<Request>().method, MethodData::None);
    assert_eq!(client.last_auth(), None);

    assert!(matches!(
        client
            .dispatch(&mut transport, failure(&["password"], false))
            .await,
        Err(Error::MethodsExhausted)
    ));

    Ok(())
}

#[test(rstest)]
async fn keyboard_interactive_is_answered() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().responses(["123", "0000"]));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["keyboard-interactive"], false))
        .await?;
    assert_eq!(
        transport.last::<Request>().method,
        common::keyboard_interactive()
    );

    client
        .dispatch(
            &mut transport,
            Packet::new(&InfoRequest {
                name: "Two-factor".into(),
                prompts: vec![
                    Prompt {
                        prompt: "Code: ".into(),
                        echo: true,
                    },
                    Prompt {
                        prompt: "PIN: ".into(),
                        echo: false,
                    },
                ],
                ..Default::default()
            })?,
        )
        .await?;

    assert_eq!(
        transport.last::<InfoResponse>().responses,
        ["123", "0000"]
    );
    assert_eq!(client.state(), State::Offering);

    Ok(())
}

#[test(rstest)]
async fn empty_follow_up_challenge_is_answered() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(Keyring::new().responses(["123"]));

    client.start(&mut transport).await?;
    client
        .dispatch(&mut transport, failure(&["keyboard-interactive"], false))
        .await?;

    client
        .dispatch(
            &mut transport,
            Packet::new(&InfoRequest {
                prompts: vec![Prompt {
                    prompt: "Code: ".into(),
                    echo: true,
                }],
                ..Default::default()
            })?,
        )
        .await?;
    assert_eq!(transport.last::<InfoResponse>().responses, ["123"]);

    client
        .dispatch(&mut transport, Packet::new(&InfoRequest::default())?)
        .await?;
    assert!(transport.last::<InfoResponse>().responses.is_empty());
    assert_eq!(client.state(), State::Offering);
    assert_eq!(client.last_auth(), Some(Method::KeyboardInteractive));

    Ok(())
}

#[test(rstest)]
async fn refused_keyboard_interactive_is_not_retried() {
    let mut transport = Recorder::encrypted();
    let mut client = client(());

    client.start(&mut transport).await.unwrap();
    client
        .dispatch(&mut transport, failure(&["keyboard-interactive"], false))
        .await
        .unwrap();
    assert_eq!(client.last_auth(), Some(Method::KeyboardInteractive));

    assert!(matches!(
        client
            .dispatch(&mut transport, failure(&["keyboard-interactive"], false))
            .await,
        Err(Error::MethodsExhausted)
    ));
}

#[test(rstest)]
#[case(&["publickey", "password"])]
#[case(&["hostbased", "gssapi-with-mic"])]
#[case(&[])]
async fn exhaustion_disconnects(#[case] methods: &[&str]) {
    let mut transport = Recorder::encrypted();
    let mut client = client(());

    client.start(&mut transport).await.unwrap();

    assert!(matches!(
        client.dispatch(&mut transport, failure(methods, false)).await,
        Err(Error::MethodsExhausted)
    ));
    assert!(matches!(
        transport.disconnected.as_ref(),
        Some((DisconnectReason::NoMoreAuthMethodsAvailable, description)) if description == "no more authentication methods available"
    ));
    assert_eq!(client.state(), State::Disconnected);
}

#[test(rstest)]
async fn success_hands_over_the_transport() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = Recorder::encrypted();
    let mut client = client(());

    client.start(&mut transport).await?;
    client
        .dispatch(
            &mut transport,
            Packet::new(&Banner {
                message: "Welcome aboard\r\n".into(),
            })?,
        )
        .await?;
    assert_eq!(client.banner(), Some("Welcome aboard\r\n"));

    assert!(client.dispatch(&mut transport, Packet::new(&Success).unwrap()).await?);
    assert_eq!(client.state(), State::Authenticated);
    assert_eq!(transport.service.as_deref(), Some(CONNECTION_SERVICE_NAME));

    assert!(matches!(
        client.dispatch(&mut transport, Packet::new(&Success).unwrap()).await,
        Err(Error::Disconnected)
    ));

    Ok(())
}

#[test(rstest)]
#[case::request(Packet::new(&common::request("maya", MethodData::None)).unwrap(), Some(50))]
#[case::truncated_failure(Packet::from_bytes(vec![51, 0, 0]), None)]
async fn protocol_errors_disconnect(#[case] packet: Packet, #[case] unexpected: Option<u8>) {
    let mut transport = Recorder::encrypted();
    let mut client = client(());

    client.start(&mut transport).await.unwrap();
    let result = client.dispatch(&mut transport, packet).await;

    match unexpected {
        Some(number) => assert!(matches!(result, Err(Error::UnexpectedMessage(n)) if n == number)),
        None => assert!(matches!(result, Err(Error::Binary(_) | Error::Malformed(_)))),
    }
    assert!(matches!(
        transport.disconnected,
        Some((DisconnectReason::ProtocolError, _))
    ));
}
