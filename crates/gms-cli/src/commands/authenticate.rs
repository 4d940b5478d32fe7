//! `gms authenticate` — run one client authentication attempt.

use super::Target;
use anyhow::{bail, Context, Result};
use gms_client::ClientMessengerFactory;
use gms_core::messages::GameManagerMessage;
use gms_core::tls::load_client_tls;
use gms_core::{ClientSocketConfig, EndpointConfig, GmsError, HostPointer};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

enum Inbound {
    Message(GameManagerMessage),
    Failed(GmsError),
}

pub async fn run(target: &Target, timeout_secs: u64) -> Result<()> {
    let tls = match &target.root_cert {
        Some(path) => Some(load_client_tls(path).context("failed to load root certificate")?),
        None => None,
    };
    let server = HostPointer::new(target.host.clone(), target.port);
    let factory = ClientMessengerFactory::<GameManagerMessage>::new(
        server.clone(),
        ClientSocketConfig {
            tls,
            ..Default::default()
        },
        EndpointConfig::default(),
    );

    let messenger = factory.get_client_messenger();
    messenger
        .connect()
        .await
        .with_context(|| format!("cannot connect to {server}"))?;
    info!(server = %server, "connected");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let failures = tx.clone();
    messenger.on_receive(
        move |m| {
            let _ = tx.send(Inbound::Message(m));
        },
        move |e| {
            let _ = failures.send(Inbound::Failed(e));
        },
    )?;
    messenger
        .send(&GameManagerMessage::AuthenticateClientRequest)
        .await
        .context("failed to send authentication request")?;

    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Message(GameManagerMessage::UrlNavigationNeededResponse { url }) => {
                    println!("Open this URL to continue authenticating:\n  {url}");
                }
                Inbound::Message(GameManagerMessage::AuthenticateClientResponse { accepted }) => {
                    return Ok(accepted);
                }
                Inbound::Message(GameManagerMessage::AuthenticationFailed { reason, detail }) => {
                    bail!("authentication failed ({reason}): {detail}");
                }
                Inbound::Message(GameManagerMessage::ErrorResponse { message }) => {
                    bail!("server error: {message}");
                }
                Inbound::Message(other) => debug!(message = ?other, "ignoring message"),
                Inbound::Failed(e) => return Err(e).context("connection to server failed"),
            }
        }
        bail!("connection closed before an outcome arrived")
    })
    .await;

    messenger.dispose().await;

    let accepted = outcome
        .map_err(|_| anyhow::anyhow!("no outcome within {timeout_secs}s"))??;
    if accepted {
        println!("Authenticated.");
        Ok(())
    } else {
        bail!("authentication rejected")
    }
}
