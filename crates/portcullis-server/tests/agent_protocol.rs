//! Drives the forwarded-agent client against a scripted agent on the other
//! end of a duplex stream.

use anyhow::Result;
use portcullis_server::agent::{ForwardedAgent, key_wire_bytes};
use portcullis_server::ca::CertAuthority;
use signature::{Signer, Verifier};
use ssh_agent_lib::proto::{Credential, KeyConstraint, Request, Response};
use ssh_encoding::{Decode, Encode};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, PrivateKey, Signature};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

fn fresh_key() -> PrivateKey {
    let mut rng = OsRng;
    PrivateKey::random(&mut rng, Algorithm::Ed25519).expect("key")
}

/// Minimal scripted agent: answers identity, sign, and add requests for one
/// key, and reports every add-identity request it sees.
fn spawn_fake_agent(
    mut stream: DuplexStream,
    key: PrivateKey,
    added: mpsc::UnboundedSender<(Credential, Vec<KeyConstraint>)>,
) {
    tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            if stream.read_exact(&mut buf).await.is_err() {
                return;
            }
            let request = Request::decode(&mut buf.as_slice()).expect("decodable request");

            let response = match request {
                Request::RequestIdentities => Response::IdentitiesAnswer(vec![
                    ssh_agent_lib::proto::Identity {
                        pubkey: key.public_key().key_data().clone(),
                        comment: "scripted".into(),
                    },
                ]),
                Request::SignRequest(sign) => {
                    let signature: Signature = key.try_sign(&sign.data).expect("signable");
                    Response::SignResponse(signature)
                }
                Request::AddIdConstrained(add) => {
                    added
                        .send((add.identity.credential, add.constraints))
                        .expect("report add");
                    Response::Success
                }
                _ => Response::Failure,
            };

            let mut payload = Vec::new();
            response.encode(&mut payload).expect("encodable response");
            let mut framed = Vec::with_capacity(payload.len() + 4);
            framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            framed.extend_from_slice(&payload);
            if stream.write_all(&framed).await.is_err() {
                return;
            }
        }
    });
}

fn connected_agent(key: PrivateKey) -> (
    ForwardedAgent,
    mpsc::UnboundedReceiver<(Credential, Vec<KeyConstraint>)>,
) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (added_tx, added_rx) = mpsc::unbounded_channel();
    spawn_fake_agent(theirs, key, added_tx);
    (ForwardedAgent::from_stream(ours), added_rx)
}

#[tokio::test]
async fn identities_round_trip() -> Result<()> {
    let key = fresh_key();
    let expected = key_wire_bytes(key.public_key().key_data())?;
    let (mut agent, _added) = connected_agent(key);

    let identities = agent.identities().await?;
    assert_eq!(identities.len(), 1);
    assert_eq!(key_wire_bytes(&identities[0].pubkey)?, expected);
    Ok(())
}

#[tokio::test]
async fn challenge_signature_verifies_with_the_stored_key() -> Result<()> {
    let key = fresh_key();
    let key_data = key.public_key().key_data().clone();
    let (mut agent, _added) = connected_agent(key);

    let challenge = [7u8; 128];
    let signature = agent.sign(&key_data, &challenge).await?;
    key_data.verify(&challenge, &signature)?;

    // A signature over different bytes must not verify.
    assert!(key_data.verify(&[0u8; 128], &signature).is_err());
    Ok(())
}

#[tokio::test]
async fn add_certificate_carries_cert_and_lifetime() -> Result<()> {
    let agent_key = fresh_key();
    let (mut agent, mut added) = connected_agent(agent_key);

    let ca = CertAuthority::from_key(fresh_key());
    let (cert, ephemeral) = ca.generate("session-uuid", "alice", "")?;
    agent
        .add_certificate(&cert, &ephemeral, 10, "temporary ssh certificate (db-01)".into())
        .await?;

    let (credential, constraints) = added.recv().await.expect("add request observed");
    match credential {
        Credential::Cert {
            algorithm,
            certificate,
            comment,
            ..
        } => {
            assert_eq!(algorithm, "ssh-ed25519-cert-v01@openssh.com");
            assert_eq!(certificate.key_id(), "session-uuid");
            assert_eq!(comment, "temporary ssh certificate (db-01)");
        }
        other => panic!("expected certificate credential, got {other:?}"),
    }
    assert!(matches!(constraints.as_slice(), [KeyConstraint::Lifetime(10)]));
    Ok(())
}
