//! Device-auth challenge/response: the protocol-critical core that proves
//! the receiver holds a key chained to the substituted root.
//!
//! Two-phase design per the source tool's preferred tree: a [`PendingConn`]
//! accepts exactly one device-auth exchange and, on success, yields a
//! [`Conn`] ready for the post-auth session dispatcher. There is no combined
//! "authenticated" flag on a single connection type; the type system makes
//! an unauthenticated session unable to reach the dispatcher at all.

use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey};
use sha1::{Digest as _, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::interactive::EventSink;
use super::proto::{AuthChallenge, AuthResponse, DeviceAuthMessage};
use super::wire::{binary_message, read_message, write_message, HASH_SHA1, HASH_SHA256, PROTOCOL_CASTV2_1_0, SIG_PKCS1V15, SIG_PSS};
use crate::error::{CastforgeError, Result};

pub const NS_DEVICEAUTH: &str = "urn:x-cast:com.google.cast.tp.deviceauth";
pub const RECEIVER_ID: &str = "receiver-0";
pub const SENDER_ID: &str = "sender-0";

/// An accepted, TLS-terminated connection that has not yet completed
/// device-auth.
pub struct PendingConn<S> {
    stream: S,
    auth_cert: AuthIdentity,
    events: Option<EventSink>,
}

/// The auth certificate's private key and DER, the intermediate chain, and
/// the TLS peer (leaf) certificate's DER -- the material needed to answer a
/// device-auth challenge. `peer_cert_der` must be the exact leaf this
/// receiver presented during the TLS handshake: the challenge response
/// signs `sender_nonce || peer_cert_der`, and a client verifies that
/// signature against the certificate it actually saw on the wire, not
/// whatever (if anything) rustls reports as the client's own peer
/// certificate -- this is a server socket with no client auth configured,
/// so that lookup is always empty.
#[derive(Clone)]
pub struct AuthIdentity {
    pub private_key: RsaPrivateKey,
    pub cert_der: Vec<u8>,
    pub intermediate_der: Vec<Vec<u8>>,
    pub peer_cert_der: Vec<u8>,
}

/// An authenticated connection, ready for the post-auth session dispatcher.
pub struct Conn<S> {
    pub stream: S,
    pub connected: bool,
    pub events: Option<EventSink>,
}

impl<S> PendingConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, auth_cert: AuthIdentity, events: Option<EventSink>) -> Self {
        Self { stream, auth_cert, events }
    }

    /// Await exactly one device-auth request and answer it. Consumes self;
    /// on success returns a [`Conn`] ready for the session dispatcher.
    pub async fn authenticate(mut self) -> Result<Conn<S>> {
        let envelope = read_message(&mut self.stream).await?;

        if envelope.protocol_version != PROTOCOL_CASTV2_1_0 {
            return Err(CastforgeError::Protocol(format!(
                "unsupported protocol version {}",
                envelope.protocol_version
            )));
        }
        if envelope.namespace != NS_DEVICEAUTH {
            return Err(CastforgeError::Protocol(format!(
                "expected deviceauth namespace, got {}",
                envelope.namespace
            )));
        }
        let payload = envelope
            .payload_binary
            .ok_or_else(|| CastforgeError::Protocol("deviceauth message must be BINARY".to_string()))?;

        let auth_msg = <DeviceAuthMessage as prost::Message>::decode(payload.as_slice())
            .map_err(|e| CastforgeError::Format(format!("failed to decode DeviceAuthMessage: {e}")))?;
        let challenge = auth_msg
            .challenge
            .ok_or_else(|| CastforgeError::Protocol("device-auth message carried no challenge".to_string()))?;

        let response = build_response(&challenge, &self.auth_cert.peer_cert_der, &self.auth_cert)?;
        let reply_payload = encode_response(&response);

        let reply = binary_message(RECEIVER_ID, SENDER_ID, NS_DEVICEAUTH, reply_payload);
        write_message(&mut self.stream, &reply).await?;

        info!("device-auth completed");
        Ok(Conn { stream: self.stream, connected: false, events: self.events })
    }
}

fn build_response(challenge: &AuthChallenge, peer_cert_der: &[u8], identity: &AuthIdentity) -> Result<AuthResponse> {
    let hash_alg = challenge.hash_algorithm.unwrap_or(HASH_SHA1);
    let sig_alg = challenge.signature_algorithm.unwrap_or(SIG_PKCS1V15);
    let nonce = challenge.sender_nonce.clone().unwrap_or_default();

    let mut to_sign = Vec::with_capacity(nonce.len() + peer_cert_der.len());
    to_sign.extend_from_slice(&nonce);
    to_sign.extend_from_slice(peer_cert_der);

    let signature = sign(&identity.private_key, hash_alg, sig_alg, &to_sign)?;

    debug!(hash_alg, sig_alg, nonce_len = nonce.len(), "answered device-auth challenge");

    Ok(AuthResponse {
        signature,
        client_auth_certificate: identity.cert_der.clone(),
        intermediate_certificate: identity.intermediate_der.clone(),
        signature_algorithm: Some(sig_alg),
        sender_nonce: Some(nonce),
        hash_algorithm: Some(hash_alg),
    })
}

fn sign(key: &RsaPrivateKey, hash_alg: i32, sig_alg: i32, message: &[u8]) -> Result<Vec<u8>> {
    match (hash_alg, sig_alg) {
        (HASH_SHA1, SIG_PKCS1V15) => {
            let digest = Sha1::digest(message);
            key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
                .map_err(|e| CastforgeError::Crypto(format!("PKCS1v15/SHA1 sign failed: {e}")))
        }
        (HASH_SHA256, SIG_PKCS1V15) => {
            let digest = Sha256::digest(message);
            key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                .map_err(|e| CastforgeError::Crypto(format!("PKCS1v15/SHA256 sign failed: {e}")))
        }
        (HASH_SHA1, SIG_PSS) => {
            let digest = Sha1::digest(message);
            key.sign_with_rng(&mut rand::rngs::OsRng, Pss::new::<Sha1>(), &digest)
                .map_err(|e| CastforgeError::Crypto(format!("PSS/SHA1 sign failed: {e}")))
        }
        (HASH_SHA256, SIG_PSS) => {
            let digest = Sha256::digest(message);
            key.sign_with_rng(&mut rand::rngs::OsRng, Pss::new::<Sha256>(), &digest)
                .map_err(|e| CastforgeError::Crypto(format!("PSS/SHA256 sign failed: {e}")))
        }
        _ => Err(CastforgeError::Protocol(format!(
            "unsupported hash/signature algorithm combination ({hash_alg}, {sig_alg})"
        ))),
    }
}

fn encode_response(response: &AuthResponse) -> Vec<u8> {
    let auth_msg = DeviceAuthMessage {
        challenge: None,
        response: Some(response.clone()),
        error: None,
    };
    let mut buf = Vec::with_capacity(<DeviceAuthMessage as prost::Message>::encoded_len(&auth_msg));
    prost::Message::encode(&auth_msg, &mut buf).expect("encoding into a Vec cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_root_ca;
    use rsa::RsaPublicKey;

    fn identity() -> (AuthIdentity, Vec<u8>) {
        let root = generate_root_ca(None, None).unwrap();
        let peer = crate::cert::generate_leaf(&root, None, None).unwrap();
        let auth = crate::cert::generate_leaf(&root, None, None).unwrap();
        let peer_cert_der = peer.cert_der.clone();
        (
            AuthIdentity {
                private_key: auth.private_key,
                cert_der: auth.cert_der,
                intermediate_der: vec![root.cert_der.clone()],
                peer_cert_der: peer_cert_der.clone(),
            },
            peer_cert_der,
        )
    }

    #[tokio::test]
    async fn challenge_response_round_trip_verifies() {
        let (identity, peer_cert_der) = identity();

        let challenge = AuthChallenge {
            signature_algorithm: Some(SIG_PKCS1V15),
            sender_nonce: Some(vec![0u8; 32]),
            hash_algorithm: Some(HASH_SHA256),
        };

        let response = build_response(&challenge, &peer_cert_der, &identity).unwrap();

        let mut to_sign = response.sender_nonce.clone().unwrap();
        to_sign.extend_from_slice(&peer_cert_der);
        let digest = Sha256::digest(&to_sign);

        let public_key = RsaPublicKey::from(&identity.private_key);
        public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &response.signature)
            .expect("signature must verify against the auth certificate's key");
        assert_eq!(response.intermediate_certificate, identity.intermediate_der);
    }

    #[tokio::test]
    async fn full_wire_exchange_happy_path() {
        let (identity, _peer_cert_der) = identity();
        let (mut client, server) = tokio::io::duplex(1 << 16);

        let pending = PendingConn::new(server, identity.clone(), None);

        let nonce: Vec<u8> = (0u8..32).collect();
        let challenge = AuthChallenge {
            signature_algorithm: Some(SIG_PKCS1V15),
            sender_nonce: Some(nonce.clone()),
            hash_algorithm: Some(HASH_SHA256),
        };
        let request_payload = encode_response_for_test(&challenge);
        let request = binary_message(SENDER_ID, RECEIVER_ID, NS_DEVICEAUTH, request_payload);
        write_message(&mut client, &request).await.unwrap();

        let conn = pending.authenticate().await.unwrap();
        assert!(!conn.connected);

        let reply = read_message(&mut client).await.unwrap();
        assert_eq!(reply.namespace, NS_DEVICEAUTH);
        let decoded = <DeviceAuthMessage as prost::Message>::decode(reply.payload_binary.unwrap().as_slice()).unwrap();
        let response = decoded.response.expect("device-auth reply must carry a response");

        // The signature must cover the nonce followed by this receiver's own
        // peer-cert DER, not whatever (if anything) rustls reports as the
        // TLS client's peer certificate.
        let mut to_sign = nonce;
        to_sign.extend_from_slice(&identity.peer_cert_der);
        let digest = Sha256::digest(&to_sign);
        let public_key = RsaPublicKey::from(&identity.private_key);
        public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &response.signature)
            .expect("signature must verify over sender_nonce || peer_cert_der");
    }

    fn encode_response_for_test(challenge: &AuthChallenge) -> Vec<u8> {
        let msg = DeviceAuthMessage {
            challenge: Some(challenge.clone()),
            response: None,
            error: None,
        };
        let mut buf = Vec::new();
        prost::Message::encode(&msg, &mut buf).unwrap();
        buf
    }
}
