//! Secret handshake.
//!
//! Four messages over a fresh TCP stream, client first:
//!
//! ```text
//! client hello   a || hmac(K, a)                                  64 bytes
//! server hello   b || hmac(K, b)                                  64 bytes
//! client auth    box[sha256(K|ab|aB)](A || sig_A(K|B|sha256(ab))) 112 bytes
//! server accept  box[sha256(K|ab|aB|Ab)](sig_B(K|sig_A|A|sha256(ab))) 80 bytes
//! ```
//!
//! `K` is the application key, `a`/`b` the ephemeral X25519 keys, `A`/`B`
//! the Ed25519 identities. A peer without `K` fails at the hello; a client
//! dialing the wrong identity fails at the server accept.

use buildmesh_core::crypto::sealing::{self, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use buildmesh_core::crypto::{hmac_sha256, hmac_sha256_verify, sha256, sha256_concat, sign, verify};
use buildmesh_core::crypto::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use buildmesh_core::{AppKey, EphemeralKey, KeyPair, PublicKey, Signature};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::PublicKey as X25519Public;

use super::boxstream::{DirectionKey, SessionKeys};
use crate::error::{MeshError, MeshResult};

const HELLO_SIZE: usize = 64;
const CLIENT_AUTH_SIZE: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH + TAG_SIZE;
const SERVER_ACCEPT_SIZE: usize = SIGNATURE_LENGTH + TAG_SIZE;

const ZERO_NONCE: [u8; NONCE_SIZE] = [0u8; NONCE_SIZE];

/// Result of a completed handshake.
#[derive(Debug)]
pub struct Handshake {
    /// Identity proven by the remote side.
    pub remote_key: PublicKey,
    /// Keys for the box stream.
    pub keys: SessionKeys,
}

/// Run the client side of the handshake, expecting `server_key` on the far end.
pub async fn client<S>(
    stream: &mut S,
    app_key: &AppKey,
    identity: &KeyPair,
    server_key: &PublicKey,
) -> MeshResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let app = app_key.as_bytes();
    let ephemeral = EphemeralKey::generate();
    let local_eph = ephemeral.public_bytes();

    stream.write_all(&hello(app, &local_eph)).await?;
    stream.flush().await?;

    let remote_eph = read_hello(stream, app, "server").await?;

    let ab = shared(ephemeral.agree_bytes(remote_eph))?;
    let a_b = ephemeral.agree(&server_key.to_x25519());
    let ab_hash = sha256(&ab);

    let local_key = identity.public_key();
    let sig_a = sign(
        identity.signing_key(),
        &[&app[..], server_key.as_bytes(), &ab_hash].concat(),
    );

    let mut auth = Vec::with_capacity(PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH);
    auth.extend_from_slice(local_key.as_bytes());
    auth.extend_from_slice(&sig_a.to_bytes());
    let auth_key = sha256_concat(&[&app[..], &ab, &a_b]);
    let sealed = sealing::seal(&auth_key, &ZERO_NONCE, &[], &auth)?;
    stream.write_all(&sealed).await?;
    stream.flush().await?;

    let mut accept = [0u8; SERVER_ACCEPT_SIZE];
    read_exact(stream, &mut accept, "server accept").await?;

    let capital_a_b = identity
        .to_x25519()
        .diffie_hellman(&X25519Public::from(remote_eph))
        .to_bytes();
    let accept_key = sha256_concat(&[&app[..], &ab, &a_b, &capital_a_b]);
    let sig_b_bytes = sealing::open(&accept_key, &ZERO_NONCE, &[], &accept)
        .map_err(|_| MeshError::HandshakeFailed("server accept did not open (wrong server identity?)".into()))?;
    let sig_b = Signature::from_slice(&sig_b_bytes)?;
    verify(
        server_key,
        &[&app[..], &sig_a.to_bytes(), local_key.as_bytes(), &ab_hash].concat(),
        &sig_b,
    )
    .map_err(|_| MeshError::HandshakeFailed("server signature rejected".into()))?;

    Ok(Handshake {
        remote_key: *server_key,
        keys: session_keys(
            app,
            &accept_key,
            (&local_key, &local_eph),
            (server_key, &remote_eph),
        ),
    })
}

/// Run the server side of the handshake. The client's identity is learned, not checked.
pub async fn server<S>(stream: &mut S, app_key: &AppKey, identity: &KeyPair) -> MeshResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let app = app_key.as_bytes();
    let remote_eph = read_hello(stream, app, "client").await?;

    let ephemeral = EphemeralKey::generate();
    let local_eph = ephemeral.public_bytes();
    stream.write_all(&hello(app, &local_eph)).await?;
    stream.flush().await?;

    let ab = shared(ephemeral.agree_bytes(remote_eph))?;
    let a_b = identity
        .to_x25519()
        .diffie_hellman(&X25519Public::from(remote_eph))
        .to_bytes();
    let ab_hash = sha256(&ab);
    let local_key = identity.public_key();

    let mut sealed = [0u8; CLIENT_AUTH_SIZE];
    read_exact(stream, &mut sealed, "client auth").await?;
    let auth_key = sha256_concat(&[&app[..], &ab, &a_b]);
    let auth = sealing::open(&auth_key, &ZERO_NONCE, &[], &sealed)
        .map_err(|_| MeshError::HandshakeFailed("client auth did not open".into()))?;

    let (client_bytes, sig_bytes) = auth.split_at(PUBLIC_KEY_LENGTH);
    let client_key = PublicKey::from_slice(client_bytes)
        .map_err(|_| MeshError::HandshakeFailed("client sent an invalid identity".into()))?;
    let sig_a = Signature::from_slice(sig_bytes)?;
    verify(
        &client_key,
        &[&app[..], local_key.as_bytes(), &ab_hash].concat(),
        &sig_a,
    )
    .map_err(|_| MeshError::HandshakeFailed("client signature rejected".into()))?;

    let capital_a_b = ephemeral.agree(&client_key.to_x25519());
    let sig_b = sign(
        identity.signing_key(),
        &[&app[..], &sig_a.to_bytes(), client_key.as_bytes(), &ab_hash].concat(),
    );
    let accept_key = sha256_concat(&[&app[..], &ab, &a_b, &capital_a_b]);
    let accept = sealing::seal(&accept_key, &ZERO_NONCE, &[], &sig_b.to_bytes())?;
    stream.write_all(&accept).await?;
    stream.flush().await?;

    Ok(Handshake {
        remote_key: client_key,
        keys: session_keys(
            app,
            &accept_key,
            (&local_key, &local_eph),
            (&client_key, &remote_eph),
        ),
    })
}

fn hello(app: &[u8; 32], ephemeral: &[u8; 32]) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[..32].copy_from_slice(ephemeral);
    out[32..].copy_from_slice(&hmac_sha256(app, ephemeral));
    out
}

async fn read_hello<S>(stream: &mut S, app: &[u8; 32], from: &str) -> MeshResult<[u8; 32]>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HELLO_SIZE];
    read_exact(stream, &mut buf, from).await?;

    let (eph, mac) = buf.split_at(32);
    hmac_sha256_verify(app, eph, mac).map_err(|_| {
        MeshError::HandshakeFailed(format!("{} hello failed authentication (application key mismatch)", from))
    })?;

    let mut out = [0u8; 32];
    out.copy_from_slice(eph);
    Ok(out)
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8], what: &str) -> MeshResult<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(MeshError::HandshakeFailed(
            format!("connection closed while reading {}", what),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Reject the all-zero output produced by low-order points.
fn shared(secret: [u8; 32]) -> MeshResult<[u8; 32]> {
    if secret == [0u8; 32] {
        return Err(MeshError::HandshakeFailed("degenerate ephemeral key".into()));
    }
    Ok(secret)
}

fn session_keys(
    app: &[u8; 32],
    accept_key: &[u8; KEY_SIZE],
    local: (&PublicKey, &[u8; 32]),
    remote: (&PublicKey, &[u8; 32]),
) -> SessionKeys {
    let (local_key, local_eph) = local;
    let (remote_key, remote_eph) = remote;
    let base = sha256(accept_key);

    SessionKeys {
        send: direction(app, &base, remote_key, remote_eph),
        recv: direction(app, &base, local_key, local_eph),
    }
}

/// Key and starting nonce for frames received by `receiver`.
fn direction(app: &[u8; 32], base: &[u8; 32], receiver: &PublicKey, receiver_eph: &[u8; 32]) -> DirectionKey {
    let key = sha256_concat(&[&base[..], receiver.as_bytes()]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&hmac_sha256(app, receiver_eph)[..NONCE_SIZE]);
    DirectionKey::new(key, nonce)
}
