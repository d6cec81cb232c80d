//! Join state machine: Auth-Info → Client-Challenge → Server-Challenge →
//! Encryption-Exchange → Validation → Joined.
//!
//! Both roles run the same phases over direct `dispatch`/`obtain` calls
//! with the handler loops parked; only who sends first differs. The same
//! sequence doubles as the recovery rejoin after a panic.
//!
//! Every failure maps to [`TransportError::JoinFailed`] (or a transport
//! error the caller treats the same way), so the outcome of a join is
//! always exactly joined-or-failed.

use rand::{thread_rng, Rng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{ExportedSettings, ServerSettings};
use crate::core::package::{Package, PackageType};
use crate::error::{constants, Result, TransportError};
use crate::protocol::handler::PackageHandler;
use crate::utils::crypto::{self, AesContext, IV_LEN, SALT_LEN};

/// Challenge length of the mutual password proof.
const CHALLENGE_LEN: usize = 32;

/// Validation probes carry between one and five random bytes.
const PROBE_MAX_LEN: usize = 5;

/// What a completed client-side join produced.
pub struct ClientJoin {
    /// Data-channel context, present when the server requires encryption.
    pub aes: Option<AesContext>,
    /// The server's exported settings as carried by the auth-info
    /// package.
    pub settings: ExportedSettings,
}

/// Run the accepting side of the join.
///
/// Returns the data-channel AES context when encryption is enabled. On
/// any failure a `Disconnect` is dispatched best-effort before the error
/// propagates.
#[instrument(skip_all, err(level = "debug"))]
pub async fn server_join(
    handler: &PackageHandler,
    settings: &ServerSettings,
    cancel: &CancellationToken,
) -> Result<Option<AesContext>> {
    match server_join_inner(handler, settings, cancel).await {
        Ok(aes) => Ok(aes),
        Err(e) => {
            let _ = handler
                .dispatch(Package::internal(PackageType::Disconnect))
                .await;
            Err(e)
        }
    }
}

async fn server_join_inner(
    handler: &PackageHandler,
    settings: &ServerSettings,
    cancel: &CancellationToken,
) -> Result<Option<AesContext>> {
    let exported = settings.exported();
    handler
        .dispatch(Package::internal_with(
            PackageType::AuthInfo,
            exported.to_bytes().to_vec(),
        ))
        .await?;

    let aes = if settings.encryption_enabled {
        let password = settings
            .password
            .as_ref()
            .ok_or(TransportError::JoinFailed(constants::ERR_PASSWORD_REQUIRED))?;

        challenge_peer(handler, password, cancel).await?;
        answer_challenge(handler, password, cancel).await?;

        // Fresh data-channel context, distinct from both auth contexts.
        let data_ctx = AesContext::generate(password);
        handler
            .dispatch(Package::internal_with(
                PackageType::EncrIv,
                data_ctx.iv().to_vec(),
            ))
            .await?;
        handler
            .dispatch(Package::internal_with(
                PackageType::EncrSalt,
                data_ctx.salt().to_vec(),
            ))
            .await?;
        Some(data_ctx)
    } else {
        None
    };

    run_validation(
        handler,
        aes.as_ref(),
        settings.connection_test_tries,
        cancel,
    )
    .await?;

    debug!("server side joined");
    Ok(aes)
}

/// Run the joining side of the handshake.
#[instrument(skip_all, err(level = "debug"))]
pub async fn client_join(
    handler: &PackageHandler,
    password: Option<&str>,
    cancel: &CancellationToken,
) -> Result<ClientJoin> {
    let info = handler
        .obtain_expected(PackageType::AuthInfo, cancel)
        .await?;
    let settings = ExportedSettings::from_bytes(info.payload.as_deref().unwrap_or_default())
        .map_err(|_| TransportError::JoinFailed(constants::ERR_BAD_SETTINGS_PAYLOAD))?;

    let aes = if settings.encryption_enabled {
        let password =
            password.ok_or(TransportError::JoinFailed(constants::ERR_PASSWORD_REQUIRED))?;

        answer_challenge(handler, password, cancel).await?;
        challenge_peer(handler, password, cancel).await?;

        let iv_pkg = handler.obtain_expected(PackageType::EncrIv, cancel).await?;
        let salt_pkg = handler
            .obtain_expected(PackageType::EncrSalt, cancel)
            .await?;
        let iv = fixed_bytes::<IV_LEN>(&iv_pkg)?;
        let salt = fixed_bytes::<SALT_LEN>(&salt_pkg)?;
        Some(AesContext::from_parts(password, salt, iv))
    } else {
        None
    };

    handler
        .obtain_expected(PackageType::TestRequest, cancel)
        .await?;
    answer_validation_rounds(
        handler,
        aes.as_ref(),
        settings.connection_test_tries,
        cancel,
    )
    .await?;

    debug!("client side joined");
    Ok(ClientJoin { aes, settings })
}

/// Mint a fresh challenge and verify the peer's response to it.
///
/// Sends `AuthSalt`, `AuthIv`, `AuthChallenge`, reads the digest reply
/// and answers `AuthSuccess` or `AuthFailure`.
async fn challenge_peer(
    handler: &PackageHandler,
    password: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let ctx = AesContext::generate(password);
    let challenge = crypto::random_bytes(CHALLENGE_LEN);
    let expected = crypto::sha512(&challenge);
    let sealed = ctx.encrypt(&challenge)?;

    handler
        .dispatch(Package::internal_with(
            PackageType::AuthSalt,
            ctx.salt().to_vec(),
        ))
        .await?;
    handler
        .dispatch(Package::internal_with(
            PackageType::AuthIv,
            ctx.iv().to_vec(),
        ))
        .await?;
    handler
        .dispatch(Package::internal_with(PackageType::AuthChallenge, sealed))
        .await?;

    let response = handler
        .obtain_expected(PackageType::AuthResponse, cancel)
        .await?;
    let verified = response.payload.as_deref() == Some(expected.as_slice());

    let verdict = if verified {
        PackageType::AuthSuccess
    } else {
        PackageType::AuthFailure
    };
    handler.dispatch(Package::internal(verdict)).await?;

    if verified {
        Ok(())
    } else {
        warn!("peer failed the password challenge");
        Err(TransportError::JoinFailed(constants::ERR_CHALLENGE_MISMATCH))
    }
}

/// Answer the peer's challenge and await its verdict.
///
/// A challenge that does not decrypt is answered with a zero digest; the
/// peer rejects it as a plain `AuthFailure`, not a protocol error.
async fn answer_challenge(
    handler: &PackageHandler,
    password: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let salt_pkg = handler
        .obtain_expected(PackageType::AuthSalt, cancel)
        .await?;
    let iv_pkg = handler.obtain_expected(PackageType::AuthIv, cancel).await?;
    let challenge_pkg = handler
        .obtain_expected(PackageType::AuthChallenge, cancel)
        .await?;

    let salt = fixed_bytes::<SALT_LEN>(&salt_pkg)?;
    let iv = fixed_bytes::<IV_LEN>(&iv_pkg)?;
    let ctx = AesContext::from_parts(password, salt, iv);

    let digest = match ctx.decrypt(challenge_pkg.payload.as_deref().unwrap_or_default()) {
        Ok(plain) => crypto::sha512(&plain).to_vec(),
        Err(_) => vec![0u8; 64],
    };
    handler
        .dispatch(Package::internal_with(PackageType::AuthResponse, digest))
        .await?;

    let verdict = handler
        .obtain_any_of(
            &[PackageType::AuthSuccess, PackageType::AuthFailure],
            cancel,
        )
        .await?;
    if verdict.package_type == PackageType::AuthSuccess {
        Ok(())
    } else {
        Err(TransportError::JoinFailed(
            constants::ERR_PEER_REJECTED_RESPONSE,
        ))
    }
}

/// Drive a validation pass from the initiating side: `TestRequest`, then
/// `tries` probe-and-echo rounds.
pub(crate) async fn run_validation(
    handler: &PackageHandler,
    aes: Option<&AesContext>,
    tries: u8,
    cancel: &CancellationToken,
) -> Result<()> {
    handler
        .dispatch(Package::internal(PackageType::TestRequest))
        .await?;

    for round in 0..tries {
        let probe_len = thread_rng().gen_range(1..=PROBE_MAX_LEN);
        let probe = crypto::random_bytes(probe_len);
        let wire = seal(aes, &probe)?;
        handler
            .dispatch(Package::internal_with(PackageType::Test, wire))
            .await?;

        let reply = handler.obtain_expected(PackageType::Test, cancel).await?;
        let echo = match open(aes, reply.payload.as_deref().unwrap_or_default()) {
            Ok(echo) => echo,
            Err(_) => Vec::new(),
        };

        let matched =
            echo.len() == probe.len() && echo.iter().any(|byte| probe.contains(byte));
        if !matched {
            warn!(round, "validation round mismatch");
            handler
                .dispatch(Package::internal(PackageType::TestTryFailure))
                .await?;
            return Err(TransportError::JoinFailed(constants::ERR_VALIDATION_FAILED));
        }
        handler
            .dispatch(Package::internal(PackageType::TestTrySuccess))
            .await?;
    }
    Ok(())
}

/// Answer `tries` probe-and-echo rounds. The `TestRequest` that opens the
/// pass must already have been consumed by the caller.
///
/// Each echo keeps the probe's length and carries at least one byte of
/// the decrypted probe at a random index.
pub(crate) async fn answer_validation_rounds(
    handler: &PackageHandler,
    aes: Option<&AesContext>,
    tries: u8,
    cancel: &CancellationToken,
) -> Result<()> {
    for _ in 0..tries {
        let probe_pkg = handler.obtain_expected(PackageType::Test, cancel).await?;
        let probe = open(aes, probe_pkg.payload.as_deref().unwrap_or_default())?;
        if probe.is_empty() {
            return Err(TransportError::IncorrectPackage);
        }

        let mut echo = crypto::random_bytes(probe.len());
        let slot = thread_rng().gen_range(0..echo.len());
        let source = thread_rng().gen_range(0..probe.len());
        echo[slot] = probe[source];

        handler
            .dispatch(Package::internal_with(PackageType::Test, seal(aes, &echo)?))
            .await?;

        let verdict = handler
            .obtain_any_of(
                &[PackageType::TestTrySuccess, PackageType::TestTryFailure],
                cancel,
            )
            .await?;
        if verdict.package_type != PackageType::TestTrySuccess {
            return Err(TransportError::JoinFailed(
                constants::ERR_PEER_FAILED_VALIDATION,
            ));
        }
    }
    Ok(())
}

/// Quiescence delay between a `Panic` package and the recovery join, so
/// the peer can flush its buffers before the new auth-info frame arrives.
pub(crate) async fn panic_quiescence() {
    tokio::time::sleep(crate::utils::timeout::PANIC_QUIESCENCE).await;
}

fn seal(aes: Option<&AesContext>, plain: &[u8]) -> Result<Vec<u8>> {
    match aes {
        Some(ctx) => ctx.encrypt(plain),
        None => Ok(plain.to_vec()),
    }
}

fn open(aes: Option<&AesContext>, wire: &[u8]) -> Result<Vec<u8>> {
    match aes {
        Some(ctx) => ctx.decrypt(wire),
        None => Ok(wire.to_vec()),
    }
}

fn fixed_bytes<const N: usize>(pkg: &Package) -> Result<[u8; N]> {
    pkg.payload
        .as_deref()
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or(TransportError::JoinFailed(constants::ERR_BAD_AUTH_MATERIAL))
}
