//! TLS probe: handshake plus certificate expiry check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config::TargetMode;
use crate::core::dial::{split_host_port, BoxedStream, DialFn};
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::Tunnel;

use super::{cancellable, dial_stream, fan_out, tunnel_gate, Probe};

const TLS_PORT: u16 = 443;

/// Client config with native roots, or with verification disabled.
pub(crate) fn tls_client_config(insecure: bool) -> Arc<rustls::ClientConfig> {
    if insecure {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        return Arc::new(config);
    }
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Verifier used for insecure_skip_verify endpoints.
#[derive(Debug)]
pub(crate) struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// NotAfter of a DER certificate.
pub(crate) fn certificate_not_after(der: &[u8]) -> Result<DateTime<Utc>, String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| format!("parsing certificate: {}", e))?;
    let ts = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| "certificate NotAfter out of range".to_string())
}

/// Shared expiry policy: expired certificates fail, certificates inside
/// the threshold fail, everything else reports days remaining.
pub(crate) fn judge_expiry(
    not_after: DateTime<Utc>,
    threshold: Duration,
) -> Result<i64, String> {
    let now = Utc::now();
    if not_after <= now {
        return Err(format!("certificate expired on {}", not_after.to_rfc3339()));
    }
    let remaining = (not_after - now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    let days = remaining.as_secs() / 86400;
    if !threshold.is_zero() && remaining < threshold {
        return Err(format!(
            "certificate expires in {} days ({})",
            days,
            not_after.to_rfc3339()
        ));
    }
    Ok(days as i64)
}

pub struct TlsProbe {
    expiry_threshold: Duration,
    insecure_skip_verify: bool,
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
    dialer: Option<DialFn>,
}

impl TlsProbe {
    pub fn new(expiry_threshold: Duration, insecure_skip_verify: bool) -> Self {
        Self {
            expiry_threshold,
            insecure_skip_verify,
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
            dialer: None,
        }
    }

    async fn check_one(&self, entry: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        let stripped = entry.strip_prefix("tls://").unwrap_or(&entry);
        let (host, port) = split_host_port(stripped, TLS_PORT);
        let addr = format!("{}:{}", host, port);

        let stream = match dial_stream(self.dialer.as_ref(), &addr, self.timeout).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckResult::fail(&entry, started.elapsed(), e.to_string())),
        };

        match self.handshake_not_after(&host, stream).await {
            Ok(not_after) => match judge_expiry(not_after, self.expiry_threshold) {
                Ok(days) => Ok(CheckResult::ok(
                    &entry,
                    started.elapsed(),
                    format!("certificate valid for {} days", days),
                )),
                Err(message) => Ok(CheckResult::fail(&entry, started.elapsed(), message)),
            },
            Err(message) => Ok(CheckResult::fail(&entry, started.elapsed(), message)),
        }
    }

    async fn handshake_not_after(
        &self,
        host: &str,
        stream: BoxedStream,
    ) -> Result<DateTime<Utc>, String> {
        let connector = TlsConnector::from(tls_client_config(self.insecure_skip_verify));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| format!("invalid server name {:?}", host))?;
        let tls = tokio::time::timeout(self.timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| "tls handshake timed out".to_string())?
            .map_err(|e| format!("tls handshake: {}", e))?;

        let (_, connection) = tls.get_ref();
        let certs = connection
            .peer_certificates()
            .ok_or_else(|| "peer presented no certificates".to_string())?;
        let first = certs
            .first()
            .ok_or_else(|| "peer presented no certificates".to_string())?;
        certificate_not_after(first)
    }
}

#[async_trait]
impl Probe for TlsProbe {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn check(
        &self,
        ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError> {
        if let Some(pending) = tunnel_gate(self.tunnel.as_ref(), target).await {
            return Ok(pending);
        }
        let work = fan_out(target, self.mode, |entry| self.check_one(entry));
        match cancellable(ctx, target, work).await {
            Ok(result) => result,
            Err(interrupted) => Ok(interrupted),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_target_mode(&mut self, mode: TargetMode) {
        self.mode = mode;
    }

    fn set_tunnel(&mut self, tunnel: Arc<dyn Tunnel>) {
        self.tunnel = Some(tunnel);
    }

    fn set_dialer(&mut self, dial: DialFn) {
        self.dialer = Some(dial);
    }
}
