//! TLS transport with channel binding.
//!
//! The TLS layer is anonymous: servers present a throwaway
//! self-signed certificate and clients accept any certificate. Peers prove
//! who they are at the application layer by signing (sync) or HMAC-ing
//! (pairing) the channel binding, a value exported from this exact TLS 1.3
//! session, so a proof cannot be replayed over another connection.

use pvault_core::{VaultError, VaultResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

/// RFC 9266 exporter label
pub const EXPORTER_LABEL: &[u8] = b"EXPORTER-Channel-Binding";

/// Length of an exported channel binding
pub const BINDING_LEN: usize = 32;

/// Keying material unique to one TLS session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding(pub [u8; BINDING_LEN]);

impl ChannelBinding {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelBinding({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(context: &str) -> impl Fn(rustls::Error) -> VaultError + '_ {
    move |e| VaultError::Platform(format!("{context}: {e}"))
}

/// Server config with a fresh self-signed certificate. TLS 1.3 only, since the
/// channel binding relies on the 1.3 exporter.
pub fn server_config() -> VaultResult<Arc<ServerConfig>> {
    let certified = rcgen::generate_simple_self_signed(vec![crate::wire::HOST.to_string()])
        .map_err(|e| VaultError::Platform(format!("generating TLS certificate: {e}")))?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err("TLS server versions"))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(tls_err("TLS server certificate"))?;
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate.
pub fn client_config() -> VaultResult<Arc<ClientConfig>> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err("TLS client versions"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyServerCert(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Accepts every certificate but still checks handshake signatures, so the
/// server must hold the key of the certificate it presented.
#[derive(Debug)]
struct AnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn exported(material: Result<[u8; BINDING_LEN], rustls::Error>) -> VaultResult<ChannelBinding> {
    material
        .map(ChannelBinding)
        .map_err(tls_err("exporting channel binding"))
}

/// Complete a server-side handshake.
pub async fn accept(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
) -> VaultResult<(server::TlsStream<TcpStream>, ChannelBinding)> {
    let stream = acceptor
        .accept(tcp)
        .await
        .map_err(|e| VaultError::Remote(format!("TLS accept: {e}")))?;
    let binding = exported(stream.get_ref().1.export_keying_material(
        [0u8; BINDING_LEN],
        EXPORTER_LABEL,
        None,
    ))?;
    Ok((stream, binding))
}

/// Dial `address` and complete a client-side handshake within `timeout`.
pub async fn connect(
    connector: &TlsConnector,
    address: &str,
    timeout: Duration,
) -> VaultResult<(client::TlsStream<TcpStream>, ChannelBinding)> {
    let handshake = async {
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| VaultError::Remote(format!("connect {address}: {e}")))?;
        tcp.set_nodelay(true)?;
        let name = ServerName::try_from(crate::wire::HOST)
            .map_err(|e| VaultError::Platform(format!("server name: {e}")))?;
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| VaultError::Remote(format!("TLS handshake with {address}: {e}")))?;
        Ok::<_, VaultError>(stream)
    };
    let stream = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| VaultError::Remote(format!("connect {address}: timed out")))??;
    let binding = exported(stream.get_ref().1.export_keying_material(
        [0u8; BINDING_LEN],
        EXPORTER_LABEL,
        None,
    ))?;
    Ok((stream, binding))
}
