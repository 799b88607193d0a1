//! TLS handshake support (behind the `tls` feature).

#[cfg(feature = "tls")]
pub(crate) use enabled::handshake;

#[cfg(not(feature = "tls"))]
pub(crate) use disabled::handshake;

#[cfg(feature = "tls")]
mod enabled {
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
    use tokio_rustls::rustls::{
        Certificate, ClientConfig as RustlsConfig, OwnedTrustAnchor, PrivateKey, RootCertStore,
        ServerName,
    };
    use tokio_rustls::TlsConnector;

    use couchbase_core::{CouchbaseError, Result};

    use crate::config::ClientConfig;

    /// Runs the TLS client handshake against the node hostname.
    pub(crate) async fn handshake(
        stream: TcpStream,
        host: &str,
        config: &ClientConfig,
    ) -> Result<TlsStream<TcpStream>> {
        let tls_config = build_config(config)?;
        let server_name = ServerName::try_from(host).map_err(|e| {
            CouchbaseError::TlsHandshake(format!("invalid server name {:?}: {}", host, e))
        })?;

        TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, stream)
            .await
            .map_err(|e| CouchbaseError::TlsHandshake(format!("handshake with {}: {}", host, e)))
    }

    fn build_config(config: &ClientConfig) -> Result<RustlsConfig> {
        let options = config.tls();

        if options.enable_certificate_revocation() {
            // The rustls backend has no online revocation checking; the
            // option is accepted so configs stay portable, and flagged here.
            tracing::warn!("certificate revocation checking is not supported by this TLS backend");
        }

        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));

        let builder = RustlsConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);

        let mut tls_config = if options.enable_certificate_authentication() {
            let (certs, key) = load_client_identity(options)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| CouchbaseError::Certificate(format!("client identity: {}", e)))?
        } else {
            builder.with_no_client_auth()
        };

        if options.ignore_remote_certificate_name_mismatch() {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyName));
        }

        Ok(tls_config)
    }

    fn load_client_identity(
        options: &crate::config::TlsOptions,
    ) -> Result<(Vec<Certificate>, PrivateKey)> {
        let cert_path = options.certificate_path().ok_or_else(|| {
            CouchbaseError::Certificate("certificate authentication without a certificate".into())
        })?;
        let key_path = options.private_key_path().ok_or_else(|| {
            CouchbaseError::Certificate("certificate authentication without a key".into())
        })?;

        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            CouchbaseError::Certificate(format!("read {}: {}", cert_path.display(), e))
        })?;
        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .map_err(|e| CouchbaseError::Certificate(format!("parse certificate: {}", e)))?
            .into_iter()
            .map(Certificate)
            .collect::<Vec<_>>();
        if certs.is_empty() {
            return Err(CouchbaseError::Certificate(format!(
                "{} holds no certificates",
                cert_path.display()
            )));
        }

        let key_pem = std::fs::read(key_path).map_err(|e| {
            CouchbaseError::Certificate(format!("read {}: {}", key_path.display(), e))
        })?;
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
            .map_err(|e| CouchbaseError::Certificate(format!("parse private key: {}", e)))?;
        if keys.is_empty() {
            keys = rustls_pemfile::rsa_private_keys(&mut key_pem.as_slice())
                .map_err(|e| CouchbaseError::Certificate(format!("parse private key: {}", e)))?;
        }
        let key = keys.into_iter().next().ok_or_else(|| {
            CouchbaseError::Certificate(format!("{} holds no private key", key_path.display()))
        })?;

        Ok((certs, PrivateKey(key)))
    }

    /// Verifier used when the name-mismatch override is on: the chain is
    /// not validated against the hostname.
    struct AcceptAnyName;

    impl ServerCertVerifier for AcceptAnyName {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: std::time::SystemTime,
        ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
    }
}

#[cfg(not(feature = "tls"))]
mod disabled {
    use tokio::net::TcpStream;

    use couchbase_core::{CouchbaseError, Result};

    use crate::config::ClientConfig;

    /// Stub used when the crate is built without the `tls` feature.
    pub(crate) async fn handshake(
        _stream: TcpStream,
        host: &str,
        _config: &ClientConfig,
    ) -> Result<TcpStream> {
        Err(CouchbaseError::Configuration(format!(
            "TLS to {} requested but the client was built without the `tls` feature",
            host
        )))
    }
}
